//! The VM code generator: lowers token regexes into a scanner DFA and
//! rule formers and guard actions into reduce-time bytecode.
use ahash::{AHashMap, AHashSet};

use crate::ast::KindMap;
use crate::errors::{ErrorHandler, ErrorType};
use crate::grammar::{library_token, Grammar, SymbolId};
use crate::syntax::{parse_regex, GrammarAst, SyntaxKind};
use crate::vm::{disassemble, CodeAssembler, CodeLabel, Opcode, Operand, VmInstruction, VmRegister};
use crate::DebugFlags;

/// Highest code point the scanner's range tables cover.
const MAX_CHAR: u32 = 0x10ffff;

/// Everything the code generator produces, ready to freeze into
/// [`ParserData`](crate::parser_data::ParserData).
#[derive(Debug, Default)]
pub(crate) struct CodeArtifacts {
    pub instructions: Vec<VmInstruction>,
    pub operands: Vec<i64>,
    pub registers: Vec<VmRegister>,
    pub strings: Vec<String>,
    pub rule_pc: Vec<i64>,
    pub scanner_pc: i64,
    pub ast_count: i64,
}

/// Lower the grammar's regexes, formers and guards into bytecode.
/// Diagnostics land in `errh`; the result is meaningless if any errors
/// were added.
pub(crate) fn generate_code(
    gram: &Grammar,
    kind_map: &mut KindMap,
    errh: &mut ErrorHandler,
    debug_flags: DebugFlags,
) -> CodeArtifacts {
    let mut generator = CodeGenerator {
        gram,
        kind_map,
        errh,
        asm: CodeAssembler::new(),
        registers: Vec::new(),
        register_by_name: AHashMap::new(),
        strings: Vec::new(),
        string_by_value: AHashMap::new(),
        debug_flags,
    };
    generator.generate()
}

struct CodeGenerator<'a> {
    gram: &'a Grammar,
    kind_map: &'a mut KindMap,
    errh: &'a mut ErrorHandler,
    asm: CodeAssembler,
    registers: Vec<VmRegister>,
    register_by_name: AHashMap<String, usize>,
    strings: Vec<String>,
    string_by_value: AHashMap<String, usize>,
    debug_flags: DebugFlags,
}

impl CodeGenerator<'_> {
    fn generate(mut self) -> CodeArtifacts {
        // Startup code occupies pc 0; registers are reset by the engine
        // before it runs.
        self.asm.emit(Opcode::Halt, -1, vec![]);

        let base_reg = self.register("ast_base", 0);

        // A shared empty body for rules with nothing to do on reduce.
        let empty_pc = self.asm.here() as i64;
        self.asm.emit(Opcode::Return, -1, vec![]);

        let mut rule_pc = Vec::with_capacity(self.gram.rules.len());
        for rule in &self.gram.rules {
            if rule.ast_former.is_none() && rule.action.is_none() {
                rule_pc.push(empty_pc);
                continue;
            }
            rule_pc.push(self.asm.here() as i64);
            if let Some(action) = &rule.action {
                self.compile_action(action);
            }
            if let Some(former) = &rule.ast_former {
                self.asm
                    .emit(Opcode::AstStart, rule.location, vec![Operand::Int(base_reg as i64)]);
                self.compile_former(former, rule.rhs.len(), base_reg, 0);
                self.asm.emit(
                    Opcode::AstFinish,
                    rule.location,
                    vec![Operand::Int(rule.rhs.len() as i64)],
                );
            }
            self.asm.emit(Opcode::Return, rule.location, vec![]);
        }

        let scanner_pc = self.asm.here() as i64;
        self.compile_scanner();

        let (instructions, operands) = self.asm.assemble();
        if self.debug_flags.has(DebugFlags::ICODE) {
            log::debug!(
                target: "hoshi::codegen",
                "bytecode:\n{}",
                disassemble(&instructions, &operands)
            );
        }
        CodeArtifacts {
            instructions,
            operands,
            registers: self.registers,
            strings: self.strings,
            rule_pc,
            scanner_pc,
            ast_count: 1,
        }
    }

    //
    //  Registers and strings
    //

    fn register(&mut self, name: &str, initial_value: i64) -> usize {
        if let Some(&index) = self.register_by_name.get(name) {
            return index;
        }
        self.registers.push(VmRegister {
            name: name.to_string(),
            initial_value,
        });
        let index = self.registers.len() - 1;
        self.register_by_name.insert(name.to_string(), index);
        index
    }

    /// Constants materialize as registers holding their initial value.
    fn constant(&mut self, value: i64) -> usize {
        self.register(&format!("const_{value}"), value)
    }

    fn temp(&mut self) -> usize {
        let name = format!("temp_{}", self.registers.len());
        self.register(&name, 0)
    }

    fn string(&mut self, value: &str) -> usize {
        if let Some(&index) = self.string_by_value.get(value) {
            return index;
        }
        self.strings.push(value.to_string());
        let index = self.strings.len() - 1;
        self.string_by_value.insert(value.to_string(), index);
        index
    }

    //
    //  AST formers
    //

    /// Compile one former: open a child list, build the children, form
    /// the node, then apply its attribute items.
    fn compile_former(&mut self, former: &GrammarAst, rule_size: usize, base_reg: usize, depth: usize) {
        let mark_reg = self.register(&format!("ast_mark_{depth}"), 0);
        self.asm
            .emit(Opcode::AstNew, former.location, vec![Operand::Int(mark_reg as i64)]);

        let kind_name = former.child(0).lexeme.clone();
        let kind_num = self.kind_map.kind_force(&kind_name);

        let mut attribute_items = vec![];
        for item in &former.children[1..] {
            match item.kind {
                SyntaxKind::AstChild => self.compile_child_reference(item, rule_size, base_reg),
                SyntaxKind::AstFormer => {
                    self.compile_former(item, rule_size, base_reg, depth + 1)
                }
                SyntaxKind::AstLocation
                | SyntaxKind::AstLocationNum
                | SyntaxKind::AstLexeme
                | SyntaxKind::AstLexemeString => attribute_items.push(item),
                kind => panic!("no code generator for former item {kind:?}"),
            }
        }

        self.asm.emit(
            Opcode::AstForm,
            former.location,
            vec![
                Operand::Int(base_reg as i64),
                Operand::Int(mark_reg as i64),
                Operand::Int(rule_size as i64),
            ],
        );
        self.asm.emit(
            Opcode::AstKindNum,
            former.location,
            vec![Operand::Int(kind_num as i64)],
        );

        let mut location_items = 0;
        let mut lexeme_items = 0;
        for item in attribute_items {
            match item.kind {
                SyntaxKind::AstLocation => {
                    location_items += 1;
                    self.compile_trail(item.child(0), rule_size, base_reg);
                    self.asm
                        .emit(Opcode::AstLocation, item.location, vec![Operand::Int(0)]);
                }
                SyntaxKind::AstLocationNum => {
                    location_items += 1;
                    let value = integer_value(item.child(0));
                    self.asm.emit(
                        Opcode::AstLocationNum,
                        item.location,
                        vec![Operand::Int(value)],
                    );
                }
                SyntaxKind::AstLexeme => {
                    lexeme_items += 1;
                    self.compile_trail(item.child(0), rule_size, base_reg);
                    self.asm
                        .emit(Opcode::AstLexeme, item.location, vec![Operand::Int(0)]);
                }
                SyntaxKind::AstLexemeString => {
                    lexeme_items += 1;
                    let string_num = self.string(&item.child(0).lexeme);
                    self.asm.emit(
                        Opcode::AstLexemeString,
                        item.location,
                        vec![Operand::Int(string_num as i64)],
                    );
                }
                _ => unreachable!(),
            }
            if location_items > 1 || lexeme_items > 1 {
                self.errh.add_error(
                    ErrorType::DupAstItem,
                    item.location,
                    "Duplicate attribute item in Ast former",
                );
            }
        }
    }

    /// Load a dot path into AST slot 0. Surface indices are 1-based;
    /// negative indices pass through and wrap at run time.
    fn compile_trail(&mut self, dot: &GrammarAst, rule_size: usize, base_reg: usize) {
        let first = integer_value(dot.child(0));
        let offset = if first > 0 {
            first - rule_size as i64 - 1
        } else {
            first
        };
        self.asm.emit(
            Opcode::AstLoad,
            dot.location,
            vec![
                Operand::Int(0),
                Operand::Int(base_reg as i64),
                Operand::Int(offset),
            ],
        );
        for component in &dot.children[1..] {
            let value = integer_value(component);
            let index = if value > 0 { value - 1 } else { value };
            self.asm.emit(
                Opcode::AstIndex,
                component.location,
                vec![Operand::Int(0), Operand::Int(index)],
            );
        }
    }

    fn compile_child_reference(&mut self, item: &GrammarAst, rule_size: usize, base_reg: usize) {
        self.compile_trail(item.child(0), rule_size, base_reg);
        let slice = item.child(1);
        if slice.is_null() {
            self.asm
                .emit(Opcode::AstChild, item.location, vec![Operand::Int(0)]);
        } else {
            let first = integer_value(slice.child(0));
            let last = integer_value(slice.child(1));
            let first = if first > 0 { first - 1 } else { first };
            let last = if last > 0 { last - 1 } else { last };
            self.asm.emit(
                Opcode::AstChildSlice,
                item.location,
                vec![Operand::Int(0), Operand::Int(first), Operand::Int(last)],
            );
        }
    }

    //
    //  Guard actions
    //

    fn compile_action(&mut self, action: &GrammarAst) {
        for statement in &action.children {
            match statement.kind {
                SyntaxKind::ActionAssign => {
                    let target = statement.child(0).lexeme.clone();
                    let target_reg = self.register(&target, 0);
                    let value_reg = self.compile_expr(statement.child(1));
                    self.asm.emit(
                        Opcode::Assign,
                        statement.location,
                        vec![Operand::Int(target_reg as i64), Operand::Int(value_reg as i64)],
                    );
                }
                SyntaxKind::ActionDumpStack => {
                    self.asm.emit(Opcode::DumpStack, statement.location, vec![]);
                }
                kind => panic!("no code generator for action statement {kind:?}"),
            }
        }
    }

    fn compile_expr(&mut self, expr: &GrammarAst) -> usize {
        match expr.kind {
            SyntaxKind::Integer => self.constant(integer_value(expr)),
            SyntaxKind::NegativeInteger => self.constant(integer_value(expr)),
            SyntaxKind::Identifier => self.register(&expr.lexeme, 0),
            SyntaxKind::ActionAdd
            | SyntaxKind::ActionSubtract
            | SyntaxKind::ActionMultiply
            | SyntaxKind::ActionDivide => {
                let opcode = match expr.kind {
                    SyntaxKind::ActionAdd => Opcode::Add,
                    SyntaxKind::ActionSubtract => Opcode::Subtract,
                    SyntaxKind::ActionMultiply => Opcode::Multiply,
                    _ => Opcode::Divide,
                };
                let left = self.compile_expr(expr.child(0));
                let right = self.compile_expr(expr.child(1));
                let result = self.temp();
                self.asm.emit(
                    opcode,
                    expr.location,
                    vec![
                        Operand::Int(result as i64),
                        Operand::Int(left as i64),
                        Operand::Int(right as i64),
                    ],
                );
                result
            }
            SyntaxKind::ActionUnaryMinus => {
                let operand = self.compile_expr(expr.child(0));
                let result = self.temp();
                self.asm.emit(
                    Opcode::UnaryMinus,
                    expr.location,
                    vec![Operand::Int(result as i64), Operand::Int(operand as i64)],
                );
                result
            }
            SyntaxKind::ActionEqual
            | SyntaxKind::ActionNotEqual
            | SyntaxKind::ActionLessThan
            | SyntaxKind::ActionLessEqual
            | SyntaxKind::ActionGreaterThan
            | SyntaxKind::ActionGreaterEqual => {
                let opcode = match expr.kind {
                    SyntaxKind::ActionEqual => Opcode::BranchEqual,
                    SyntaxKind::ActionNotEqual => Opcode::BranchNotEqual,
                    SyntaxKind::ActionLessThan => Opcode::BranchLessThan,
                    SyntaxKind::ActionLessEqual => Opcode::BranchLessEqual,
                    SyntaxKind::ActionGreaterThan => Opcode::BranchGreaterThan,
                    _ => Opcode::BranchGreaterEqual,
                };
                let left = self.compile_expr(expr.child(0));
                let right = self.compile_expr(expr.child(1));
                let result = self.temp();
                let one = self.constant(1);
                let zero = self.constant(0);
                let done = self.asm.new_label();
                self.assign(result, one, expr.location);
                self.asm.emit(
                    opcode,
                    expr.location,
                    vec![
                        Operand::Lab(done),
                        Operand::Int(left as i64),
                        Operand::Int(right as i64),
                    ],
                );
                self.assign(result, zero, expr.location);
                self.asm.bind(done);
                result
            }
            SyntaxKind::ActionAnd => {
                let left = self.compile_expr(expr.child(0));
                let right = self.compile_expr(expr.child(1));
                let result = self.temp();
                let one = self.constant(1);
                let zero = self.constant(0);
                let done = self.asm.new_label();
                self.assign(result, zero, expr.location);
                self.branch_equal(done, left, zero, expr.location);
                self.branch_equal(done, right, zero, expr.location);
                self.assign(result, one, expr.location);
                self.asm.bind(done);
                result
            }
            SyntaxKind::ActionOr => {
                let left = self.compile_expr(expr.child(0));
                let right = self.compile_expr(expr.child(1));
                let result = self.temp();
                let one = self.constant(1);
                let zero = self.constant(0);
                let done = self.asm.new_label();
                let from_left = self.asm.new_label();
                self.assign(result, one, expr.location);
                self.asm.emit(
                    Opcode::BranchNotEqual,
                    expr.location,
                    vec![
                        Operand::Lab(from_left),
                        Operand::Int(left as i64),
                        Operand::Int(zero as i64),
                    ],
                );
                self.asm.emit(
                    Opcode::BranchNotEqual,
                    expr.location,
                    vec![
                        Operand::Lab(from_left),
                        Operand::Int(right as i64),
                        Operand::Int(zero as i64),
                    ],
                );
                self.assign(result, zero, expr.location);
                self.asm.bind(from_left);
                self.asm.bind(done);
                result
            }
            SyntaxKind::ActionNot => {
                let operand = self.compile_expr(expr.child(0));
                let result = self.temp();
                let one = self.constant(1);
                let zero = self.constant(0);
                let done = self.asm.new_label();
                self.assign(result, one, expr.location);
                self.branch_equal(done, operand, zero, expr.location);
                self.assign(result, zero, expr.location);
                self.asm.bind(done);
                result
            }
            kind => panic!("no code generator for action expression {kind:?}"),
        }
    }

    fn assign(&mut self, target: usize, source: usize, location: i64) {
        self.asm.emit(
            Opcode::Assign,
            location,
            vec![Operand::Int(target as i64), Operand::Int(source as i64)],
        );
    }

    fn branch_equal(&mut self, target: CodeLabel, left: usize, right: usize, location: i64) {
        self.asm.emit(
            Opcode::BranchEqual,
            location,
            vec![
                Operand::Lab(target),
                Operand::Int(left as i64),
                Operand::Int(right as i64),
            ],
        );
    }

    //
    //  Scanner
    //

    /// Merge every scanned token's regex into one DFA and lower it to
    /// `ScanChar` dispatch tables with per-token commit blocks.
    fn compile_scanner(&mut self) {
        let scanner_entry = self.asm.new_label();
        self.asm.bind(scanner_entry);
        self.asm.emit(Opcode::ScanStart, -1, vec![]);

        let mut nfa = Nfa::new();
        let combined_start = nfa.state();
        let mut scanned = vec![];
        for id in self.gram.symbol_ids() {
            let data = self.gram.symbol(id);
            if !data.is_scanned {
                continue;
            }
            let Some(regex_list) = &data.regex else {
                continue;
            };
            let regex = regex_list.child(0).child(1);
            let mut macros = Vec::new();
            let Some(ir) = self.lower_regex(regex, &mut macros) else {
                continue;
            };
            if ir.matches_empty() {
                self.errh.add_error(
                    ErrorType::CharacterRange,
                    data.location,
                    &format!(
                        "Token {} can match the empty string",
                        self.gram.symbol_name(id)
                    ),
                );
                continue;
            }
            let (start, end) = nfa.add_fragment(&ir);
            nfa.states[combined_start].epsilon.push(start);
            nfa.states[end].accept = Some(id);
            scanned.push(id);
        }

        let dfa = nfa.determinize(combined_start, |left, right| {
            self.pick_accept(left, right)
        });
        if self.debug_flags.has(DebugFlags::SCANNER) {
            log::debug!(
                target: "hoshi::codegen",
                "scanner dfa: {} states over {} tokens",
                dfa.len(),
                scanned.len()
            );
        }

        // Commit blocks, one per scanned token.
        let mut commit_labels = AHashMap::new();
        for &id in &scanned {
            let label = self.asm.new_label();
            commit_labels.insert(id, label);
        }

        // DFA states lower to an optional accept marker and a
        // binary-searchable range dispatch.
        let state_labels: Vec<CodeLabel> = dfa.iter().map(|_| self.asm.new_label()).collect();
        for (index, state) in dfa.iter().enumerate() {
            self.asm.bind(state_labels[index]);
            if let Some(symbol) = state.accept {
                let symbol_num = self.gram.symbol(symbol).symbol_num;
                self.asm.emit(
                    Opcode::ScanAccept,
                    -1,
                    vec![
                        Operand::Int(symbol_num),
                        Operand::Lab(commit_labels[&symbol]),
                    ],
                );
            }
            let mut operands = vec![Operand::Int(state.transitions.len() as i64)];
            for &(low, high, target) in &state.transitions {
                operands.push(Operand::Int(low as i64));
                operands.push(Operand::Int(high as i64));
                operands.push(Operand::Lab(state_labels[target]));
            }
            self.asm.emit(Opcode::ScanChar, -1, operands);
        }

        for &id in &scanned {
            self.asm.bind(commit_labels[&id]);
            let data = self.gram.symbol(id);
            if let Some(action) = data.action.clone() {
                self.compile_action(&action);
            }
            if data.is_error {
                let string_num = self.string(&data.error_message.clone());
                self.asm.emit(
                    Opcode::ScanError,
                    data.location,
                    vec![Operand::Int(string_num as i64)],
                );
                self.asm.emit(Opcode::Return, -1, vec![]);
            } else if data.is_ignored {
                // Skip the lexeme and scan again.
                self.asm
                    .emit(Opcode::Branch, -1, vec![Operand::Lab(scanner_entry)]);
            } else {
                self.asm.emit(Opcode::ScanToken, -1, vec![]);
                self.asm.emit(Opcode::Return, -1, vec![]);
            }
        }
    }

    /// Resolve an accept tie: higher precedence wins, an exact tie
    /// between different tokens is a grammar error.
    fn pick_accept(&mut self, left: SymbolId, right: SymbolId) -> SymbolId {
        if left == right {
            return left;
        }
        let left_precedence = self.gram.symbol(left).precedence;
        let right_precedence = self.gram.symbol(right).precedence;
        if left_precedence > right_precedence {
            left
        } else if right_precedence > left_precedence {
            right
        } else {
            self.errh.add_error(
                ErrorType::RegexConflict,
                self.gram.symbol(right).location,
                &format!(
                    "Tokens {} and {} match the same text with equal precedence",
                    self.gram.symbol_name(left),
                    self.gram.symbol_name(right)
                ),
            );
            left.min(right)
        }
    }

    /// Lower a regex surface tree into range form, expanding `{name}`
    /// macros against declared tokens and the library.
    fn lower_regex(&mut self, node: &GrammarAst, macros: &mut Vec<String>) -> Option<RegexIr> {
        match node.kind {
            SyntaxKind::Regex => self.lower_regex(node.child(0), macros),
            SyntaxKind::RegexOr => {
                let mut alternatives = Vec::with_capacity(node.children.len());
                for child in &node.children {
                    alternatives.push(self.lower_regex(child, macros)?);
                }
                Some(RegexIr::Alt(alternatives))
            }
            SyntaxKind::RegexList => {
                let mut items = Vec::with_capacity(node.children.len());
                for child in &node.children {
                    items.push(self.lower_regex(child, macros)?);
                }
                Some(RegexIr::Seq(items))
            }
            SyntaxKind::RegexOptional => {
                Some(RegexIr::Opt(Box::new(self.lower_regex(node.child(0), macros)?)))
            }
            SyntaxKind::RegexZeroClosure => {
                Some(RegexIr::Star(Box::new(self.lower_regex(node.child(0), macros)?)))
            }
            SyntaxKind::RegexOneClosure => {
                Some(RegexIr::Plus(Box::new(self.lower_regex(node.child(0), macros)?)))
            }
            SyntaxKind::RegexChar => {
                let c = node.lexeme.chars().next().unwrap() as u32;
                Some(RegexIr::Class(vec![(c, c)]))
            }
            SyntaxKind::RegexWildcard => {
                Some(RegexIr::Class(invert_ranges(&[('\n' as u32, '\n' as u32)])))
            }
            SyntaxKind::RegexWhitespace => Some(RegexIr::Class(whitespace_ranges())),
            SyntaxKind::RegexNotWhitespace => {
                Some(RegexIr::Class(invert_ranges(&whitespace_ranges())))
            }
            SyntaxKind::RegexDigits => Some(RegexIr::Class(vec![('0' as u32, '9' as u32)])),
            SyntaxKind::RegexNotDigits => {
                Some(RegexIr::Class(invert_ranges(&[('0' as u32, '9' as u32)])))
            }
            SyntaxKind::Charset | SyntaxKind::CharsetInvert => {
                let mut ranges = vec![];
                for item in &node.children {
                    match item.kind {
                        SyntaxKind::CharsetRange => {
                            let low = item.child(0).lexeme.chars().next().unwrap() as u32;
                            let high = if item.children.len() > 1 {
                                item.child(1).lexeme.chars().next().unwrap() as u32
                            } else {
                                low
                            };
                            if low > high {
                                self.errh.add_error(
                                    ErrorType::CharacterRange,
                                    item.location,
                                    "Character range has its bounds reversed",
                                );
                                return None;
                            }
                            ranges.push((low, high));
                        }
                        SyntaxKind::CharsetWhitespace => ranges.extend(whitespace_ranges()),
                        SyntaxKind::CharsetNotWhitespace => {
                            ranges.extend(invert_ranges(&whitespace_ranges()))
                        }
                        SyntaxKind::CharsetDigits => ranges.push(('0' as u32, '9' as u32)),
                        SyntaxKind::CharsetNotDigits => {
                            ranges.extend(invert_ranges(&[('0' as u32, '9' as u32)]))
                        }
                        kind => panic!("no code generator for charset item {kind:?}"),
                    }
                }
                let ranges = normalize_ranges(ranges);
                if node.kind == SyntaxKind::CharsetInvert {
                    Some(RegexIr::Class(invert_ranges(&ranges)))
                } else {
                    Some(RegexIr::Class(ranges))
                }
            }
            SyntaxKind::MacroString => self.expand_macro(node, macros),
            kind => panic!("no code generator for regex node {kind:?}"),
        }
    }

    fn expand_macro(&mut self, node: &GrammarAst, macros: &mut Vec<String>) -> Option<RegexIr> {
        let name = node.lexeme.clone();
        if macros.contains(&name) {
            self.errh.add_error(
                ErrorType::UnknownMacro,
                node.location,
                &format!("Macro {{{name}}} expands through itself"),
            );
            return None;
        }
        macros.push(name.clone());
        let result = if let Some(symbol) = self.gram.lookup_symbol(&format!("<{name}>")) {
            match &self.gram.symbol(symbol).regex {
                Some(regex_list) => {
                    let regex = regex_list.child(0).child(1).clone();
                    self.lower_regex(&regex, macros)
                }
                None => None,
            }
        } else if let Some(token) = library_token(&name) {
            match parse_regex(token.regex) {
                Ok(mut regex) => {
                    regex.set_all_locations(node.location);
                    self.lower_regex(&regex, macros)
                }
                Err(message) => panic!("library regex failed to parse: {message}"),
            }
        } else {
            self.errh.add_error(
                ErrorType::UnknownMacro,
                node.location,
                &format!("Unknown macro {{{name}}}"),
            );
            None
        };
        macros.pop();
        result
    }
}

fn integer_value(node: &GrammarAst) -> i64 {
    let value: i64 = node.lexeme.parse().unwrap_or(0);
    if node.kind == SyntaxKind::NegativeInteger {
        -value
    } else {
        value
    }
}

fn whitespace_ranges() -> Vec<(u32, u32)> {
    vec![(0x09, 0x0d), (0x20, 0x20)]
}

/// Sort and merge overlapping or adjacent ranges.
fn normalize_ranges(mut ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    ranges.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for (low, high) in ranges {
        match merged.last_mut() {
            Some(last) if low <= last.1.saturating_add(1) => last.1 = last.1.max(high),
            _ => merged.push((low, high)),
        }
    }
    merged
}

fn invert_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let ranges = normalize_ranges(ranges.to_vec());
    let mut inverted = vec![];
    let mut next = 0u32;
    for &(low, high) in &ranges {
        if low > next {
            inverted.push((next, low - 1));
        }
        next = high.saturating_add(1);
    }
    if next <= MAX_CHAR {
        inverted.push((next, MAX_CHAR));
    }
    inverted
}

/// Range form of a token regex, ready for NFA construction.
#[derive(Debug, Clone)]
enum RegexIr {
    Alt(Vec<RegexIr>),
    Seq(Vec<RegexIr>),
    Opt(Box<RegexIr>),
    Star(Box<RegexIr>),
    Plus(Box<RegexIr>),
    Class(Vec<(u32, u32)>),
}

impl RegexIr {
    fn matches_empty(&self) -> bool {
        match self {
            RegexIr::Alt(alternatives) => alternatives.iter().any(RegexIr::matches_empty),
            RegexIr::Seq(items) => items.iter().all(RegexIr::matches_empty),
            RegexIr::Opt(_) | RegexIr::Star(_) => true,
            RegexIr::Plus(inner) => inner.matches_empty(),
            RegexIr::Class(_) => false,
        }
    }
}

#[derive(Debug, Default)]
struct NfaState {
    edges: Vec<(u32, u32, usize)>,
    epsilon: Vec<usize>,
    accept: Option<SymbolId>,
}

#[derive(Debug, Default)]
struct Nfa {
    states: Vec<NfaState>,
}

/// One determinized scanner state: disjoint range transitions sorted by
/// low bound, plus the token accepted here, if any.
#[derive(Debug)]
struct DfaState {
    transitions: Vec<(u32, u32, usize)>,
    accept: Option<SymbolId>,
}

impl Nfa {
    fn new() -> Nfa {
        Nfa::default()
    }

    fn state(&mut self) -> usize {
        self.states.push(NfaState::default());
        self.states.len() - 1
    }

    /// Thompson construction: one fragment per regex, with a single
    /// entry and exit state.
    fn add_fragment(&mut self, ir: &RegexIr) -> (usize, usize) {
        match ir {
            RegexIr::Class(ranges) => {
                let start = self.state();
                let end = self.state();
                for &(low, high) in ranges {
                    self.states[start].edges.push((low, high, end));
                }
                (start, end)
            }
            RegexIr::Seq(items) => {
                let start = self.state();
                let mut current = start;
                for item in items {
                    let (item_start, item_end) = self.add_fragment(item);
                    self.states[current].epsilon.push(item_start);
                    current = item_end;
                }
                (start, current)
            }
            RegexIr::Alt(alternatives) => {
                let start = self.state();
                let end = self.state();
                for alternative in alternatives {
                    let (alt_start, alt_end) = self.add_fragment(alternative);
                    self.states[start].epsilon.push(alt_start);
                    self.states[alt_end].epsilon.push(end);
                }
                (start, end)
            }
            RegexIr::Opt(inner) => {
                let (start, end) = self.add_fragment(inner);
                self.states[start].epsilon.push(end);
                (start, end)
            }
            RegexIr::Star(inner) => {
                let hub = self.state();
                let (start, end) = self.add_fragment(inner);
                self.states[hub].epsilon.push(start);
                self.states[end].epsilon.push(hub);
                (hub, hub)
            }
            RegexIr::Plus(inner) => {
                let (start, end) = self.add_fragment(inner);
                self.states[end].epsilon.push(start);
                (start, end)
            }
        }
    }

    fn epsilon_closure(&self, seed: &[usize]) -> Vec<usize> {
        let mut closure: AHashSet<usize> = seed.iter().copied().collect();
        let mut workpile: Vec<usize> = seed.to_vec();
        while let Some(state) = workpile.pop() {
            for &next in &self.states[state].epsilon {
                if closure.insert(next) {
                    workpile.push(next);
                }
            }
        }
        let mut closure: Vec<usize> = closure.into_iter().collect();
        closure.sort_unstable();
        closure
    }

    /// Subset construction over code-point ranges. `pick` resolves
    /// competing accepts.
    fn determinize(
        &self,
        start: usize,
        mut pick: impl FnMut(SymbolId, SymbolId) -> SymbolId,
    ) -> Vec<DfaState> {
        let mut dfa: Vec<DfaState> = vec![];
        let mut interned: AHashMap<Vec<usize>, usize> = AHashMap::new();
        let start_set = self.epsilon_closure(&[start]);
        interned.insert(start_set.clone(), 0);
        dfa.push(DfaState {
            transitions: vec![],
            accept: self.accept_of(&start_set, &mut pick),
        });
        let mut workpile = vec![start_set];
        let mut done = 0;
        while done < workpile.len() {
            let members = workpile[done].clone();
            let index = interned[&members];
            done += 1;

            // Split the outgoing ranges into disjoint segments.
            let mut bounds = AHashSet::new();
            for &member in &members {
                for &(low, high, _) in &self.states[member].edges {
                    bounds.insert(low);
                    bounds.insert(high.saturating_add(1));
                }
            }
            let mut bounds: Vec<u32> = bounds.into_iter().collect();
            bounds.sort_unstable();

            let mut transitions: Vec<(u32, u32, usize)> = vec![];
            for window in bounds.windows(2) {
                let (low, next_bound) = (window[0], window[1]);
                let high = next_bound - 1;
                let mut targets = vec![];
                for &member in &members {
                    for &(edge_low, edge_high, target) in &self.states[member].edges {
                        if edge_low <= low && high <= edge_high {
                            targets.push(target);
                        }
                    }
                }
                if targets.is_empty() {
                    continue;
                }
                let closure = self.epsilon_closure(&targets);
                let target_index = match interned.get(&closure) {
                    Some(&index) => index,
                    None => {
                        let index = dfa.len();
                        interned.insert(closure.clone(), index);
                        dfa.push(DfaState {
                            transitions: vec![],
                            accept: self.accept_of(&closure, &mut pick),
                        });
                        workpile.push(closure);
                        index
                    }
                };
                match transitions.last_mut() {
                    Some(last) if last.2 == target_index && last.1 + 1 == low => last.1 = high,
                    _ => transitions.push((low, high, target_index)),
                }
            }
            dfa[index].transitions = transitions;
        }
        dfa
    }

    fn accept_of(
        &self,
        members: &[usize],
        pick: &mut impl FnMut(SymbolId, SymbolId) -> SymbolId,
    ) -> Option<SymbolId> {
        let mut accept: Option<SymbolId> = None;
        for &member in members {
            if let Some(symbol) = self.states[member].accept {
                accept = Some(match accept {
                    Some(current) => pick(current, symbol),
                    None => symbol,
                });
            }
        }
        accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(text: &str) -> RegexIr {
        let regex = parse_regex(text).unwrap();
        let gram = Grammar::new();
        let mut kinds = KindMap::new();
        let mut errh = ErrorHandler::new();
        let mut generator = CodeGenerator {
            gram: &gram,
            kind_map: &mut kinds,
            errh: &mut errh,
            asm: CodeAssembler::new(),
            registers: Vec::new(),
            register_by_name: AHashMap::new(),
            strings: Vec::new(),
            string_by_value: AHashMap::new(),
            debug_flags: DebugFlags::NONE,
        };
        generator.lower_regex(&regex, &mut Vec::new()).unwrap()
    }

    #[test]
    fn range_normalization() {
        assert_eq!(
            normalize_ranges(vec![(10, 20), (5, 12), (22, 23), (21, 21)]),
            vec![(5, 23)]
        );
        let inverted = invert_ranges(&[(0, 9), (20, MAX_CHAR)]);
        assert_eq!(inverted, vec![(10, 19)]);
    }

    #[test]
    fn empty_match_detection() {
        assert!(class("a*").matches_empty());
        assert!(class("a? b?").matches_empty());
        assert!(!class("a+").matches_empty());
        assert!(!class("a | bc").matches_empty());
    }

    #[test]
    fn determinization_finds_longest_accepts() {
        let ir = class("ab | a");
        let mut nfa = Nfa::new();
        let start = nfa.state();
        let (fragment_start, end) = nfa.add_fragment(&ir);
        nfa.states[start].epsilon.push(fragment_start);
        nfa.states[end].accept = Some(SymbolId(7));
        let dfa = nfa.determinize(start, |left, _| left);
        // Walk "ab": both prefixes accept.
        let after_a = dfa[0]
            .transitions
            .iter()
            .find(|&&(low, high, _)| low <= 'a' as u32 && 'a' as u32 <= high)
            .unwrap()
            .2;
        assert_eq!(dfa[after_a].accept, Some(SymbolId(7)));
        let after_b = dfa[after_a]
            .transitions
            .iter()
            .find(|&&(low, high, _)| low <= 'b' as u32 && 'b' as u32 <= high)
            .unwrap()
            .2;
        assert_eq!(dfa[after_b].accept, Some(SymbolId(7)));
    }
}
