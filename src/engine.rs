//! The execution engine: the LALR(k) driver loop and the bytecode VM
//! that scans tokens, builds ASTs and evaluates guards.
use ahash::AHashMap;

use crate::ast::Ast;
use crate::errors::{ErrorHandler, ErrorType, HoshiError};
use crate::lalr::ActionType;
use crate::parser_data::ParserData;
use crate::source::{to_ascii_chop, SourceBuffer};
use crate::vm::Opcode;
use crate::DebugFlags;

#[derive(Debug, Clone, Default)]
struct Token {
    symbol_num: i64,
    lexeme: String,
    location: i64,
}

/// Where a subtree is after having been moved out of its stack slot.
#[derive(Debug, Clone)]
struct MovedTo {
    stack_index: usize,
    inner_path: Vec<usize>,
}

/// A transient reference into a stacked subtree, built by `AstLoad` and
/// extended by `AstIndex`.
#[derive(Debug, Clone, Default)]
struct AstRef {
    base: usize,
    path: Vec<usize>,
}

/// One parse over one source. The engine owns its stacks and register
/// file; everything it reads from [`ParserData`] is immutable.
pub(crate) struct ParserEngine<'a> {
    prsd: &'a ParserData,
    src: &'a SourceBuffer,
    errh: &'a mut ErrorHandler,
    debug_flags: DebugFlags,

    token_buffer: Vec<Token>,
    token_front: usize,
    token_rear: usize,
    token_current: usize,

    scan_start_loc: i64,
    scan_next_loc: i64,
    scan_accept_loc: i64,
    scan_accept_pc: i64,
    scan_accept_symbol_num: i64,

    call_stack: Vec<i64>,
    registers: Vec<i64>,

    ast_stack: Vec<Ast>,
    ast_refs: Vec<AstRef>,
    /// Consumed `(stack slot, child path)` entries and where their
    /// subtrees moved; any later overlapping use deep-clones instead.
    dirty: AHashMap<(usize, Vec<usize>), MovedTo>,
}

impl<'a> ParserEngine<'a> {
    pub fn new(
        prsd: &'a ParserData,
        src: &'a SourceBuffer,
        errh: &'a mut ErrorHandler,
        debug_flags: DebugFlags,
    ) -> ParserEngine<'a> {
        let ring = prsd.lookaheads as usize + 1;
        ParserEngine {
            prsd,
            src,
            errh,
            debug_flags,
            token_buffer: vec![Token::default(); ring],
            token_front: 0,
            token_rear: 0,
            token_current: 0,
            scan_start_loc: 0,
            scan_next_loc: 0,
            scan_accept_loc: -1,
            scan_accept_pc: -1,
            scan_accept_symbol_num: -1,
            call_stack: Vec::new(),
            registers: Vec::new(),
            ast_stack: Vec::new(),
            ast_refs: Vec::new(),
            dirty: AHashMap::new(),
        }
    }

    /// Parse the source into an Ast. Collected diagnostics stay in the
    /// error handler either way.
    pub fn parse(&mut self) -> Result<Ast, HoshiError> {
        self.registers = self
            .prsd
            .registers
            .iter()
            .map(|r| r.initial_value)
            .collect();
        self.ast_refs = vec![AstRef::default(); self.prsd.ast_count.max(1) as usize];
        self.call_vm(0);

        self.token_front = 0;
        self.token_rear = 0;
        self.token_current = 0;
        self.scan_next_loc = 0;

        let mut state = self.prsd.tables.start_state;
        let mut state_stack = vec![state];
        let mut any_errors = false;

        self.get_token();
        let (mut action_type, mut goto_state, mut rule_num, mut fallback_state) =
            self.decode_action(state, self.token_buffer[self.token_current].symbol_num);

        loop {
            if self.debug_flags.has(DebugFlags::PARSE_ACTION) {
                log::trace!(target: "hoshi::engine", "state {state}: {action_type:?}");
            }
            match action_type {
                //
                //  A lookahead shift walks the lookahead automaton
                //  without touching the state stack.
                //
                ActionType::LaShift => {
                    state = goto_state;
                    self.token_current = (self.token_current + 1) % self.ring();
                    self.get_token();
                    (action_type, goto_state, rule_num, fallback_state) = self
                        .decode_action(state, self.token_buffer[self.token_current].symbol_num);
                }

                //
                //  A shift makes a token Ast and pushes it with the
                //  goto state.
                //
                ActionType::Shift => {
                    if !any_errors {
                        let token = &self.token_buffer[self.token_rear];
                        let ast = Ast::new(
                            self.prsd.token_kind[token.symbol_num as usize],
                            token.location,
                            token.lexeme.clone(),
                            vec![],
                        );
                        self.ast_stack.push(ast);
                    }
                    state = goto_state;
                    state_stack.push(state);
                    self.token_rear = (self.token_rear + 1) % self.ring();
                    self.token_current = self.token_rear;
                    self.get_token();
                    (action_type, goto_state, rule_num, fallback_state) = self
                        .decode_action(state, self.token_buffer[self.token_current].symbol_num);
                }

                //
                //  A reduce runs the rule's bytecode and pops the rhs.
                //  If the pop would underflow (only possible while
                //  recovering) we restart in the fallback state.
                //
                ActionType::Reduce => {
                    if self.debug_flags.has(DebugFlags::PARSE_ACTION) {
                        log::trace!(
                            target: "hoshi::engine",
                            "reduce {}",
                            self.prsd.rule_text[rule_num as usize]
                        );
                    }
                    if !any_errors {
                        self.call_vm(self.prsd.rule_pc[rule_num as usize]);
                    }
                    let size = self.prsd.rule_size[rule_num as usize];
                    if size >= state_stack.len() as i64 {
                        state_stack.clear();
                        state = fallback_state;
                        state_stack.push(state);
                        self.token_rear = (self.token_rear + 1) % self.ring();
                        self.token_current = self.token_rear;
                        self.get_token();
                        (action_type, goto_state, rule_num, fallback_state) = self.decode_action(
                            state,
                            self.token_buffer[self.token_current].symbol_num,
                        );
                    } else {
                        state_stack.truncate(state_stack.len() - size as usize);
                        state = *state_stack.last().unwrap();
                        self.token_current = self.token_rear;
                        (action_type, goto_state, rule_num, fallback_state) =
                            self.decode_action(state, self.prsd.rule_lhs[rule_num as usize]);
                    }
                }

                //
                //  A goto follows a reduce.
                //
                ActionType::Goto => {
                    state = goto_state;
                    state_stack.push(state);
                    (action_type, goto_state, rule_num, fallback_state) = self
                        .decode_action(state, self.token_buffer[self.token_current].symbol_num);
                }

                //
                //  A restart discards the stack during recovery.
                //
                ActionType::Restart => {
                    state_stack.clear();
                    state = goto_state;
                    state_stack.push(state);
                    self.token_rear = (self.token_rear + 1) % self.ring();
                    self.token_current = self.token_rear;
                    self.get_token();
                    (action_type, goto_state, rule_num, fallback_state) = self
                        .decode_action(state, self.token_buffer[self.token_current].symbol_num);
                }

                ActionType::Accept => {
                    if any_errors {
                        self.ast_stack.clear();
                        return Err(HoshiError::Source("source errors".to_string()));
                    }
                    let ast = self.ast_stack.pop().unwrap_or_default();
                    self.ast_stack.clear();
                    return Ok(ast);
                }

                //
                //  Report the unexpected token with the terminals that
                //  would have been accepted, then restart if recovery
                //  is on.
                //
                ActionType::Error => {
                    let symbol_num = self.token_buffer[self.token_current].symbol_num;
                    if (symbol_num != self.prsd.eof_symbol_num || !any_errors)
                        && symbol_num != self.prsd.error_symbol_num
                    {
                        let message = self.syntax_error_message(&state_stack, symbol_num);
                        let location = self.token_buffer[self.token_current].location;
                        self.errh.add_error(ErrorType::Syntax, location, &message);
                    }
                    self.ast_stack.clear();
                    if !self.prsd.error_recovery || symbol_num == self.prsd.eof_symbol_num {
                        return Err(HoshiError::Source("source errors".to_string()));
                    }
                    any_errors = true;
                    state = self.prsd.tables.restart_state;
                    state_stack.push(state);
                    self.token_rear = (self.token_rear + 1) % self.ring();
                    self.token_current = self.token_rear;
                    self.get_token();
                    (action_type, goto_state, rule_num, fallback_state) = self
                        .decode_action(state, self.token_buffer[self.token_current].symbol_num);
                }
            }
        }
    }

    fn ring(&self) -> usize {
        self.token_buffer.len()
    }

    /// Format the "Syntax error … expected X or Y" message by
    /// simulating one ply of parsing for every terminal.
    fn syntax_error_message(&self, state_stack: &[i64], symbol_num: i64) -> String {
        let mut valid_symbols = vec![];
        for n in 0..self.prsd.token_count() {
            if self.prsd.token_is_terminal[n] && self.valid_symbol(state_stack, n as i64) {
                valid_symbols.push(n);
            }
        }
        let token = &self.token_buffer[self.token_current];
        let mut message = String::from("Syntax error at ");
        if self.prsd.token_lexeme_needed[symbol_num as usize] {
            message.push_str(&token.lexeme);
        } else {
            message.push_str(&self.prsd.token_name_list[symbol_num as usize]);
        }
        match valid_symbols.len() {
            0 => message.push('.'),
            1 => {
                message.push_str(". Expected ");
                message.push_str(&self.prsd.token_name_list[valid_symbols[0]]);
                message.push('.');
            }
            2 => {
                message.push_str(". Expected ");
                message.push_str(&self.prsd.token_name_list[valid_symbols[0]]);
                message.push_str(" or ");
                message.push_str(&self.prsd.token_name_list[valid_symbols[1]]);
                message.push('.');
            }
            n if n > 10 => message.push('.'),
            _ => {
                message.push_str(". Expected one of ");
                for (position, &symbol) in valid_symbols.iter().enumerate() {
                    if position == valid_symbols.len() - 1 {
                        message.push_str(" or ");
                    } else if position != 0 {
                        message.push_str(", ");
                    }
                    message.push_str(&self.prsd.token_name_list[symbol]);
                }
                message.push('.');
            }
        }
        message
    }

    /// Whether shifting `symbol_num` from the current configuration
    /// could make progress.
    fn valid_symbol(&self, base_state_stack: &[i64], symbol_num: i64) -> bool {
        let mut state_stack = base_state_stack.to_vec();
        let mut state = *state_stack.last().unwrap();
        let (mut action_type, mut goto_state, mut rule_num, _) =
            self.decode_action(state, symbol_num);
        loop {
            match action_type {
                ActionType::LaShift
                | ActionType::Shift
                | ActionType::Restart
                | ActionType::Accept => return true,
                ActionType::Error => return false,
                ActionType::Reduce => {
                    let size = self.prsd.rule_size[rule_num as usize];
                    if size > 0 {
                        if state_stack.len() as i64 <= size {
                            return true;
                        }
                        state_stack.truncate(state_stack.len() - size as usize);
                    }
                    state = *state_stack.last().unwrap();
                    (action_type, goto_state, rule_num, _) =
                        self.decode_action(state, self.prsd.rule_lhs[rule_num as usize]);
                }
                ActionType::Goto => {
                    state = goto_state;
                    state_stack.push(state);
                    (action_type, goto_state, rule_num, _) =
                        self.decode_action(state, symbol_num);
                }
            }
        }
    }

    /// Probe the checked table for one state/symbol pair.
    fn decode_action(&self, state: i64, symbol_num: i64) -> (ActionType, i64, i64, i64) {
        let tables = &self.prsd.tables;
        let index =
            (tables.checked_index[state as usize] + symbol_num * tables.num_offsets) as usize;
        if tables.checked_data[index] < 0 {
            return (ActionType::Error, 0, 0, 0);
        }
        let check_symbol_num = (tables.checked_data[index + tables.symbol_num_offset as usize]
            >> tables.symbol_num_shift)
            & tables.symbol_num_mask;
        if check_symbol_num != symbol_num {
            return (ActionType::Error, 0, 0, 0);
        }
        let action_type = ActionType::from_repr(
            ((tables.checked_data[index + tables.action_type_offset as usize]
                >> tables.action_type_shift)
                & tables.action_type_mask) as u8,
        )
        .expect("invalid action type in parse table");
        let rule_num = (tables.checked_data[index + tables.rule_num_offset as usize]
            >> tables.rule_num_shift)
            & tables.rule_num_mask;
        let goto_state = (tables.checked_data[index + tables.state_num_offset as usize]
            >> tables.state_num_shift)
            & tables.state_num_mask;
        let fallback_state = (tables.checked_data[index + tables.fallback_num_offset as usize]
            >> tables.fallback_num_shift)
            & tables.fallback_num_mask;
        (action_type, goto_state, rule_num, fallback_state)
    }

    /// Make sure the current ring slot holds a token, scanning one if
    /// needed.
    fn get_token(&mut self) {
        if self.token_current != self.token_front {
            return;
        }
        self.call_vm(self.prsd.scanner_pc);
        if self.debug_flags.has(DebugFlags::SCAN_TOKEN) {
            let token = &self.token_buffer[self.token_current];
            log::trace!(
                target: "hoshi::engine",
                "scanned token {}{}",
                self.prsd.token_name_list[token.symbol_num as usize],
                if token.lexeme.is_empty() {
                    String::new()
                } else {
                    format!(": {}", to_ascii_chop(&token.lexeme))
                }
            );
        }
    }

    fn push_token(&mut self, symbol_num: i64, lexeme: String, location: i64) {
        if (self.token_front + 1) % self.ring() == self.token_rear {
            panic!("token ring overflow");
        }
        self.token_buffer[self.token_front] = Token {
            symbol_num,
            lexeme,
            location,
        };
        self.token_front = (self.token_front + 1) % self.ring();
    }

    //
    //  The bytecode interpreter
    //

    /// Run the VM from `entry` until the matching return or a halt.
    fn call_vm(&mut self, entry: i64) {
        let call_depth = self.call_stack.len();
        self.call_stack.push(-1);
        let mut pc = entry;
        while pc >= 0 {
            let instruction = self.prsd.instructions[pc as usize];
            let base = instruction.operand_offset;
            let operands = &self.prsd.operands[base..];
            let location = instruction.location;
            if self.debug_flags.has(DebugFlags::VCODE_EXEC) {
                log::trace!(target: "hoshi::engine", "{pc:6}  {}", instruction.opcode);
            }
            pc += 1;
            match instruction.opcode {
                Opcode::Null | Opcode::Label => {}
                Opcode::Halt => pc = -1,
                Opcode::Call => {
                    self.call_stack.push(pc);
                    pc = operands[0];
                }
                Opcode::Return => {
                    pc = self.call_stack.pop().expect("call stack underflow");
                }
                Opcode::Branch => pc = operands[0],
                Opcode::BranchEqual => {
                    if self.registers[operands[1] as usize]
                        == self.registers[operands[2] as usize]
                    {
                        pc = operands[0];
                    }
                }
                Opcode::BranchNotEqual => {
                    if self.registers[operands[1] as usize]
                        != self.registers[operands[2] as usize]
                    {
                        pc = operands[0];
                    }
                }
                Opcode::BranchLessThan => {
                    if self.registers[operands[1] as usize]
                        < self.registers[operands[2] as usize]
                    {
                        pc = operands[0];
                    }
                }
                Opcode::BranchLessEqual => {
                    if self.registers[operands[1] as usize]
                        <= self.registers[operands[2] as usize]
                    {
                        pc = operands[0];
                    }
                }
                Opcode::BranchGreaterThan => {
                    if self.registers[operands[1] as usize]
                        > self.registers[operands[2] as usize]
                    {
                        pc = operands[0];
                    }
                }
                Opcode::BranchGreaterEqual => {
                    if self.registers[operands[1] as usize]
                        >= self.registers[operands[2] as usize]
                    {
                        pc = operands[0];
                    }
                }
                Opcode::Assign => {
                    self.registers[operands[0] as usize] = self.registers[operands[1] as usize];
                }
                Opcode::Add => {
                    self.registers[operands[0] as usize] = self.registers
                        [operands[1] as usize]
                        .wrapping_add(self.registers[operands[2] as usize]);
                }
                Opcode::Subtract => {
                    self.registers[operands[0] as usize] = self.registers
                        [operands[1] as usize]
                        .wrapping_sub(self.registers[operands[2] as usize]);
                }
                Opcode::Multiply => {
                    self.registers[operands[0] as usize] = self.registers
                        [operands[1] as usize]
                        .wrapping_mul(self.registers[operands[2] as usize]);
                }
                Opcode::Divide => {
                    let divisor = self.registers[operands[2] as usize];
                    self.registers[operands[0] as usize] = if divisor == 0 {
                        0
                    } else {
                        self.registers[operands[1] as usize] / divisor
                    };
                }
                Opcode::UnaryMinus => {
                    self.registers[operands[0] as usize] =
                        -self.registers[operands[1] as usize];
                }

                //
                //  Scanner opcodes
                //
                Opcode::ScanStart => {
                    if self.scan_next_loc >= self.src.len() {
                        self.push_token(self.prsd.eof_symbol_num, String::new(), -1);
                        pc = self.call_stack.pop().expect("call stack underflow");
                        continue;
                    }
                    self.scan_start_loc = self.scan_next_loc;
                    self.scan_accept_loc = -1;
                    self.scan_accept_pc = -1;
                    self.scan_accept_symbol_num = -1;
                }
                Opcode::ScanAccept => {
                    self.scan_accept_loc = self.scan_next_loc;
                    self.scan_accept_symbol_num = operands[0];
                    self.scan_accept_pc = operands[1];
                }
                Opcode::ScanChar => {
                    match self.scan_char_target(operands) {
                        Some(target) => {
                            pc = target;
                            self.scan_next_loc += 1;
                        }
                        None if self.scan_accept_pc >= 0 => {
                            pc = self.scan_accept_pc;
                            self.scan_next_loc = self.scan_accept_loc;
                        }
                        None => {
                            let message = self.lexical_error_message();
                            self.errh.add_error(
                                ErrorType::Lexical,
                                self.scan_start_loc,
                                &message,
                            );
                            let lexeme =
                                self.src.slice(self.scan_start_loc, self.scan_start_loc + 1);
                            self.push_token(self.prsd.error_symbol_num, lexeme, -1);
                            self.scan_next_loc = self.scan_start_loc + 1;
                            pc = self.call_stack.pop().expect("call stack underflow");
                        }
                    }
                }
                Opcode::ScanToken => {
                    let symbol_num = self.scan_accept_symbol_num;
                    let lexeme = if self.prsd.token_lexeme_needed[symbol_num as usize] {
                        self.src.slice(self.scan_start_loc, self.scan_accept_loc)
                    } else {
                        String::new()
                    };
                    self.push_token(symbol_num, lexeme, self.scan_start_loc);
                }
                Opcode::ScanError => {
                    let message = self.prsd.strings[operands[0] as usize].clone();
                    self.errh
                        .add_error(ErrorType::Lexical, self.scan_start_loc, &message);
                    let lexeme = self.src.slice(self.scan_start_loc, self.scan_accept_loc);
                    self.push_token(self.prsd.error_symbol_num, lexeme, self.scan_start_loc);
                }

                //
                //  AST opcodes
                //
                Opcode::AstStart => {
                    self.dirty.clear();
                    self.registers[operands[0] as usize] = self.ast_stack.len() as i64;
                }
                Opcode::AstFinish => {
                    let size = operands[0] as usize;
                    let len = self.ast_stack.len();
                    if size > 0 {
                        self.ast_stack.drain(len - 1 - size..len - 1);
                    }
                }
                Opcode::AstNew => {
                    self.registers[operands[0] as usize] = self.ast_stack.len() as i64;
                }
                Opcode::AstForm => {
                    let base = self.registers[operands[0] as usize];
                    let mark = self.registers[operands[1] as usize] as usize;
                    let lookback = operands[2];
                    let mut ast_location = -1;
                    let mut back = lookback;
                    while back > 0 && ast_location < 0 {
                        ast_location = self.ast_stack[(base - back) as usize].location();
                        back -= 1;
                    }
                    let children: Vec<Ast> = self.ast_stack.drain(mark..).collect();
                    self.ast_stack
                        .push(Ast::new(-1, ast_location, String::new(), children));
                    // Moved subtrees that were gathered into the new
                    // node are now reachable through it.
                    for moved in self.dirty.values_mut() {
                        if moved.stack_index >= mark {
                            moved.inner_path.insert(0, moved.stack_index - mark);
                            moved.stack_index = mark;
                        }
                    }
                }
                Opcode::AstLoad => {
                    let index = self.registers[operands[1] as usize] + operands[2];
                    if index < 0 || index >= self.ast_stack.len() as i64 {
                        panic!("invalid Ast index in AstLoad");
                    }
                    self.ast_refs[operands[0] as usize] = AstRef {
                        base: index as usize,
                        path: Vec::new(),
                    };
                }
                Opcode::AstIndex => {
                    let slot = operands[0] as usize;
                    let reference = self.ast_refs[slot].clone();
                    let num_children = self
                        .resolve_node(reference.base, &reference.path)
                        .map(|node| node.num_children() as i64)
                        .unwrap_or(0);
                    let mut index = operands[1];
                    if index < 0 {
                        index += num_children;
                    }
                    if index < 0 || index >= num_children {
                        self.errh
                            .add_error(ErrorType::AstIndex, location, "Invalid Ast index");
                        pc = -1;
                        continue;
                    }
                    self.ast_refs[slot].path.push(index as usize);
                }
                Opcode::AstChild => {
                    let reference = self.ast_refs[operands[0] as usize].clone();
                    self.commit_child(reference.base, &reference.path);
                }
                Opcode::AstChildSlice => {
                    let reference = self.ast_refs[operands[0] as usize].clone();
                    let num_children = self
                        .resolve_node(reference.base, &reference.path)
                        .map(|node| node.num_children() as i64)
                        .unwrap_or(0);
                    let mut first = operands[1];
                    if first < 0 {
                        first += num_children;
                    }
                    let mut last = operands[2];
                    if last < 0 {
                        last += num_children;
                    }
                    let mut child = first;
                    while child <= last {
                        if child < 0 || child >= num_children {
                            self.errh.add_error(
                                ErrorType::AstIndex,
                                location,
                                "Invalid Ast index",
                            );
                            pc = -1;
                            break;
                        }
                        let mut path = reference.path.clone();
                        path.push(child as usize);
                        self.commit_child(reference.base, &path);
                        child += 1;
                    }
                }
                Opcode::AstKind => {
                    let reference = self.ast_refs[operands[0] as usize].clone();
                    if let Some(kind) = self
                        .resolve_node(reference.base, &reference.path)
                        .map(|node| node.kind())
                    {
                        self.ast_stack.last_mut().unwrap().set_kind(kind);
                    }
                }
                Opcode::AstKindNum => {
                    self.ast_stack
                        .last_mut()
                        .unwrap()
                        .set_kind(operands[0] as i32);
                }
                Opcode::AstLocation => {
                    let reference = self.ast_refs[operands[0] as usize].clone();
                    if let Some(ast_location) = self
                        .resolve_node(reference.base, &reference.path)
                        .map(|node| node.location())
                    {
                        self.ast_stack.last_mut().unwrap().set_location(ast_location);
                    }
                }
                Opcode::AstLocationNum => {
                    self.ast_stack.last_mut().unwrap().set_location(operands[0]);
                }
                Opcode::AstLexeme => {
                    let reference = self.ast_refs[operands[0] as usize].clone();
                    if let Some(lexeme) = self
                        .resolve_node(reference.base, &reference.path)
                        .map(|node| node.lexeme().to_string())
                    {
                        self.ast_stack.last_mut().unwrap().set_lexeme(lexeme);
                    }
                }
                Opcode::AstLexemeString => {
                    let lexeme = self.prsd.strings[operands[0] as usize].clone();
                    self.ast_stack.last_mut().unwrap().set_lexeme(lexeme);
                }
                Opcode::DumpStack => {
                    for (index, ast) in self.ast_stack.iter().enumerate().rev() {
                        log::debug!(
                            target: "hoshi::engine",
                            "stack item {index}\n{}",
                            ast.dump(&self.prsd.kind_map)
                        );
                    }
                }
            }
        }
        self.call_stack.truncate(call_depth);
    }

    /// Binary search of a `ScanChar` dispatch table for the next code
    /// point's target.
    fn scan_char_target(&self, operands: &[i64]) -> Option<i64> {
        if self.scan_next_loc >= self.src.len() {
            return None;
        }
        let c = self.src.char_at(self.scan_next_loc) as i64;
        let mut low = 0i64;
        let mut high = operands[0] - 1;
        while low <= high {
            let mid = low + (high - low) / 2;
            let slot = (mid * 3) as usize;
            if c < operands[slot + 1] {
                high = mid - 1;
            } else if c > operands[slot + 2] {
                low = mid + 1;
            } else {
                return Some(operands[slot + 3]);
            }
        }
        None
    }

    fn lexical_error_message(&self) -> String {
        let c = self.src.char_at(self.scan_start_loc);
        let shown = match char::from_u32(c) {
            Some('\\') => "'\\\\'".to_string(),
            Some('\n') => "'\\n'".to_string(),
            Some('\r') => "'\\r'".to_string(),
            Some('\t') => "'\\t'".to_string(),
            Some(c) if (' '..'\u{80}').contains(&c) => format!("'{c}'"),
            _ => format!("{c:08x}"),
        };
        format!("Invalid token at {shown}.")
    }

    //
    //  The reduce-action trail
    //

    /// Resolve a stack reference through the dirty map. A `None` means
    /// the subtree is unreachable, which only happens after its slot was
    /// hollowed out by earlier moves.
    fn resolve_node(&self, base: usize, path: &[usize]) -> Option<&Ast> {
        for length in (0..=path.len()).rev() {
            let Some(moved) = self.dirty.get(&(base, path[..length].to_vec())) else {
                continue;
            };
            let mut node = self.ast_stack.get(moved.stack_index)?;
            for &step in moved.inner_path.iter().chain(&path[length..]) {
                node = node.children().get(step)?;
            }
            return Some(node);
        }
        let mut node = self.ast_stack.get(base)?;
        for &step in path {
            node = node.children().get(step)?;
        }
        Some(node)
    }

    /// Commit one subtree to the stack: move it out on first use,
    /// leaving a sentinel behind; deep-clone on any overlapping reuse.
    fn commit_child(&mut self, base: usize, path: &[usize]) {
        let is_dirty = (0..=path.len())
            .rev()
            .any(|length| self.dirty.contains_key(&(base, path[..length].to_vec())));
        if is_dirty {
            let clone = self
                .resolve_node(base, path)
                .cloned()
                .unwrap_or_default();
            self.ast_stack.push(clone);
            return;
        }
        let node = {
            let mut slot = &mut self.ast_stack[base];
            for &step in path {
                slot = slot.child_mut(step);
            }
            // The sentinel keeps the slot's location so the location
            // scan in AstForm still sees it.
            let mut sentinel = Ast::null_sentinel();
            sentinel.set_location(slot.location());
            std::mem::replace(slot, sentinel)
        };
        let top = self.ast_stack.len();
        self.ast_stack.push(node);
        self.dirty.insert(
            (base, path.to_vec()),
            MovedTo {
                stack_index: top,
                inner_path: Vec::new(),
            },
        );
    }
}
