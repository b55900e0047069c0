//! The grammar extractor: walks the surface syntax tree, fills the
//! grammar model and expands EBNF into plain BNF on the fly.
use ahash::AHashSet;

use crate::errors::{ErrorHandler, ErrorType};
use crate::grammar::{library_token, Grammar, RuleId, SymbolId};
use crate::syntax::{GrammarAst, SyntaxKind};
use crate::DebugFlags;

/// Walk the surface tree and build the grammar. Diagnostics land in
/// `errh`; the caller checks the error count before generating.
pub(crate) fn extract_grammar(
    root: &GrammarAst,
    errh: &mut ErrorHandler,
    debug_flags: DebugFlags,
) -> Grammar {
    if debug_flags.has(DebugFlags::GRAMMAR_AST) {
        log::debug!(target: "hoshi::extract", "grammar ast:\n{}", root.dump());
    }
    let mut extractor = Extractor {
        gram: Grammar::new(),
        errh,
        debug_flags,
    };
    let start_rule = extractor.gram.add_rule();
    extractor.handle_grammar(root);
    extractor.finish(start_rule);
    if debug_flags.has(DebugFlags::GRAMMAR) {
        log::debug!(target: "hoshi::extract", "grammar:\n{}", extractor.gram.dump());
    }
    extractor.gram
}

struct Extractor<'a> {
    gram: Grammar,
    errh: &'a mut ErrorHandler,
    debug_flags: DebugFlags,
}

impl Extractor<'_> {
    fn handle_grammar(&mut self, root: &GrammarAst) {
        if root.kind != SyntaxKind::Grammar {
            panic!("no extract handler for {:?}", root.kind);
        }
        self.handle_options(root.child(0));
        self.handle_tokens(root.child(1));
        self.handle_rules(root.child(2));
    }

    //
    //  Grammar options
    //

    fn handle_options(&mut self, options: &GrammarAst) {
        let mut processed = AHashSet::new();
        for option in &options.children {
            if self.debug_flags.has(DebugFlags::AST_HANDLERS) {
                log::trace!(target: "hoshi::extract", "option handler: {}", option.kind);
            }
            if !processed.insert(option.kind) {
                self.errh.add_error(
                    ErrorType::DupGrammarOption,
                    option.location,
                    &format!("Duplicate {} option", option_name(option.kind)),
                );
                continue;
            }
            match option.kind {
                SyntaxKind::Lookaheads => {
                    self.gram.max_lookaheads = integer_value(option.child(0)).max(0) as usize;
                }
                SyntaxKind::Conflicts => {
                    self.gram.expected_conflicts = integer_value(option.child(0)).max(0) as usize;
                }
                SyntaxKind::ErrorRecovery => {
                    self.gram.error_recovery = bool_value(option.child(0));
                }
                SyntaxKind::KeepWhitespace => {
                    self.gram.keep_whitespace = bool_value(option.child(0));
                }
                SyntaxKind::CaseSensitive => {
                    self.gram.case_sensitive = bool_value(option.child(0));
                }
                kind => panic!("no extract handler for {kind:?}"),
            }
        }
    }

    //
    //  Token declarations
    //

    fn handle_tokens(&mut self, tokens: &GrammarAst) {
        for declaration in &tokens.children {
            self.handle_token_declaration(declaration);
        }
    }

    fn handle_token_declaration(&mut self, declaration: &GrammarAst) {
        let name_node = declaration.child(0);
        let name = name_node.lexeme.clone();
        if self.gram.lookup_symbol(&name).is_some() {
            self.errh.add_error(
                ErrorType::DupToken,
                name_node.location,
                &format!("Duplicate declaration of token {name}"),
            );
            return;
        }
        let symbol = self.gram.intern_symbol(&name);
        self.gram.symbol_mut(symbol).location = name_node.location;

        // Template options come first so that specific options can
        // override whatever they fill in.
        let options = declaration.child(1);
        let mut processed = AHashSet::new();
        for option in &options.children {
            if option.kind == SyntaxKind::TokenTemplate {
                self.handle_token_option(symbol, option, &mut processed);
            }
        }
        for option in &options.children {
            if option.kind != SyntaxKind::TokenTemplate {
                self.handle_token_option(symbol, option, &mut processed);
            }
        }

        let data = self.gram.symbol_mut(symbol);
        data.is_scanned = true;
        if !data.is_ignored && !data.is_error {
            data.is_terminal = true;
        }
        if !processed.contains(&SyntaxKind::TokenLexeme) {
            data.lexeme_needed = data.regex.is_some();
        }
    }

    fn handle_token_option(
        &mut self,
        symbol: SymbolId,
        option: &GrammarAst,
        processed: &mut AHashSet<SyntaxKind>,
    ) {
        if self.debug_flags.has(DebugFlags::AST_HANDLERS) {
            log::trace!(target: "hoshi::extract", "token option handler: {}", option.kind);
        }
        if !processed.insert(option.kind) {
            self.errh.add_error(
                ErrorType::DupTokenOption,
                option.location,
                &format!(
                    "Duplicate {} option for token {}",
                    option_name(option.kind),
                    self.gram.symbol_name(symbol)
                ),
            );
            return;
        }
        match option.kind {
            SyntaxKind::TokenTemplate => {
                let Some(token) = library_token(&option.lexeme) else {
                    self.errh.add_error(
                        ErrorType::UnknownMacro,
                        option.location,
                        &format!("Unknown token template {}", option.lexeme),
                    );
                    return;
                };
                let regex = self.parse_library_regex(token.regex, option.location);
                let data = self.gram.symbol_mut(symbol);
                data.description = token.description.to_string();
                data.precedence = token.precedence;
                data.lexeme_needed = token.lexeme_needed;
                data.is_ignored = token.is_ignored;
                data.error_message = token.error_message.to_string();
                data.regex = Some(regex);
                data.is_ast_synthesized = true;
            }
            SyntaxKind::TokenDescription => {
                self.gram.symbol_mut(symbol).description = option.child(0).lexeme.clone();
            }
            SyntaxKind::TokenRegexList => {
                self.gram.symbol_mut(symbol).regex = Some(option.clone());
                self.gram.symbol_mut(symbol).is_ast_synthesized = false;
            }
            SyntaxKind::TokenPrecedence => {
                self.gram.symbol_mut(symbol).precedence = integer_value(option.child(0));
            }
            SyntaxKind::TokenAction => {
                self.gram.symbol_mut(symbol).action = Some(option.child(0).clone());
            }
            SyntaxKind::TokenLexeme => {
                self.gram.symbol_mut(symbol).lexeme_needed = bool_value(option.child(0));
            }
            SyntaxKind::TokenIgnore => {
                self.gram.symbol_mut(symbol).is_ignored = bool_value(option.child(0));
            }
            SyntaxKind::TokenError => {
                let data = self.gram.symbol_mut(symbol);
                data.is_error = true;
                data.error_message = option.child(0).lexeme.clone();
            }
            kind => panic!("no extract handler for {kind:?}"),
        }
    }

    /// Parse a regex owned by the library, pinning every node to one
    /// source location.
    fn parse_library_regex(&mut self, text: &str, location: i64) -> GrammarAst {
        match crate::syntax::parse_regex(text) {
            Ok(mut regex) => {
                regex.set_all_locations(location);
                GrammarAst::new(
                    SyntaxKind::TokenRegexList,
                    location,
                    "",
                    vec![GrammarAst::new(
                        SyntaxKind::TokenRegex,
                        location,
                        "",
                        vec![GrammarAst::null(), regex],
                    )],
                )
            }
            Err(message) => panic!("library regex failed to parse: {message}"),
        }
    }

    //
    //  Rules
    //

    fn handle_rules(&mut self, rules: &GrammarAst) {
        for rule in &rules.children {
            match rule.kind {
                SyntaxKind::Rule => self.handle_rule(rule),
                SyntaxKind::RulePrecedence => self.handle_rule_precedence(rule),
                kind => panic!("no extract handler for {kind:?}"),
            }
        }
    }

    fn nonterminal_reference(&mut self, node: &GrammarAst) -> SymbolId {
        match self.gram.lookup_symbol(&node.lexeme) {
            Some(symbol) => symbol,
            None => {
                let symbol = self.gram.intern_symbol(&node.lexeme);
                let data = self.gram.symbol_mut(symbol);
                data.is_nonterminal = true;
                data.location = node.location;
                symbol
            }
        }
    }

    fn terminal_reference(&mut self, node: &GrammarAst) -> SymbolId {
        if let Some(symbol) = self.gram.lookup_symbol(&node.lexeme) {
            return symbol;
        }
        let name = &node.lexeme;
        if name.starts_with('<') {
            let bare = &name[1..name.len() - 1];
            if let Some(token) = library_token(bare) {
                let regex = self.parse_library_regex(token.regex, node.location);
                let symbol = self.gram.intern_symbol(name);
                let data = self.gram.symbol_mut(symbol);
                data.is_terminal = true;
                data.is_scanned = true;
                data.description = token.description.to_string();
                data.precedence = token.precedence;
                data.lexeme_needed = token.lexeme_needed;
                data.location = node.location;
                data.regex = Some(regex);
                data.is_ast_synthesized = true;
                return symbol;
            }
        }
        // Undeclared literal terminals are auto-declared; their regex is
        // synthesized from the literal text later.
        let symbol = self.gram.intern_symbol(name);
        let data = self.gram.symbol_mut(symbol);
        data.is_terminal = true;
        data.is_scanned = true;
        data.location = node.location;
        if let Some(content) = node.children.first() {
            data.string_value = content.lexeme.clone();
        }
        symbol
    }

    /// Mint a fresh synthetic nonterminal `base:n` for an EBNF
    /// subexpression of `lhs`.
    fn synthesize_lhs(&mut self, lhs: SymbolId, location: i64) -> SymbolId {
        let name = self.gram.symbol_name(lhs);
        let base = match name.find(':') {
            Some(n) => name[..n].to_string(),
            None => name.to_string(),
        };
        for n in 1.. {
            let candidate = format!("{base}:{n}");
            if self.gram.lookup_symbol(&candidate).is_none() {
                let symbol = self.gram.intern_symbol(&candidate);
                let data = self.gram.symbol_mut(symbol);
                data.is_nonterminal = true;
                data.location = location;
                return symbol;
            }
        }
        unreachable!()
    }

    fn handle_rule(&mut self, rule: &GrammarAst) {
        let lhs = self.nonterminal_reference(rule.child(0));
        let rule_former = rule.child(2);
        let rule_action = rule.child(3);
        self.handle_rhs_list(rule.child(1), lhs, rule.location, rule_former, rule_action);
    }

    /// Fan an or-expression out into one rule per alternative. The
    /// shared former and action apply to any alternative that does not
    /// carry its own.
    fn handle_rhs_list(
        &mut self,
        rhs_list: &GrammarAst,
        lhs: SymbolId,
        location: i64,
        shared_former: &GrammarAst,
        shared_action: &GrammarAst,
    ) {
        for rhs in &rhs_list.children {
            let (items, own_former, own_action) = split_rhs(rhs);
            let former = if own_former.is_null() {
                shared_former
            } else {
                own_former
            };
            let action = if own_action.is_null() {
                shared_action
            } else {
                own_action
            };
            let rule_id = self.gram.add_rule();
            {
                let rule = self.gram.rule_mut(rule_id);
                rule.location = location;
                rule.lhs = lhs;
                rule.ast_former = clone_non_null(former);
                rule.action = clone_non_null(action);
            }
            for item in items {
                let symbol = self.handle_rhs_item(item, lhs);
                self.gram.rule_mut(rule_id).rhs.push(symbol);
            }
        }
    }

    fn handle_rhs_item(&mut self, item: &GrammarAst, lhs: SymbolId) -> SymbolId {
        if self.debug_flags.has(DebugFlags::AST_HANDLERS) {
            log::trace!(target: "hoshi::extract", "rule handler: {}", item.kind);
        }
        match item.kind {
            SyntaxKind::TerminalReference => self.terminal_reference(item),
            SyntaxKind::NonterminalReference => self.nonterminal_reference(item),
            SyntaxKind::Empty => self.gram.epsilon_symbol,
            SyntaxKind::Optional => self.handle_optional(item, lhs),
            SyntaxKind::ZeroClosure => self.handle_closure(item, lhs, false),
            SyntaxKind::OneClosure => self.handle_closure(item, lhs, true),
            SyntaxKind::Group => self.handle_group(item, lhs),
            kind => panic!("no extract handler for {kind:?}"),
        }
    }

    /// `X?` becomes a fresh nonterminal with rules for `X` and for
    /// nothing; the empty rule forms a `Null` node.
    fn handle_optional(&mut self, item: &GrammarAst, lhs: SymbolId) -> SymbolId {
        let new_lhs = self.synthesize_lhs(lhs, item.location);

        let rule_id = self.gram.add_rule();
        self.gram.rule_mut(rule_id).location = item.location;
        self.gram.rule_mut(rule_id).lhs = new_lhs;
        let symbol = self.handle_rhs_item(item.child(0), new_lhs);
        self.gram.rule_mut(rule_id).rhs.push(symbol);

        let empty_id = self.gram.add_rule();
        let empty_rule = self.gram.rule_mut(empty_id);
        empty_rule.location = item.location;
        empty_rule.lhs = new_lhs;
        let epsilon = self.gram.epsilon_symbol;
        self.gram.rule_mut(empty_id).rhs.push(epsilon);
        self.gram.rule_mut(empty_id).ast_former = Some(former_of_kind("Null", item.location));
        self.gram.rule_mut(empty_id).is_ast_synthesized = true;

        new_lhs
    }

    /// `X*` and `X+` become left-recursive accumulator rules whose
    /// formers flatten the growing list on each step.
    fn handle_closure(&mut self, item: &GrammarAst, lhs: SymbolId, one_or_more: bool) -> SymbolId {
        let new_lhs = self.synthesize_lhs(lhs, item.location);

        let step_id = self.gram.add_rule();
        self.gram.rule_mut(step_id).location = item.location;
        self.gram.rule_mut(step_id).lhs = new_lhs;
        self.gram.rule_mut(step_id).rhs.push(new_lhs);
        let symbol = self.handle_rhs_item(item.child(0), new_lhs);
        self.gram.rule_mut(step_id).rhs.push(symbol);
        self.gram.rule_mut(step_id).ast_former = Some(closure_step_former(item.location));
        self.gram.rule_mut(step_id).is_ast_synthesized = true;

        let base_id = self.gram.add_rule();
        self.gram.rule_mut(base_id).location = item.location;
        self.gram.rule_mut(base_id).lhs = new_lhs;
        if one_or_more {
            self.gram.rule_mut(base_id).rhs.push(symbol);
            self.gram.rule_mut(base_id).ast_former = Some(closure_base_former(item.location));
        } else {
            let epsilon = self.gram.epsilon_symbol;
            self.gram.rule_mut(base_id).rhs.push(epsilon);
            self.gram.rule_mut(base_id).ast_former = Some(former_of_kind("Unknown", item.location));
        }
        self.gram.rule_mut(base_id).is_ast_synthesized = true;

        new_lhs
    }

    fn handle_group(&mut self, item: &GrammarAst, lhs: SymbolId) -> SymbolId {
        let new_lhs = self.synthesize_lhs(lhs, item.location);
        self.handle_rhs_list(item.child(0), new_lhs, item.location, item.child(1), item.child(2));
        new_lhs
    }

    /// Lower a precedence declaration into tiered rules. Tier `i` uses
    /// tier `i+1` as its operand; the last tier uses the primary term.
    fn handle_rule_precedence(&mut self, rule: &GrammarAst) {
        let lhs = self.nonterminal_reference(rule.child(0));
        let term = self.handle_rhs_item(rule.child(1), lhs);
        let specs = rule.child(2);

        let mut current_lhs = lhs;
        for (index, spec) in specs.children.iter().enumerate() {
            let last = index == specs.children.len() - 1;
            let tier_term = if last {
                term
            } else {
                self.synthesize_lhs(lhs, spec.location)
            };
            let left_assoc = spec.child(0).kind == SyntaxKind::RuleLeftAssoc;
            for op_spec in &spec.child(1).children {
                let op_symbol = self.terminal_reference(op_spec.child(0));
                let rule_id = self.gram.add_rule();
                let op_rule = self.gram.rule_mut(rule_id);
                op_rule.location = op_spec.location;
                op_rule.lhs = current_lhs;
                if left_assoc {
                    op_rule.rhs.push(current_lhs);
                    op_rule.rhs.push(op_symbol);
                    op_rule.rhs.push(tier_term);
                } else {
                    op_rule.rhs.push(tier_term);
                    op_rule.rhs.push(op_symbol);
                    op_rule.rhs.push(current_lhs);
                }
                op_rule.ast_former = clone_non_null(op_spec.child(1));
                op_rule.action = clone_non_null(op_spec.child(2));
            }
            let unit_id = self.gram.add_rule();
            let unit_rule = self.gram.rule_mut(unit_id);
            unit_rule.location = spec.location;
            unit_rule.lhs = current_lhs;
            unit_rule.rhs.push(tier_term);
            current_lhs = tier_term;
        }
    }

    //
    //  Default synthesis and sanity checks
    //

    fn finish(&mut self, start_rule: RuleId) {
        // The augmented start rule derives the first declared LHS.
        let accept = self.gram.accept_symbol;
        self.gram.rule_mut(start_rule).lhs = accept;
        if self.gram.rules.len() > 1 {
            let start_lhs = self.gram.rules[1].lhs;
            self.gram.rule_mut(start_rule).rhs.push(start_lhs);
        }

        let epsilon = self.gram.epsilon_symbol;
        for rule in &mut self.gram.rules {
            rule.rhs.retain(|&symbol| symbol != epsilon);
        }

        // Most languages ignore whitespace, so that is the default.
        if !self.gram.keep_whitespace && self.gram.lookup_symbol("<whitespace>").is_none() {
            let token = library_token("whitespace").expect("missing whitespace library token");
            let regex = self.parse_library_regex(token.regex, -1);
            let symbol = self.gram.intern_symbol("<whitespace>");
            let data = self.gram.symbol_mut(symbol);
            data.is_ignored = token.is_ignored;
            data.is_scanned = true;
            data.description = token.description.to_string();
            data.precedence = token.precedence;
            data.lexeme_needed = token.lexeme_needed;
            data.regex = Some(regex);
            data.is_ast_synthesized = true;
        }

        // Literal tokens get a regex spelled from their own text.
        let case_sensitive = self.gram.case_sensitive;
        for id in self.gram.symbol_ids().collect::<Vec<_>>() {
            let data = self.gram.symbol(id);
            if !data.is_scanned || data.regex.is_some() {
                continue;
            }
            let location = data.location;
            let literal = data.string_value.clone();
            let regex = literal_regex(&literal, case_sensitive, location);
            let data = self.gram.symbol_mut(id);
            data.regex = Some(regex);
            data.is_ast_synthesized = true;
        }

        // Rules of size other than one get a default former: the LHS
        // name as the kind, all rhs slots as children in order.
        for index in 0..self.gram.rules.len() {
            let rule = &self.gram.rules[index];
            if rule.ast_former.is_some() || rule.rhs.len() == 1 {
                continue;
            }
            let lhs_name = self.gram.symbol_name(rule.lhs).to_string();
            let location = rule.location;
            let size = rule.rhs.len();
            let rule = &mut self.gram.rules[index];
            rule.ast_former = Some(default_former(&lhs_name, size, location));
            rule.is_ast_synthesized = true;
        }

        self.check_symbols();
    }

    /// Report undefined, unproductive and unused symbols.
    fn check_symbols(&mut self) {
        let num_symbols = self.gram.num_symbols();
        let mut has_rule = vec![false; num_symbols];
        let mut referenced = vec![false; num_symbols];
        let mut productive: Vec<bool> = self
            .gram
            .symbol_ids()
            .map(|id| self.gram.symbol(id).is_terminal)
            .collect();

        for rule in &self.gram.rules {
            has_rule[rule.lhs.index()] = true;
            for &symbol in &rule.rhs {
                referenced[symbol.index()] = true;
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for rule in &self.gram.rules {
                if !productive[rule.lhs.index()]
                    && rule.rhs.iter().all(|s| productive[s.index()])
                {
                    productive[rule.lhs.index()] = true;
                    changed = true;
                }
            }
        }

        for id in self.gram.symbol_ids().collect::<Vec<_>>() {
            let data = self.gram.symbol(id);
            let name = self.gram.symbol_name(id).to_string();
            let location = data.location;
            if data.is_nonterminal && id != self.gram.accept_symbol {
                if !has_rule[id.index()] {
                    self.errh.add_error(
                        ErrorType::UndefinedNonterm,
                        location,
                        &format!("Nonterminal {name} is never defined"),
                    );
                } else if !productive[id.index()] {
                    self.errh.add_error(
                        ErrorType::UselessNonterm,
                        location,
                        &format!("Nonterminal {name} cannot produce a terminal string"),
                    );
                } else if !referenced[id.index()] {
                    self.errh.add_error(
                        ErrorType::UnusedNonterm,
                        location,
                        &format!("Nonterminal {name} is never used"),
                    );
                }
            } else if data.is_terminal && data.is_scanned && !referenced[id.index()] {
                self.errh.add_error(
                    ErrorType::UnusedTerm,
                    location,
                    &format!("Token {name} is never used"),
                );
            }
        }

        for rule in &self.gram.rules {
            if rule.rule_num == 0 {
                continue;
            }
            if rule
                .rhs
                .iter()
                .any(|s| has_rule[s.index()] && !productive[s.index()])
            {
                self.errh.add_error(
                    ErrorType::UselessRule,
                    rule.location,
                    &format!("Rule {} can never be reduced", self.gram.rule_text(rule)),
                );
            }
        }
    }
}

fn split_rhs(rhs: &GrammarAst) -> (&[GrammarAst], &GrammarAst, &GrammarAst) {
    let n = rhs.children.len();
    (&rhs.children[..n - 2], rhs.child(n - 2), rhs.child(n - 1))
}

fn clone_non_null(node: &GrammarAst) -> Option<GrammarAst> {
    if node.is_null() {
        None
    } else {
        Some(node.clone())
    }
}

fn option_name(kind: SyntaxKind) -> &'static str {
    match kind {
        SyntaxKind::Lookaheads => "lookaheads",
        SyntaxKind::Conflicts => "conflicts",
        SyntaxKind::ErrorRecovery => "error_recovery",
        SyntaxKind::KeepWhitespace => "keep_whitespace",
        SyntaxKind::CaseSensitive => "case_sensitive",
        SyntaxKind::TokenTemplate => "template",
        SyntaxKind::TokenDescription => "description",
        SyntaxKind::TokenRegexList => "regex",
        SyntaxKind::TokenPrecedence => "precedence",
        SyntaxKind::TokenAction => "action",
        SyntaxKind::TokenLexeme => "lexeme",
        SyntaxKind::TokenIgnore => "ignore",
        SyntaxKind::TokenError => "error",
        _ => "unknown",
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

fn bool_value(node: &GrammarAst) -> bool {
    node.kind == SyntaxKind::True
}

//
//  Synthesized former shapes
//

fn identifier_node(name: &str, location: i64) -> GrammarAst {
    GrammarAst::new(SyntaxKind::Identifier, location, name, vec![])
}

fn integer_node(value: usize, location: i64) -> GrammarAst {
    GrammarAst::new(SyntaxKind::Integer, location, &value.to_string(), vec![])
}

fn child_node(slot: usize, slice: GrammarAst, location: i64) -> GrammarAst {
    let dot = GrammarAst::new(
        SyntaxKind::AstDot,
        location,
        "",
        vec![integer_node(slot, location)],
    );
    GrammarAst::new(SyntaxKind::AstChild, location, "", vec![dot, slice])
}

/// `( Kind )`: a former with no children at all.
fn former_of_kind(kind: &str, location: i64) -> GrammarAst {
    GrammarAst::new(
        SyntaxKind::AstFormer,
        location,
        "",
        vec![identifier_node(kind, location)],
    )
}

/// `( Unknown $1[1,-1] $2 )`: append the new element to the list built
/// so far.
fn closure_step_former(location: i64) -> GrammarAst {
    let slice = GrammarAst::new(
        SyntaxKind::AstSlice,
        location,
        "",
        vec![
            integer_node(1, location),
            GrammarAst::new(SyntaxKind::NegativeInteger, location, "1", vec![]),
        ],
    );
    GrammarAst::new(
        SyntaxKind::AstFormer,
        location,
        "",
        vec![
            identifier_node("Unknown", location),
            child_node(1, slice, location),
            child_node(2, GrammarAst::null(), location),
        ],
    )
}

/// `( Unknown $1 )`: the one-element list that seeds a `+` closure.
fn closure_base_former(location: i64) -> GrammarAst {
    GrammarAst::new(
        SyntaxKind::AstFormer,
        location,
        "",
        vec![
            identifier_node("Unknown", location),
            child_node(1, GrammarAst::null(), location),
        ],
    )
}

/// `( Lhs $1 $2 ... $n )`: the default former for a rule without one.
fn default_former(lhs_name: &str, size: usize, location: i64) -> GrammarAst {
    let mut children = vec![identifier_node(lhs_name, location)];
    for slot in 1..=size {
        children.push(child_node(slot, GrammarAst::null(), location));
    }
    GrammarAst::new(SyntaxKind::AstFormer, location, "", children)
}

/// Build the literal regex for a token declared without one, honoring
/// case sensitivity by widening letters into two-way charsets.
fn literal_regex(literal: &str, case_sensitive: bool, location: i64) -> GrammarAst {
    let mut items = vec![];
    for c in literal.chars() {
        let lower = c.to_lowercase().next().unwrap_or(c);
        let upper = c.to_uppercase().next().unwrap_or(c);
        if case_sensitive || lower == upper {
            items.push(GrammarAst::new(
                SyntaxKind::RegexChar,
                location,
                &c.to_string(),
                vec![],
            ));
        } else {
            let range = |ch: char| {
                GrammarAst::new(
                    SyntaxKind::CharsetRange,
                    location,
                    "",
                    vec![GrammarAst::new(
                        SyntaxKind::CharsetChar,
                        location,
                        &ch.to_string(),
                        vec![],
                    )],
                )
            };
            items.push(GrammarAst::new(
                SyntaxKind::Charset,
                location,
                "",
                vec![range(lower), range(upper)],
            ));
        }
    }
    let list = if items.len() == 1 {
        items.pop().unwrap()
    } else {
        GrammarAst::new(SyntaxKind::RegexList, location, "", items)
    };
    let regex = GrammarAst::new(SyntaxKind::Regex, location, "", vec![list]);
    GrammarAst::new(
        SyntaxKind::TokenRegexList,
        location,
        "",
        vec![GrammarAst::new(
            SyntaxKind::TokenRegex,
            location,
            "",
            vec![GrammarAst::null(), regex],
        )],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse_grammar;

    fn extract(text: &str) -> (Grammar, ErrorHandler) {
        let root = parse_grammar(text).unwrap();
        let mut errh = ErrorHandler::new();
        let gram = extract_grammar(&root, &mut errh, DebugFlags::NONE);
        (gram, errh)
    }

    #[test]
    fn augmented_start_rule() {
        let (gram, errh) = extract("rules\n S ::= 'a' S | 'a'\n");
        assert_eq!(errh.error_count(), 0);
        assert_eq!(gram.rules[0].lhs, gram.accept_symbol);
        assert_eq!(gram.rules[0].rhs.len(), 1);
        assert_eq!(gram.symbol_name(gram.rules[0].rhs[0]), "S");
        assert_eq!(gram.rules.len(), 3);
    }

    #[test]
    fn closure_expansion() {
        let (gram, errh) = extract("rules\n L ::= <integer>*\n");
        assert_eq!(errh.error_count(), 0);
        // Rule 0, L ::= L:1, and the two accumulator rules.
        assert_eq!(gram.rules.len(), 4);
        let synthetic = gram.lookup_symbol("L:1").unwrap();
        assert!(gram.symbol(synthetic).is_nonterminal);
        let step = gram
            .rules
            .iter()
            .find(|r| r.lhs == synthetic && r.rhs.len() == 2)
            .unwrap();
        assert_eq!(step.rhs[0], synthetic);
        assert!(step.is_ast_synthesized);
        let empty = gram
            .rules
            .iter()
            .find(|r| r.lhs == synthetic && r.rhs.is_empty())
            .unwrap();
        assert!(empty.ast_former.is_some());
    }

    #[test]
    fn whitespace_is_installed_by_default() {
        let (gram, _) = extract("rules\n S ::= 'a'\n");
        let ws = gram.lookup_symbol("<whitespace>").unwrap();
        assert!(gram.symbol(ws).is_ignored);
        assert!(gram.symbol(ws).regex.is_some());

        let (gram, _) = extract("options\n keep_whitespace = true\nrules\n S ::= 'a'\n");
        assert!(gram.lookup_symbol("<whitespace>").is_none());
    }

    #[test]
    fn literal_tokens_get_synthesized_regexes() {
        let (gram, _) = extract("rules\n S ::= 'if'\n");
        let token = gram.lookup_symbol("'if'").unwrap();
        let data = gram.symbol(token);
        assert!(data.regex.is_some());
        assert!(data.is_ast_synthesized);
        assert!(!data.lexeme_needed);
    }

    #[test]
    fn default_formers_cover_long_rules() {
        let (gram, _) = extract("rules\n S ::= 'a' 'b'\n T ::= S\n");
        let long_rule = gram.rules.iter().find(|r| r.rhs.len() == 2).unwrap();
        assert!(long_rule.ast_former.is_some());
        let pass_through = gram
            .rules
            .iter()
            .find(|r| r.rhs.len() == 1 && r.rule_num > 0 && !r.is_ast_synthesized)
            .unwrap();
        assert!(pass_through.ast_former.is_none());
    }

    #[test]
    fn duplicate_options_are_reported() {
        let (_, errh) = extract("options\n lookaheads = 2\n lookaheads = 3\nrules\n S ::= 'a'\n");
        assert_eq!(errh.error_count(), 1);
    }

    #[test]
    fn undefined_nonterminals_are_reported() {
        let (_, errh) = extract("rules\n S ::= Missing\n");
        assert!(errh.error_count() >= 1);
    }

    #[test]
    fn precedence_tiers_lower_into_rules() {
        let (gram, errh) = extract(
            "rules\n E ::= precedence <integer> << { '+' } << { '*' }\n",
        );
        assert_eq!(errh.error_count(), 0);
        let tier = gram.lookup_symbol("E:1").unwrap();
        let e = gram.lookup_symbol("E").unwrap();
        let plus = gram.lookup_symbol("'+'").unwrap();
        assert!(gram
            .rules
            .iter()
            .any(|r| r.lhs == e && r.rhs.as_slice() == &[e, plus, tier][..]));
        // Last tier hangs off the primary term.
        let int = gram.lookup_symbol("<integer>").unwrap();
        let star = gram.lookup_symbol("'*'").unwrap();
        assert!(gram
            .rules
            .iter()
            .any(|r| r.lhs == tier && r.rhs.as_slice() == &[tier, star, int][..]));
    }
}
