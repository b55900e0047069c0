//! The grammar model: interned symbols, rules and the built-in token
//! library. The extractor fills this in and the generator consumes it.
use std::fmt::Write as _;

use string_interner::symbol::SymbolU32;
use string_interner::{DefaultBackend, StringInterner, Symbol as _};
use tinyvec::TinyVec;

use crate::syntax::GrammarAst;

/// Index of a symbol in the grammar. Doubles as the index into the
/// interner, so symbol names round-trip for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a rule in the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) struct RuleId(pub u32);

impl RuleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Attributes of one grammar symbol. The name lives in the interner.
#[derive(Debug, Clone)]
pub(crate) struct SymbolData {
    pub is_terminal: bool,
    pub is_nonterminal: bool,
    pub is_scanned: bool,
    pub is_ignored: bool,
    pub is_error: bool,
    pub precedence: i64,
    pub lexeme_needed: bool,
    pub description: String,
    pub error_message: String,
    /// Unquoted text of a literal terminal, used to synthesize its regex.
    pub string_value: String,
    pub location: i64,
    /// Table number assigned by the action encoder.
    pub symbol_num: i64,
    /// Regex subtree (a `TokenRegexList`) attached by declaration or
    /// default synthesis.
    pub regex: Option<GrammarAst>,
    /// Guard action subtree run when the token is accepted.
    pub action: Option<GrammarAst>,
    pub is_ast_synthesized: bool,
}

impl Default for SymbolData {
    fn default() -> SymbolData {
        SymbolData {
            is_terminal: false,
            is_nonterminal: false,
            is_scanned: false,
            is_ignored: false,
            is_error: false,
            precedence: 100,
            lexeme_needed: false,
            description: String::new(),
            error_message: String::new(),
            string_value: String::new(),
            location: -1,
            symbol_num: -1,
            regex: None,
            action: None,
            is_ast_synthesized: false,
        }
    }
}

/// One BNF rule after EBNF expansion.
#[derive(Debug, Clone, Default)]
pub(crate) struct Rule {
    pub rule_num: usize,
    pub lhs: SymbolId,
    pub rhs: TinyVec<[SymbolId; 8]>,
    pub location: i64,
    pub ast_former: Option<GrammarAst>,
    pub action: Option<GrammarAst>,
    pub is_ast_synthesized: bool,
}

/// The assembled grammar: a flyweight symbol table, the rule list and
/// the grammar options. Lives from extraction until the parse tables
/// are frozen into [`ParserData`](crate::parser_data::ParserData).
#[derive(Debug)]
pub(crate) struct Grammar {
    names: StringInterner<DefaultBackend>,
    symbols: Vec<SymbolData>,
    pub rules: Vec<Rule>,
    pub eof_symbol: SymbolId,
    pub error_symbol: SymbolId,
    pub accept_symbol: SymbolId,
    pub epsilon_symbol: SymbolId,
    pub max_lookaheads: usize,
    pub expected_conflicts: usize,
    pub error_recovery: bool,
    pub keep_whitespace: bool,
    pub case_sensitive: bool,
}

impl Grammar {
    pub fn new() -> Grammar {
        let mut grammar = Grammar {
            names: StringInterner::default(),
            symbols: Vec::new(),
            rules: Vec::new(),
            eof_symbol: SymbolId(0),
            error_symbol: SymbolId(0),
            accept_symbol: SymbolId(0),
            epsilon_symbol: SymbolId(0),
            max_lookaheads: 1,
            expected_conflicts: 0,
            error_recovery: true,
            keep_whitespace: false,
            case_sensitive: true,
        };
        grammar.eof_symbol = grammar.intern_symbol("*eof*");
        grammar.symbols[grammar.eof_symbol.index()].is_terminal = true;
        grammar.error_symbol = grammar.intern_symbol("*error*");
        grammar.symbols[grammar.error_symbol.index()].is_terminal = true;
        grammar.accept_symbol = grammar.intern_symbol("*accept*");
        grammar.symbols[grammar.accept_symbol.index()].is_nonterminal = true;
        grammar.epsilon_symbol = grammar.intern_symbol("*epsilon*");
        grammar.symbols[grammar.epsilon_symbol.index()].is_terminal = true;
        grammar
    }

    /// Look up a symbol without creating it.
    pub fn lookup_symbol(&self, name: &str) -> Option<SymbolId> {
        self.names
            .get(name)
            .map(|sym: SymbolU32| SymbolId(sym.to_usize() as u32))
            .filter(|id| id.index() < self.symbols.len())
    }

    /// Intern a symbol name, creating a default attribute record the
    /// first time the name is seen.
    pub fn intern_symbol(&mut self, name: &str) -> SymbolId {
        let sym = self.names.get_or_intern(name);
        let id = SymbolId(sym.to_usize() as u32);
        if id.index() == self.symbols.len() {
            self.symbols.push(SymbolData::default());
        }
        id
    }

    pub fn symbol(&self, id: SymbolId) -> &SymbolData {
        &self.symbols[id.index()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut SymbolData {
        &mut self.symbols[id.index()]
    }

    pub fn symbol_name(&self, id: SymbolId) -> &str {
        self.names
            .resolve(SymbolU32::try_from_usize(id.index()).unwrap())
            .unwrap()
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.symbols.len() as u32).map(SymbolId)
    }

    /// Append a fresh empty rule and return its id.
    pub fn add_rule(&mut self) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Rule {
            rule_num: self.rules.len(),
            ..Rule::default()
        });
        id
    }

    pub fn rule_mut(&mut self, id: RuleId) -> &mut Rule {
        &mut self.rules[id.index()]
    }

    /// `lhs ::= rhs…` text of a rule, used in listings and ParserData.
    pub fn rule_text(&self, rule: &Rule) -> String {
        let mut text = format!("{} ::=", self.symbol_name(rule.lhs));
        if rule.rhs.is_empty() {
            let _ = write!(text, " {}", self.symbol_name(self.epsilon_symbol));
        } else {
            for &symbol in &rule.rhs {
                let _ = write!(text, " {}", self.symbol_name(symbol));
            }
        }
        text
    }

    /// Render the whole grammar for the grammar-dump debug flag.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "lookaheads = {}, conflicts = {}, error_recovery = {}, keep_whitespace = {}, case_sensitive = {}",
            self.max_lookaheads,
            self.expected_conflicts,
            self.error_recovery,
            self.keep_whitespace,
            self.case_sensitive
        );
        for id in self.symbol_ids() {
            let data = self.symbol(id);
            if !data.is_scanned {
                continue;
            }
            let _ = writeln!(
                out,
                "token {} precedence {}{}{}{}",
                self.symbol_name(id),
                data.precedence,
                if data.is_ignored { " ignored" } else { "" },
                if data.is_error { " error" } else { "" },
                if data.lexeme_needed { " lexeme" } else { "" },
            );
        }
        for rule in &self.rules {
            let _ = writeln!(out, "{:4}: {}", rule.rule_num, self.rule_text(rule));
        }
        out
    }
}

/// A pre-defined token. These can be used without declaration, pulled
/// into regex strings as `{name}` macros, or used as templates for
/// client token definitions.
#[derive(Debug)]
pub(crate) struct LibraryToken {
    pub name: &'static str,
    pub regex: &'static str,
    pub description: &'static str,
    pub precedence: i64,
    pub lexeme_needed: bool,
    pub is_ignored: bool,
    pub error_message: &'static str,
}

// Kept in sorted order by name for the binary search below.
static LIBRARY_TOKENS: [LibraryToken; 9] = [
    LibraryToken {
        name: "c_comment",
        regex: r"/\* ([^*] | (\*+ ([^*/])))* \*+/",
        description: "",
        precedence: 100,
        lexeme_needed: false,
        is_ignored: true,
        error_message: "",
    },
    LibraryToken {
        name: "cpp_comment",
        regex: "{slash_prefix_comment} | {c_comment}",
        description: "",
        precedence: 100,
        lexeme_needed: false,
        is_ignored: true,
        error_message: "",
    },
    LibraryToken {
        name: "float",
        regex: r"[0-9]+\.[0-9]+([eE][+\-]?[1-9][0-9]*)?",
        description: "",
        precedence: 100,
        lexeme_needed: true,
        is_ignored: false,
        error_message: "",
    },
    LibraryToken {
        name: "identifier",
        regex: "[A-Za-z][A-Za-z0-9_]*",
        description: "",
        precedence: 50,
        lexeme_needed: true,
        is_ignored: false,
        error_message: "",
    },
    LibraryToken {
        name: "integer",
        regex: "[0-9]+",
        description: "",
        precedence: 100,
        lexeme_needed: true,
        is_ignored: false,
        error_message: "",
    },
    LibraryToken {
        name: "number",
        regex: "{integer} | {float}",
        description: "",
        precedence: 100,
        lexeme_needed: true,
        is_ignored: false,
        error_message: "",
    },
    LibraryToken {
        name: "pascal_comment",
        regex: r"\(\* ([^*] | (\*+ ([^*)])))* \*+\)",
        description: "",
        precedence: 100,
        lexeme_needed: false,
        is_ignored: true,
        error_message: "",
    },
    LibraryToken {
        name: "slash_prefix_comment",
        regex: r"// [^\n]*",
        description: "",
        precedence: 100,
        lexeme_needed: false,
        is_ignored: true,
        error_message: "",
    },
    LibraryToken {
        name: "whitespace",
        regex: r"\s+",
        description: "",
        precedence: 100,
        lexeme_needed: false,
        is_ignored: true,
        error_message: "",
    },
];

/// Look up a library token by name.
pub(crate) fn library_token(name: &str) -> Option<&'static LibraryToken> {
    LIBRARY_TOKENS
        .binary_search_by(|token| token.name.cmp(name))
        .ok()
        .map(|n| &LIBRARY_TOKENS[n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_flyweight() {
        let mut grammar = Grammar::new();
        let a = grammar.intern_symbol("Expr");
        let b = grammar.intern_symbol("Expr");
        assert_eq!(a, b);
        assert_eq!(grammar.symbol_name(a), "Expr");
        assert_eq!(grammar.lookup_symbol("Expr"), Some(a));
        assert_eq!(grammar.lookup_symbol("Missing"), None);
        assert_eq!(grammar.num_symbols(), 5);
    }

    #[test]
    fn predefined_symbols_exist() {
        let grammar = Grammar::new();
        assert!(grammar.symbol(grammar.eof_symbol).is_terminal);
        assert!(grammar.symbol(grammar.accept_symbol).is_nonterminal);
        assert_eq!(grammar.symbol_name(grammar.epsilon_symbol), "*epsilon*");
    }

    #[test]
    fn library_lookup() {
        assert!(library_token("whitespace").is_some());
        assert_eq!(library_token("identifier").unwrap().precedence, 50);
        assert!(library_token("nothing").is_none());
        // The table has to stay sorted or the search above breaks.
        for pair in LIBRARY_TOKENS.windows(2) {
            assert!(pair[0].name < pair[1].name);
        }
    }
}
