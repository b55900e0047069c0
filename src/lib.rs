/*!
# Hoshi

An LALR(k) parser generator with an integrated AST-building and
error-recovery runtime. A grammar written in an EBNF-like language also
declares tokens (regex-based), operator precedence, AST formers and
semantic guard actions; `generate` compiles it into a compact,
table-driven parser that consumes source text and yields an abstract
syntax tree.

```rust
use hoshi::{DebugFlags, Parser};

let grammar = r#"
tokens
    <integer> : regex = "[0-9]+"
rules
    Sum ::= Sum '+' <integer> : (Add $1 $3)
        | <integer>
"#;

let mut parser = Parser::new();
parser.generate(grammar, None, DebugFlags::NONE).unwrap();
parser.parse("1 + 2 + 3", DebugFlags::NONE).unwrap();

let ast = parser.get_ast().unwrap();
assert_eq!(ast.kind(), parser.get_kind("Add"));
assert_eq!(ast.num_children(), 2);
assert_eq!(ast.child(1).lexeme(), "3");
```

# Overview

The central type is [`Parser`]:

- [`Parser::generate`] compiles grammar text into an immutable parser
  artifact: an LALR(k) parse table plus bytecode for the scanner, the
  AST formers and the guard actions.
- [`Parser::parse`] runs the artifact over a source string; the result
  is an [`Ast`] or a list of [`ErrorMessage`] diagnostics.
- [`Parser::encode`] / [`Parser::decode`] round-trip the artifact
  through a portable text form, so a generated parser can be stored and
  reloaded without the grammar.
- Cloning a `Parser` shares the artifact, which is how one grammar
  serves many threads.

# Grammar language

A grammar has up to three sections, in order.

## Options

```text
options
    lookaheads = 2            // tokens of lookahead, default 1
    conflicts = 0             // expected conflict count, default 0
    error_recovery = true     // panic-mode recovery, default true
    keep_whitespace = false   // default false: whitespace is skipped
    case_sensitive = true     // default true
```

## Tokens

```text
tokens
    <integer>    : regex = "[0-9]+"
    <whitespace> : regex = "\s+"
                   ignore = true
    <comment>    : template = c_comment
    <unclosed>   : error = "unclosed comment"
                   regex = "/\* ([^*] | \*+[^*\/])*"
```

Token options are `description=str`, `regex=str`, `precedence=int`,
`lexeme=bool`, `ignore=bool`, `error=str`, `template=name` and
`action={…}`. A token without a regex matches its own name as a
literal. The template library provides `c_comment`, `cpp_comment`,
`float`, `identifier`, `integer`, `number`, `pascal_comment`,
`slash_prefix_comment` and `whitespace`; library tokens can also be
referenced as undeclared terminals or spliced into regexes as `{name}`
macros.

Regexes support literals (blanks are insignificant outside classes),
classes `[…]`/`[^…]` with ranges and `\s \S \d \D`, the operators
`* + ? |`, grouping, the escapes `\n \r \t \\` (plus any escaped
punctuation), and `{name}` macros.

## Rules

```text
rules
    Stmt  ::= Expr ';'? : (Statement $1)
    List  ::= Expr*
    Pair  ::= { 'a' 'b' : (Pair $1 $2) } | empty
    Expr  ::= precedence <integer>
              << { '+' : (Add $1 $3)  '-' : (Sub $1 $3) }
              << { '*' : (Mul $1 $3) }
              >> { '^' : (Pow $1 $3) }
```

Rules use `|` alternation, the postfix operators `? * +`, groups
`{ … }`, `empty` for an empty right-hand side, quoted literal
terminals, `<name>` token references and bare nonterminal names. The
`precedence` form lowers tiers of `<<` (left-associative) or `>>`
(right-associative) operator lists into the classic tiered rules,
loosest binding first.

Every alternative may carry an AST former `: ( … )` and a guard action
`=> { … }`. A former is `(Kind item…)` where items are child references
`$i`, `$i.j`, `$i[first,last]` (1-based; negative counts from the end),
nested formers, `@ref` (location) and `&ref` or `&"text"` (lexeme).
Rules of more than one symbol without a former build a node kinded
after their left-hand side with every right-hand-side slot as a child;
single-symbol rules pass their child through. Guard actions are
assignment statements over named integer registers.

# Diagnostics

Generation and parsing collect [`ErrorMessage`] values keyed by source
offset: grammar faults (duplicate options, LALR conflicts, regex
conflicts, …), source faults (lexical, syntax, AST index) and warnings.
When `error_recovery` is on, a syntax error reports the terminals that
would have been accepted and the parse continues in panic mode, so one
run surfaces multiple errors.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

mod ast;
mod codegen;
mod engine;
mod errors;
mod extract;
mod grammar;
mod lalr;
mod parser;
mod parser_data;
mod source;
mod syntax;
mod vm;

pub use ast::{Ast, KindMap};
pub use errors::{ErrorMessage, ErrorType, HoshiError};
pub use parser::Parser;
pub use source::{SourceBuffer, SourceBufferError, SourcePosition, EOF_CHAR};

/// A bit mask of debug traces, combined with `|`. Traces are emitted
/// through the `log` crate at debug and trace level under `hoshi::*`
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DebugFlags(
    /// The raw bit mask.
    pub u64,
);

impl DebugFlags {
    /// No tracing.
    pub const NONE: DebugFlags = DebugFlags(0);
    /// Progress messages through generation phases.
    pub const PROGRESS: DebugFlags = DebugFlags(1 << 0);
    /// Grammar-tree handler dispatch during extraction.
    pub const AST_HANDLERS: DebugFlags = DebugFlags(1 << 1);
    /// The extracted grammar.
    pub const GRAMMAR: DebugFlags = DebugFlags(1 << 2);
    /// The surface grammar tree.
    pub const GRAMMAR_AST: DebugFlags = DebugFlags(1 << 3);
    /// First sets and automaton listings.
    pub const LALR: DebugFlags = DebugFlags(1 << 4);
    /// Scanner DFA construction summary.
    pub const SCANNER: DebugFlags = DebugFlags(1 << 5);
    /// Parse-action tables after resolution.
    pub const ACTIONS: DebugFlags = DebugFlags(1 << 6);
    /// The generated bytecode listing.
    pub const ICODE: DebugFlags = DebugFlags(1 << 7);
    /// Every VM instruction as it executes.
    pub const VCODE_EXEC: DebugFlags = DebugFlags(1 << 8);
    /// Every token as it is scanned.
    pub const SCAN_TOKEN: DebugFlags = DebugFlags(1 << 9);
    /// Every parse action as it is dispatched.
    pub const PARSE_ACTION: DebugFlags = DebugFlags(1 << 10);

    /// Whether all of `flag`'s bits are present.
    pub fn has(self, flag: DebugFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl std::ops::BitOr for DebugFlags {
    type Output = DebugFlags;

    fn bitor(self, rhs: DebugFlags) -> DebugFlags {
        DebugFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DebugFlags {
    fn bitor_assign(&mut self, rhs: DebugFlags) {
        self.0 |= rhs.0;
    }
}
