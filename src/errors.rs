//! The diagnostics module: error codes, resolved error messages and the
//! ordered diagnostic list kept by the generator and the engine.
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::source::{SourceBuffer, SourcePosition};

/// Classification code attached to every diagnostic.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ErrorType {
    /// Generic error.
    Error,
    /// Generic warning.
    Warning,
    /// A `{name}` macro in a regex names no library or declared token.
    UnknownMacro,
    /// A grammar option appeared more than once.
    DupGrammarOption,
    /// A token was declared more than once.
    DupToken,
    /// A token option appeared more than once for one token.
    DupTokenOption,
    /// A declared terminal is never used in a rule.
    UnusedTerm,
    /// A nonterminal is referenced but has no rule.
    UndefinedNonterm,
    /// A nonterminal is defined but never referenced.
    UnusedNonterm,
    /// A nonterminal cannot derive any terminal string.
    UselessNonterm,
    /// A rule mentions a useless nonterminal.
    UselessRule,
    /// A cycle of nullable gotos in the LR(0) automaton.
    ReadsCycle,
    /// A nonterminal can rightmost-produce itself.
    SymbolSelfProduce,
    /// An unresolvable LALR(k) conflict.
    LalrConflict,
    /// The parse actions do not fit in the table word budget.
    WordOverflow,
    /// A character range with its bounds reversed.
    CharacterRange,
    /// Two tokens of equal precedence accept the same lexeme.
    RegexConflict,
    /// Duplicate kind/location/lexeme item in one AST former.
    DupAstItem,
    /// A syntax error in parsed source.
    Syntax,
    /// A lexical error in parsed source.
    Lexical,
    /// An AST former or guard indexed a child out of range.
    AstIndex,
}

impl ErrorType {
    /// Warnings are severity 0, everything else severity 1.
    pub fn severity(self) -> i32 {
        match self {
            ErrorType::Warning
            | ErrorType::UnusedTerm
            | ErrorType::UnusedNonterm
            | ErrorType::UselessRule => 0,
            _ => 1,
        }
    }
}

/// A fully resolved diagnostic, ready to show to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    error_type: ErrorType,
    location: i64,
    position: SourcePosition,
    short_message: String,
    long_message: String,
}

impl ErrorMessage {
    /// The diagnostic's classification code.
    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    /// The classification code's display name.
    pub fn tag(&self) -> String {
        self.error_type.to_string()
    }

    /// 0 for warnings, 1 for errors.
    pub fn severity(&self) -> i32 {
        self.error_type.severity()
    }

    /// Code-point offset into the offending source, or -1 when the
    /// diagnostic has no location.
    pub fn location(&self) -> i64 {
        self.location
    }

    /// 1-based line of the location, or -1.
    pub fn line_num(&self) -> i64 {
        self.position.line_num
    }

    /// 1-based column of the location, or -1.
    pub fn column_num(&self) -> i64 {
        self.position.column_num
    }

    /// The text of the offending source line.
    pub fn source_line(&self) -> &str {
        &self.position.line
    }

    /// The one-line message.
    pub fn short_message(&self) -> &str {
        &self.short_message
    }

    /// The long-form message; falls back to the short one.
    pub fn long_message(&self) -> &str {
        &self.long_message
    }

    /// One-line rendering used by listings and tests.
    pub fn to_display_string(&self) -> String {
        if self.position.line_num < 0 {
            format!("{}: {}", self.tag(), self.short_message)
        } else {
            format!(
                "{}:{}: {}: {}",
                self.position.line_num, self.position.column_num, self.tag(), self.short_message
            )
        }
    }
}

#[derive(Debug, Clone)]
struct RawMessage {
    error_type: ErrorType,
    location: i64,
    short_message: String,
    long_message: String,
}

/// The ordered diagnostic list. One of these is attached to every
/// `generate` or `parse` run; locations index the run's source buffer.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler {
    messages: Vec<RawMessage>,
    error_count: usize,
    warning_count: usize,
}

impl ErrorHandler {
    pub fn new() -> ErrorHandler {
        ErrorHandler::default()
    }

    /// Append a diagnostic at a source location (-1 for none).
    pub fn add_error(&mut self, error_type: ErrorType, location: i64, short_message: &str) {
        self.add_error_long(error_type, location, short_message, short_message);
    }

    /// Append a diagnostic carrying a separate long-form message.
    pub fn add_error_long(
        &mut self,
        error_type: ErrorType,
        location: i64,
        short_message: &str,
        long_message: &str,
    ) {
        if error_type.severity() > 0 {
            self.error_count += 1;
        } else {
            self.warning_count += 1;
        }
        self.messages.push(RawMessage {
            error_type,
            location,
            short_message: short_message.to_string(),
            long_message: long_message.to_string(),
        });
    }

    /// The number of error-severity diagnostics so far.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// The number of warning-severity diagnostics so far.
    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    /// Resolve all diagnostics against `src` and return them sorted by
    /// location. The sort is stable, so diagnostics at one location keep
    /// their insertion order.
    pub fn error_messages(&self, src: &SourceBuffer) -> Vec<ErrorMessage> {
        let mut messages: Vec<ErrorMessage> = self
            .messages
            .iter()
            .map(|raw| ErrorMessage {
                error_type: raw.error_type,
                location: raw.location,
                position: src.position(raw.location),
                short_message: raw.short_message.clone(),
                long_message: raw.long_message.clone(),
            })
            .collect();
        messages.sort_by_key(|m| m.location);
        messages
    }
}

/// The error type surfaced by the public [`Parser`](crate::Parser) API.
#[derive(Debug, thiserror::Error)]
pub enum HoshiError {
    #[error("grammar errors: {0}")]
    /// Grammar-severity diagnostics were produced during generation. The
    /// collected messages remain available on the parser.
    Grammar(String),
    #[error("source errors: {0}")]
    /// Source-severity diagnostics were produced during a parse. The
    /// collected messages remain available on the parser.
    Source(String),
    #[error("invalid parser state: {0}")]
    /// The operation is not legal in the parser's current state.
    State(String),
    #[error("kind map error: {0}")]
    /// The caller-supplied kind map is not bijective or is missing an
    /// encoded kind.
    KindMap(String),
    #[error("invalid encoded parser: {0}")]
    /// An encoded parser string failed to decode.
    Decode(String),
    #[error("version mismatch in encoded parser: {0}")]
    /// An encoded parser was produced by an incompatible library version.
    VersionMismatch(String),
    #[error("i/o error: {0}")]
    /// An I/O failure while exporting.
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_sort_by_location_stably() {
        let src = SourceBuffer::new("a\nb\nc");
        let mut errh = ErrorHandler::new();
        errh.add_error(ErrorType::Syntax, 4, "third");
        errh.add_error(ErrorType::Syntax, 0, "first");
        errh.add_error(ErrorType::Lexical, 4, "fourth");
        errh.add_error(ErrorType::Warning, 2, "second");
        let messages = errh.error_messages(&src);
        let shorts: Vec<&str> = messages.iter().map(|m| m.short_message()).collect();
        assert_eq!(shorts, vec!["first", "second", "third", "fourth"]);
        assert_eq!(errh.error_count(), 3);
        assert_eq!(errh.warning_count(), 1);
        assert_eq!(messages[1].line_num(), 2);
    }
}
