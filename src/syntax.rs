//! The grammar front-end: surface syntax tree and the `nom` parsers that
//! build it from grammar source text, regex strings and guard actions.
//!
//! The extractor consumes the tree produced here; nothing downstream
//! looks at source text again.
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::satisfy;
use nom::combinator::recognize;
use nom::error::{Error, ErrorKind};
use nom::sequence::pair;
use nom::IResult;
use strum::Display;

/// Node kinds of the surface syntax tree.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxKind {
    Null,
    Grammar,
    OptionList,
    TokenList,
    RuleList,
    Lookaheads,
    Conflicts,
    ErrorRecovery,
    KeepWhitespace,
    CaseSensitive,
    TokenDeclaration,
    TokenOptionList,
    TokenTemplate,
    TokenDescription,
    TokenRegexList,
    TokenRegex,
    TokenPrecedence,
    TokenAction,
    TokenLexeme,
    TokenIgnore,
    TokenError,
    Rule,
    RuleRhsList,
    RuleRhs,
    Optional,
    ZeroClosure,
    OneClosure,
    Group,
    RulePrecedence,
    RulePrecedenceList,
    RulePrecedenceSpec,
    RuleLeftAssoc,
    RuleRightAssoc,
    RuleOperatorList,
    RuleOperatorSpec,
    TerminalReference,
    NonterminalReference,
    Empty,
    AstFormer,
    AstChild,
    AstDot,
    AstSlice,
    AstLocation,
    AstLocationNum,
    AstLexeme,
    AstLexemeString,
    Identifier,
    Integer,
    NegativeInteger,
    String,
    True,
    False,
    Regex,
    RegexOr,
    RegexList,
    RegexOptional,
    RegexZeroClosure,
    RegexOneClosure,
    RegexChar,
    RegexWildcard,
    RegexWhitespace,
    RegexNotWhitespace,
    RegexDigits,
    RegexNotDigits,
    Charset,
    CharsetInvert,
    CharsetRange,
    CharsetChar,
    CharsetWhitespace,
    CharsetNotWhitespace,
    CharsetDigits,
    CharsetNotDigits,
    MacroString,
    ActionStatementList,
    ActionAssign,
    ActionEqual,
    ActionNotEqual,
    ActionLessThan,
    ActionLessEqual,
    ActionGreaterThan,
    ActionGreaterEqual,
    ActionAdd,
    ActionSubtract,
    ActionMultiply,
    ActionDivide,
    ActionUnaryMinus,
    ActionAnd,
    ActionOr,
    ActionNot,
    ActionDumpStack,
}

/// A node of the surface syntax tree.
///
/// During parsing `location` temporarily holds the length of the
/// remaining input at the node's start; `finish_locations` converts that
/// into a code-point offset once the whole tree exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarAst {
    pub kind: SyntaxKind,
    pub location: i64,
    pub lexeme: String,
    pub children: Vec<GrammarAst>,
}

impl GrammarAst {
    pub fn new(kind: SyntaxKind, location: i64, lexeme: &str, children: Vec<GrammarAst>) -> Self {
        GrammarAst {
            kind,
            location,
            lexeme: lexeme.to_string(),
            children,
        }
    }

    pub fn null() -> Self {
        GrammarAst::new(SyntaxKind::Null, -1, "", vec![])
    }

    pub fn is_null(&self) -> bool {
        self.kind == SyntaxKind::Null
    }

    pub fn child(&self, index: usize) -> &GrammarAst {
        &self.children[index]
    }

    /// Force one location onto the whole subtree. Used for trees built
    /// outside any source, like library token regexes.
    pub fn set_all_locations(&mut self, location: i64) {
        self.location = location;
        for child in &mut self.children {
            child.set_all_locations(location);
        }
    }

    fn finish_locations(&mut self, full_len: usize, byte_to_char: &[i64]) {
        if self.location >= 0 {
            let byte = full_len - self.location as usize;
            self.location = byte_to_char[byte];
        }
        for child in &mut self.children {
            child.finish_locations(full_len, byte_to_char);
        }
    }

    /// Render the subtree as an indented listing for debugging.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(0, &mut out);
        out
    }

    fn dump_into(&self, indent: usize, out: &mut String) {
        use std::fmt::Write as _;
        let _ = write!(out, "{:indent$}{}", "", self.kind, indent = indent);
        if !self.lexeme.is_empty() {
            let _ = write!(out, " \"{}\"", self.lexeme);
        }
        if self.location >= 0 {
            let _ = write!(out, " @ {}", self.location);
        }
        out.push('\n');
        for child in &self.children {
            child.dump_into(indent + 4, out);
        }
    }
}

type PResult<'a, T> = IResult<&'a str, T>;

fn parse_error<T>(i: &str) -> PResult<T> {
    Err(nom::Err::Error(Error::new(i, ErrorKind::Alt)))
}

fn parse_failure<T>(i: &str) -> PResult<T> {
    Err(nom::Err::Failure(Error::new(i, ErrorKind::Verify)))
}

/// Skip whitespace and `//` comments.
fn ws(mut i: &str) -> &str {
    loop {
        let trimmed = i.trim_start();
        if let Some(rest) = trimmed.strip_prefix("//") {
            match rest.find('\n') {
                Some(n) => i = &rest[n..],
                None => return "",
            }
        } else {
            return trimmed;
        }
    }
}

fn mark(i: &str) -> i64 {
    i.len() as i64
}

/// Match punctuation after skipping blanks.
fn punct<'a>(i: &'a str, token: &str) -> PResult<'a, i64> {
    let i = ws(i);
    let m = mark(i);
    match i.strip_prefix(token) {
        Some(rest) => Ok((rest, m)),
        None => parse_error(i),
    }
}

/// Match a whole word, refusing to split an identifier.
fn keyword<'a>(i: &'a str, word: &str) -> PResult<'a, i64> {
    let i = ws(i);
    let m = mark(i);
    match i.strip_prefix(word) {
        Some(rest)
            if !rest
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            Ok((rest, m))
        }
        _ => parse_error(i),
    }
}

fn lex_identifier(i: &str) -> PResult<(i64, &str)> {
    let i = ws(i);
    let m = mark(i);
    let (rest, name) = recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(i)?;
    Ok((rest, (m, name)))
}

fn lex_digits(i: &str) -> PResult<(i64, &str)> {
    let i = ws(i);
    let m = mark(i);
    let (rest, digits) = take_while1(|c: char| c.is_ascii_digit())(i)?;
    Ok((rest, (m, digits)))
}

/// An optionally negative integer literal, as an `Integer` or
/// `NegativeInteger` node whose lexeme is the digit string.
fn parse_signed_int(i: &str) -> PResult<GrammarAst> {
    let i = ws(i);
    let m = mark(i);
    let (i, negative) = match i.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (i, false),
    };
    let (i, (_, digits)) = lex_digits(i)?;
    let kind = if negative {
        SyntaxKind::NegativeInteger
    } else {
        SyntaxKind::Integer
    };
    Ok((i, GrammarAst::new(kind, m, digits, vec![])))
}

/// A string literal. Triple-quoted forms are raw; single-quoted forms
/// process `\n \r \t \\ \' \"` and keep any other escape verbatim so
/// regex escapes pass through untouched.
fn lex_string(i: &str) -> PResult<(i64, String)> {
    let i = ws(i);
    let m = mark(i);
    for raw in ["'''", "\"\"\""] {
        if let Some(rest) = i.strip_prefix(raw) {
            return match rest.find(raw) {
                Some(n) => Ok((&rest[n + 3..], (m, rest[..n].to_string()))),
                None => parse_failure(i),
            };
        }
    }
    let quote = match i.chars().next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return parse_error(i),
    };
    let mut content = String::new();
    let mut chars = i[1..].char_indices();
    while let Some((n, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((&i[1 + n + 1..], (m, content))),
            '\\' => match chars.next() {
                Some((_, 'n')) => content.push('\n'),
                Some((_, 'r')) => content.push('\r'),
                Some((_, 't')) => content.push('\t'),
                Some((_, '\\')) => content.push('\\'),
                Some((_, e)) if e == quote => content.push(e),
                Some((_, e)) => {
                    content.push('\\');
                    content.push(e);
                }
                None => return parse_failure(i),
            },
            c => content.push(c),
        }
    }
    parse_failure(i)
}

fn parse_bool(i: &str) -> PResult<GrammarAst> {
    if let Ok((i, m)) = keyword(i, "true") {
        return Ok((i, GrammarAst::new(SyntaxKind::True, m, "", vec![])));
    }
    if let Ok((i, m)) = keyword(i, "false") {
        return Ok((i, GrammarAst::new(SyntaxKind::False, m, "", vec![])));
    }
    parse_error(i)
}

//
//  Grammar sections
//

/// Parse a whole grammar source. On success the returned tree has
/// code-point locations; on failure the error is a code-point offset and
/// a message.
pub fn parse_grammar(text: &str) -> Result<GrammarAst, (i64, String)> {
    let full_len = text.len();
    let mut byte_to_char = vec![0i64; full_len + 1];
    let mut chars = 0i64;
    for (byte, _) in text.char_indices() {
        byte_to_char[byte] = chars;
        chars += 1;
    }
    byte_to_char[full_len] = chars;

    match parse_grammar_inner(text) {
        Ok((rest, mut root)) => {
            let rest = ws(rest);
            if !rest.is_empty() {
                return Err((
                    byte_to_char[full_len - rest.len()],
                    syntax_message(rest),
                ));
            }
            root.finish_locations(full_len, &byte_to_char);
            Ok(root)
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err((
            byte_to_char[full_len - e.input.len()],
            syntax_message(e.input),
        )),
        Err(nom::Err::Incomplete(_)) => Err((chars, "unexpected end of grammar".to_string())),
    }
}

fn syntax_message(rest: &str) -> String {
    let rest = ws(rest);
    if rest.is_empty() {
        "unexpected end of grammar".to_string()
    } else {
        let snippet: String = rest.chars().take(12).take_while(|&c| c != '\n').collect();
        format!("syntax error in grammar near \"{snippet}\"")
    }
}

fn parse_grammar_inner(i: &str) -> PResult<GrammarAst> {
    let m = mark(ws(i));
    let (i, options) = parse_option_section(i)?;
    let (i, tokens) = parse_token_section(i)?;
    let (i, rules) = parse_rule_section(i)?;
    Ok((
        i,
        GrammarAst::new(SyntaxKind::Grammar, m, "", vec![options, tokens, rules]),
    ))
}

fn parse_option_section(i: &str) -> PResult<GrammarAst> {
    let (mut i, m) = match keyword(i, "options") {
        Ok(ok) => ok,
        Err(_) => {
            return Ok((i, GrammarAst::new(SyntaxKind::OptionList, -1, "", vec![])));
        }
    };
    let mut children = vec![];
    loop {
        let Ok((rest, (name_mark, name))) = lex_identifier(i) else {
            break;
        };
        if name == "tokens" || name == "rules" {
            break;
        }
        let Ok((rest, _)) = punct(rest, "=") else {
            break;
        };
        let (rest, option) = match name {
            "lookaheads" => {
                let (rest, value) = parse_signed_int(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::Lookaheads, name_mark, "", vec![value]),
                )
            }
            "conflicts" => {
                let (rest, value) = parse_signed_int(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::Conflicts, name_mark, "", vec![value]),
                )
            }
            "error_recovery" => {
                let (rest, value) = parse_bool(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::ErrorRecovery, name_mark, "", vec![value]),
                )
            }
            "keep_whitespace" => {
                let (rest, value) = parse_bool(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::KeepWhitespace, name_mark, "", vec![value]),
                )
            }
            "case_sensitive" => {
                let (rest, value) = parse_bool(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::CaseSensitive, name_mark, "", vec![value]),
                )
            }
            _ => return parse_failure(i),
        };
        children.push(option);
        i = rest;
    }
    Ok((i, GrammarAst::new(SyntaxKind::OptionList, m, "", children)))
}

fn parse_token_section(i: &str) -> PResult<GrammarAst> {
    let (mut i, m) = match keyword(i, "tokens") {
        Ok(ok) => ok,
        Err(_) => {
            return Ok((i, GrammarAst::new(SyntaxKind::TokenList, -1, "", vec![])));
        }
    };
    let mut children = vec![];
    while let Ok((rest, decl)) = parse_token_declaration(i) {
        children.push(decl);
        i = rest;
    }
    Ok((i, GrammarAst::new(SyntaxKind::TokenList, m, "", children)))
}

fn parse_token_name(i: &str) -> PResult<GrammarAst> {
    let (i, m) = punct(i, "<")?;
    let (i, (_, name)) = lex_identifier(i)?;
    let (i, _) = punct(i, ">")?;
    Ok((
        i,
        GrammarAst::new(SyntaxKind::Identifier, m, &format!("<{name}>"), vec![]),
    ))
}

fn parse_token_declaration(i: &str) -> PResult<GrammarAst> {
    let (i, name) = parse_token_name(i)?;
    let m = name.location;
    let (mut i, _) = punct(i, ":")?;
    let mut options = vec![];
    loop {
        let Ok((rest, (opt_mark, opt_name))) = lex_identifier(i) else {
            break;
        };
        if opt_name == "rules" {
            break;
        }
        let Ok((rest, _)) = punct(rest, "=") else {
            break;
        };
        let (rest, option) = match opt_name {
            "template" => {
                let (rest, (_, value)) = lex_identifier(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenTemplate, opt_mark, value, vec![]),
                )
            }
            "description" => {
                let (rest, (str_mark, value)) = lex_string(rest)?;
                let node = GrammarAst::new(SyntaxKind::String, str_mark, &value, vec![]);
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenDescription, opt_mark, "", vec![node]),
                )
            }
            "regex" => {
                let (rest, (str_mark, value)) = lex_string(rest)?;
                let mut regex = match parse_regex(&value) {
                    Ok(regex) => regex,
                    Err(_) => return parse_failure(i),
                };
                regex.set_all_locations(str_mark);
                let token_regex = GrammarAst::new(
                    SyntaxKind::TokenRegex,
                    str_mark,
                    "",
                    vec![GrammarAst::null(), regex],
                );
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenRegexList, opt_mark, "", vec![token_regex]),
                )
            }
            "precedence" => {
                let (rest, value) = parse_signed_int(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenPrecedence, opt_mark, "", vec![value]),
                )
            }
            "lexeme" => {
                let (rest, value) = parse_bool(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenLexeme, opt_mark, "", vec![value]),
                )
            }
            "ignore" => {
                let (rest, value) = parse_bool(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenIgnore, opt_mark, "", vec![value]),
                )
            }
            "error" => {
                let (rest, (str_mark, value)) = lex_string(rest)?;
                let node = GrammarAst::new(SyntaxKind::String, str_mark, &value, vec![]);
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenError, opt_mark, "", vec![node]),
                )
            }
            "action" => {
                let (rest, body) = parse_action_block(rest)?;
                (
                    rest,
                    GrammarAst::new(SyntaxKind::TokenAction, opt_mark, "", vec![body]),
                )
            }
            _ => return parse_failure(i),
        };
        options.push(option);
        i = rest;
    }
    let option_list = GrammarAst::new(SyntaxKind::TokenOptionList, m, "", options);
    Ok((
        i,
        GrammarAst::new(SyntaxKind::TokenDeclaration, m, "", vec![name, option_list]),
    ))
}

fn parse_rule_section(i: &str) -> PResult<GrammarAst> {
    let (mut i, m) = match keyword(i, "rules") {
        Ok(ok) => ok,
        Err(_) => {
            return Ok((i, GrammarAst::new(SyntaxKind::RuleList, -1, "", vec![])));
        }
    };
    let mut children = vec![];
    while let Ok((rest, rule)) = parse_rule(i) {
        children.push(rule);
        i = rest;
    }
    Ok((i, GrammarAst::new(SyntaxKind::RuleList, m, "", children)))
}

fn parse_rule(i: &str) -> PResult<GrammarAst> {
    let (i, (m, lhs_name)) = lex_identifier(i)?;
    let (i, _) = punct(i, "::=")?;
    let lhs = GrammarAst::new(
        SyntaxKind::NonterminalReference,
        m,
        lhs_name,
        vec![],
    );
    if let Ok((i, _)) = keyword(i, "precedence") {
        let (i, term) = parse_rhs_primary(i)?;
        let mut specs = vec![];
        let (mut i, first) = parse_precedence_spec(i)?;
        specs.push(first);
        while let Ok((rest, spec)) = parse_precedence_spec(i) {
            specs.push(spec);
            i = rest;
        }
        let spec_list = GrammarAst::new(SyntaxKind::RulePrecedenceList, m, "", specs);
        return Ok((
            i,
            GrammarAst::new(SyntaxKind::RulePrecedence, m, "", vec![lhs, term, spec_list]),
        ));
    }
    let (i, rhs_list) = parse_rhs_list(i)?;
    let (i, former) = parse_opt_former(i)?;
    let (i, action) = parse_opt_action(i)?;
    Ok((
        i,
        GrammarAst::new(SyntaxKind::Rule, m, "", vec![lhs, rhs_list, former, action]),
    ))
}

fn parse_precedence_spec(i: &str) -> PResult<GrammarAst> {
    let (i, assoc) = if let Ok((i, m)) = punct(i, "<<") {
        (i, GrammarAst::new(SyntaxKind::RuleLeftAssoc, m, "", vec![]))
    } else if let Ok((i, m)) = punct(i, ">>") {
        (i, GrammarAst::new(SyntaxKind::RuleRightAssoc, m, "", vec![]))
    } else {
        return parse_error(i);
    };
    let m = assoc.location;
    let (mut i, _) = punct(i, "{")?;
    let mut operators = vec![];
    loop {
        let Ok((rest, op)) = parse_terminal_reference(i) else {
            break;
        };
        let (rest, former) = parse_opt_former(rest)?;
        let (rest, action) = parse_opt_action(rest)?;
        let (rest, _) = punct(rest, ",").unwrap_or((rest, 0));
        operators.push(GrammarAst::new(
            SyntaxKind::RuleOperatorSpec,
            op.location,
            "",
            vec![op, former, action],
        ));
        i = rest;
    }
    if operators.is_empty() {
        return parse_failure(i);
    }
    let (i, _) = punct(i, "}")?;
    let op_list = GrammarAst::new(SyntaxKind::RuleOperatorList, m, "", operators);
    Ok((
        i,
        GrammarAst::new(SyntaxKind::RulePrecedenceSpec, m, "", vec![assoc, op_list]),
    ))
}

fn parse_rhs_list(i: &str) -> PResult<GrammarAst> {
    let (mut i, first) = parse_rhs(i)?;
    let m = first.location;
    let mut children = vec![first];
    while let Ok((rest, _)) = punct(i, "|") {
        let (rest, rhs) = parse_rhs(rest)?;
        children.push(rhs);
        i = rest;
    }
    Ok((i, GrammarAst::new(SyntaxKind::RuleRhsList, m, "", children)))
}

/// One alternative: its items followed by two trailing slots holding the
/// alternative's former and guard (null nodes when absent).
fn parse_rhs(i: &str) -> PResult<GrammarAst> {
    let (mut i, first) = parse_rhs_item(i)?;
    let m = first.location;
    let mut children = vec![first];
    while let Ok((rest, item)) = parse_rhs_item(i) {
        children.push(item);
        i = rest;
    }
    let (i, former) = parse_opt_former(i)?;
    let (i, action) = parse_opt_action(i)?;
    children.push(former);
    children.push(action);
    Ok((i, GrammarAst::new(SyntaxKind::RuleRhs, m, "", children)))
}

fn parse_rhs_item(i: &str) -> PResult<GrammarAst> {
    let (mut i, mut item) = parse_rhs_primary(i)?;
    loop {
        if let Ok((rest, m)) = punct(i, "?") {
            item = GrammarAst::new(SyntaxKind::Optional, m, "", vec![item]);
            i = rest;
        } else if let Ok((rest, m)) = punct(i, "*") {
            item = GrammarAst::new(SyntaxKind::ZeroClosure, m, "", vec![item]);
            i = rest;
        } else if let Ok((rest, m)) = punct(i, "+") {
            item = GrammarAst::new(SyntaxKind::OneClosure, m, "", vec![item]);
            i = rest;
        } else {
            return Ok((i, item));
        }
    }
}

fn parse_rhs_primary(i: &str) -> PResult<GrammarAst> {
    if let Ok(ok) = parse_terminal_reference(i) {
        return Ok(ok);
    }
    if let Ok((i, m)) = keyword(i, "empty") {
        return Ok((i, GrammarAst::new(SyntaxKind::Empty, m, "", vec![])));
    }
    if let Ok((i, m)) = punct(i, "{") {
        let (i, rhs_list) = parse_rhs_list(i)?;
        let (i, former) = parse_opt_former(i)?;
        let (i, action) = parse_opt_action(i)?;
        let (i, _) = punct(i, "}")?;
        return Ok((
            i,
            GrammarAst::new(SyntaxKind::Group, m, "", vec![rhs_list, former, action]),
        ));
    }
    // A bare identifier is a nonterminal reference, unless it starts the
    // next rule.
    let (rest, (m, name)) = lex_identifier(i)?;
    if punct(rest, "::=").is_ok() {
        return parse_error(i);
    }
    Ok((
        rest,
        GrammarAst::new(SyntaxKind::NonterminalReference, m, name, vec![]),
    ))
}

fn parse_terminal_reference(i: &str) -> PResult<GrammarAst> {
    if let Ok((i, name)) = parse_token_name(i) {
        let location = name.location;
        return Ok((
            i,
            GrammarAst::new(SyntaxKind::TerminalReference, location, &name.lexeme, vec![]),
        ));
    }
    let checkpoint = ws(i);
    if checkpoint.starts_with('\'') {
        let (i, (m, content)) = lex_string(checkpoint)?;
        let string_node = GrammarAst::new(SyntaxKind::String, m, &content, vec![]);
        return Ok((
            i,
            GrammarAst::new(
                SyntaxKind::TerminalReference,
                m,
                &format!("'{content}'"),
                vec![string_node],
            ),
        ));
    }
    parse_error(i)
}

//
//  AST formers
//

fn parse_opt_former(i: &str) -> PResult<GrammarAst> {
    match punct(i, ":") {
        Ok((i, _)) => parse_former(i),
        Err(_) => Ok((i, GrammarAst::null())),
    }
}

fn parse_former(i: &str) -> PResult<GrammarAst> {
    let (mut i, m) = punct(i, "(")?;
    let mut children = vec![];
    match lex_identifier(i) {
        Ok((rest, (kind_mark, kind_name))) => {
            children.push(GrammarAst::new(
                SyntaxKind::Identifier,
                kind_mark,
                kind_name,
                vec![],
            ));
            i = rest;
        }
        Err(_) => {
            children.push(GrammarAst::new(SyntaxKind::Identifier, m, "Unknown", vec![]));
        }
    }
    while let Ok((rest, item)) = parse_former_item(i) {
        children.push(item);
        i = rest;
    }
    let (i, _) = punct(i, ")")?;
    Ok((i, GrammarAst::new(SyntaxKind::AstFormer, m, "", children)))
}

fn parse_former_item(i: &str) -> PResult<GrammarAst> {
    if let Ok((i, _)) = punct(i, "$") {
        return parse_child_reference(i);
    }
    if let Ok((i, m)) = punct(i, "@") {
        if let Ok((i, _)) = punct(i, "$") {
            let (i, dot) = parse_dot_path(i)?;
            return Ok((
                i,
                GrammarAst::new(SyntaxKind::AstLocation, m, "", vec![dot]),
            ));
        }
        let (i, value) = parse_signed_int(i)?;
        return Ok((
            i,
            GrammarAst::new(SyntaxKind::AstLocationNum, m, "", vec![value]),
        ));
    }
    if let Ok((i, m)) = punct(i, "&") {
        if let Ok((i, _)) = punct(i, "$") {
            let (i, dot) = parse_dot_path(i)?;
            return Ok((i, GrammarAst::new(SyntaxKind::AstLexeme, m, "", vec![dot])));
        }
        let (i, (str_mark, content)) = lex_string(i)?;
        let node = GrammarAst::new(SyntaxKind::String, str_mark, &content, vec![]);
        return Ok((
            i,
            GrammarAst::new(SyntaxKind::AstLexemeString, m, "", vec![node]),
        ));
    }
    // Nested formers appear directly as items.
    if ws(i).starts_with('(') {
        return parse_former(i);
    }
    parse_error(i)
}

fn parse_dot_path(i: &str) -> PResult<GrammarAst> {
    let (mut i, first) = parse_signed_int(i)?;
    let m = first.location;
    let mut components = vec![first];
    while let Ok((rest, _)) = punct(i, ".") {
        let (rest, component) = parse_signed_int(rest)?;
        components.push(component);
        i = rest;
    }
    Ok((i, GrammarAst::new(SyntaxKind::AstDot, m, "", components)))
}

fn parse_child_reference(i: &str) -> PResult<GrammarAst> {
    let (i, dot) = parse_dot_path(i)?;
    let m = dot.location;
    if let Ok((i, slice_mark)) = punct(i, "[") {
        let (i, first) = parse_signed_int(i)?;
        let (i, _) = punct(i, ",")?;
        let (i, last) = parse_signed_int(i)?;
        let (i, _) = punct(i, "]")?;
        let slice = GrammarAst::new(SyntaxKind::AstSlice, slice_mark, "", vec![first, last]);
        return Ok((
            i,
            GrammarAst::new(SyntaxKind::AstChild, m, "", vec![dot, slice]),
        ));
    }
    Ok((
        i,
        GrammarAst::new(
            SyntaxKind::AstChild,
            m,
            "",
            vec![dot, GrammarAst::null()],
        ),
    ))
}

//
//  Guard actions
//

fn parse_opt_action(i: &str) -> PResult<GrammarAst> {
    match punct(i, "=>") {
        Ok((i, _)) => parse_action_block(i),
        Err(_) => Ok((i, GrammarAst::null())),
    }
}

fn parse_action_block(i: &str) -> PResult<GrammarAst> {
    let (mut i, m) = punct(i, "{")?;
    let mut statements = vec![];
    loop {
        if let Ok((rest, stmt_mark)) = keyword(i, "dump_stack") {
            let (rest, _) = punct(rest, ";")?;
            statements.push(GrammarAst::new(
                SyntaxKind::ActionDumpStack,
                stmt_mark,
                "",
                vec![],
            ));
            i = rest;
            continue;
        }
        let Ok((rest, (name_mark, name))) = lex_identifier(i) else {
            break;
        };
        let Ok((rest, _)) = punct(rest, ":=") else {
            break;
        };
        let (rest, expr) = parse_action_expr(rest)?;
        let (rest, _) = punct(rest, ";")?;
        let target = GrammarAst::new(SyntaxKind::Identifier, name_mark, name, vec![]);
        statements.push(GrammarAst::new(
            SyntaxKind::ActionAssign,
            name_mark,
            "",
            vec![target, expr],
        ));
        i = rest;
    }
    let (i, _) = punct(i, "}")?;
    Ok((
        i,
        GrammarAst::new(SyntaxKind::ActionStatementList, m, "", statements),
    ))
}

fn parse_action_expr(i: &str) -> PResult<GrammarAst> {
    let (mut i, mut left) = parse_action_and(i)?;
    while let Ok((rest, m)) = punct(i, "||") {
        let (rest, right) = parse_action_and(rest)?;
        left = GrammarAst::new(SyntaxKind::ActionOr, m, "", vec![left, right]);
        i = rest;
    }
    Ok((i, left))
}

fn parse_action_and(i: &str) -> PResult<GrammarAst> {
    let (mut i, mut left) = parse_action_cmp(i)?;
    while let Ok((rest, m)) = punct(i, "&&") {
        let (rest, right) = parse_action_cmp(rest)?;
        left = GrammarAst::new(SyntaxKind::ActionAnd, m, "", vec![left, right]);
        i = rest;
    }
    Ok((i, left))
}

fn parse_action_cmp(i: &str) -> PResult<GrammarAst> {
    let (i, left) = parse_action_add(i)?;
    for (token, kind) in [
        ("==", SyntaxKind::ActionEqual),
        ("!=", SyntaxKind::ActionNotEqual),
        ("<=", SyntaxKind::ActionLessEqual),
        (">=", SyntaxKind::ActionGreaterEqual),
        ("<", SyntaxKind::ActionLessThan),
        (">", SyntaxKind::ActionGreaterThan),
    ] {
        if let Ok((rest, m)) = punct(i, token) {
            let (rest, right) = parse_action_add(rest)?;
            return Ok((rest, GrammarAst::new(kind, m, "", vec![left, right])));
        }
    }
    Ok((i, left))
}

fn parse_action_add(i: &str) -> PResult<GrammarAst> {
    let (mut i, mut left) = parse_action_mul(i)?;
    loop {
        if let Ok((rest, m)) = punct(i, "+") {
            let (rest, right) = parse_action_mul(rest)?;
            left = GrammarAst::new(SyntaxKind::ActionAdd, m, "", vec![left, right]);
            i = rest;
        } else if let Ok((rest, m)) = punct(i, "-") {
            let (rest, right) = parse_action_mul(rest)?;
            left = GrammarAst::new(SyntaxKind::ActionSubtract, m, "", vec![left, right]);
            i = rest;
        } else {
            return Ok((i, left));
        }
    }
}

fn parse_action_mul(i: &str) -> PResult<GrammarAst> {
    let (mut i, mut left) = parse_action_unary(i)?;
    loop {
        if let Ok((rest, m)) = punct(i, "*") {
            let (rest, right) = parse_action_unary(rest)?;
            left = GrammarAst::new(SyntaxKind::ActionMultiply, m, "", vec![left, right]);
            i = rest;
        } else if let Ok((rest, m)) = punct(i, "/") {
            let (rest, right) = parse_action_unary(rest)?;
            left = GrammarAst::new(SyntaxKind::ActionDivide, m, "", vec![left, right]);
            i = rest;
        } else {
            return Ok((i, left));
        }
    }
}

fn parse_action_unary(i: &str) -> PResult<GrammarAst> {
    if let Ok((rest, m)) = punct(i, "-") {
        let (rest, operand) = parse_action_unary(rest)?;
        return Ok((
            rest,
            GrammarAst::new(SyntaxKind::ActionUnaryMinus, m, "", vec![operand]),
        ));
    }
    if let Ok((rest, m)) = punct(i, "!") {
        let (rest, operand) = parse_action_unary(rest)?;
        return Ok((
            rest,
            GrammarAst::new(SyntaxKind::ActionNot, m, "", vec![operand]),
        ));
    }
    if let Ok((rest, _)) = punct(i, "(") {
        let (rest, expr) = parse_action_expr(rest)?;
        let (rest, _) = punct(rest, ")")?;
        return Ok((rest, expr));
    }
    if let Ok((rest, (m, digits))) = lex_digits(i) {
        return Ok((
            rest,
            GrammarAst::new(SyntaxKind::Integer, m, digits, vec![]),
        ));
    }
    let (rest, (m, name)) = lex_identifier(i)?;
    Ok((
        rest,
        GrammarAst::new(SyntaxKind::Identifier, m, name, vec![]),
    ))
}

//
//  Regular expressions
//

/// Parse the content of a regex string. Blanks outside character classes
/// are insignificant. Locations are filled in by the caller.
pub fn parse_regex(text: &str) -> Result<GrammarAst, String> {
    match parse_regex_alt(text) {
        Ok((rest, expr)) => {
            if !skip_regex_blanks(rest).is_empty() {
                return Err(format!("invalid regex near \"{}\"", skip_regex_blanks(rest)));
            }
            Ok(GrammarAst::new(SyntaxKind::Regex, -1, "", vec![expr]))
        }
        Err(_) => Err(format!("invalid regex \"{text}\"")),
    }
}

fn skip_regex_blanks(i: &str) -> &str {
    i.trim_start()
}

fn parse_regex_alt(i: &str) -> PResult<GrammarAst> {
    let (mut i, first) = parse_regex_concat(i)?;
    let mut alternatives = vec![first];
    loop {
        let rest = skip_regex_blanks(i);
        let Some(rest) = rest.strip_prefix('|') else {
            break;
        };
        let (rest, next) = parse_regex_concat(rest)?;
        alternatives.push(next);
        i = rest;
    }
    if alternatives.len() == 1 {
        Ok((i, alternatives.pop().unwrap()))
    } else {
        Ok((
            i,
            GrammarAst::new(SyntaxKind::RegexOr, -1, "", alternatives),
        ))
    }
}

fn parse_regex_concat(i: &str) -> PResult<GrammarAst> {
    let (mut i, first) = parse_regex_postfix(i)?;
    let mut items = vec![first];
    while let Ok((rest, item)) = parse_regex_postfix(i) {
        items.push(item);
        i = rest;
    }
    if items.len() == 1 {
        Ok((i, items.pop().unwrap()))
    } else {
        Ok((i, GrammarAst::new(SyntaxKind::RegexList, -1, "", items)))
    }
}

fn parse_regex_postfix(i: &str) -> PResult<GrammarAst> {
    let (mut i, mut item) = parse_regex_primary(i)?;
    loop {
        let rest = skip_regex_blanks(i);
        if let Some(rest) = rest.strip_prefix('*') {
            item = GrammarAst::new(SyntaxKind::RegexZeroClosure, -1, "", vec![item]);
            i = rest;
        } else if let Some(rest) = rest.strip_prefix('+') {
            item = GrammarAst::new(SyntaxKind::RegexOneClosure, -1, "", vec![item]);
            i = rest;
        } else if let Some(rest) = rest.strip_prefix('?') {
            item = GrammarAst::new(SyntaxKind::RegexOptional, -1, "", vec![item]);
            i = rest;
        } else {
            return Ok((i, item));
        }
    }
}

fn parse_regex_primary(i: &str) -> PResult<GrammarAst> {
    let i = skip_regex_blanks(i);
    let mut chars = i.chars();
    match chars.next() {
        None => parse_error(i),
        Some('(') => {
            let (rest, expr) = parse_regex_alt(chars.as_str())?;
            let rest = skip_regex_blanks(rest);
            match rest.strip_prefix(')') {
                Some(rest) => Ok((rest, expr)),
                None => parse_failure(rest),
            }
        }
        Some('[') => parse_regex_charset(chars.as_str()),
        Some('{') => {
            let rest = chars.as_str();
            match rest.find('}') {
                Some(n) => Ok((
                    &rest[n + 1..],
                    GrammarAst::new(SyntaxKind::MacroString, -1, rest[..n].trim(), vec![]),
                )),
                None => parse_failure(rest),
            }
        }
        Some('.') => Ok((
            chars.as_str(),
            GrammarAst::new(SyntaxKind::RegexWildcard, -1, "", vec![]),
        )),
        Some('\\') => {
            let rest = chars.as_str();
            let Some(escaped) = chars.next() else {
                return parse_failure(rest);
            };
            let rest = chars.as_str();
            let node = match escaped {
                's' => GrammarAst::new(SyntaxKind::RegexWhitespace, -1, "", vec![]),
                'S' => GrammarAst::new(SyntaxKind::RegexNotWhitespace, -1, "", vec![]),
                'd' => GrammarAst::new(SyntaxKind::RegexDigits, -1, "", vec![]),
                'D' => GrammarAst::new(SyntaxKind::RegexNotDigits, -1, "", vec![]),
                'n' => regex_char('\n'),
                'r' => regex_char('\r'),
                't' => regex_char('\t'),
                c if !c.is_ascii_alphanumeric() => regex_char(c),
                _ => return parse_failure(rest),
            };
            Ok((rest, node))
        }
        Some(c) if "*+?|)]".contains(c) => parse_error(i),
        Some(c) => Ok((chars.as_str(), regex_char(c))),
    }
}

fn regex_char(c: char) -> GrammarAst {
    GrammarAst::new(SyntaxKind::RegexChar, -1, &c.to_string(), vec![])
}

fn charset_char(c: char) -> GrammarAst {
    GrammarAst::new(SyntaxKind::CharsetChar, -1, &c.to_string(), vec![])
}

/// Parse a `[...]` class body. Blanks are literal inside a class.
fn parse_regex_charset(i: &str) -> PResult<GrammarAst> {
    let (mut i, kind) = match i.strip_prefix('^') {
        Some(rest) => (rest, SyntaxKind::CharsetInvert),
        None => (i, SyntaxKind::Charset),
    };
    let mut items = vec![];
    loop {
        let mut chars = i.chars();
        match chars.next() {
            None => return parse_failure(i),
            Some(']') => {
                i = chars.as_str();
                break;
            }
            Some(c) => {
                let (rest, low) = parse_charset_char(i, c, chars)?;
                if low.kind != SyntaxKind::CharsetChar {
                    items.push(low);
                    i = rest;
                    continue;
                }
                // A dash makes a two-ended range unless it closes the set.
                if let Some(after_dash) = rest.strip_prefix('-') {
                    if !after_dash.starts_with(']') {
                        let mut chars = after_dash.chars();
                        let Some(c) = chars.next() else {
                            return parse_failure(after_dash);
                        };
                        let (rest, high) = parse_charset_char(after_dash, c, chars)?;
                        if high.kind != SyntaxKind::CharsetChar {
                            return parse_failure(after_dash);
                        }
                        items.push(GrammarAst::new(
                            SyntaxKind::CharsetRange,
                            -1,
                            "",
                            vec![low, high],
                        ));
                        i = rest;
                        continue;
                    }
                }
                items.push(GrammarAst::new(SyntaxKind::CharsetRange, -1, "", vec![low]));
                i = rest;
            }
        }
    }
    Ok((i, GrammarAst::new(kind, -1, "", items)))
}

fn parse_charset_char<'a>(
    i: &'a str,
    c: char,
    mut chars: std::str::Chars<'a>,
) -> PResult<'a, GrammarAst> {
    if c != '\\' {
        return Ok((chars.as_str(), charset_char(c)));
    }
    let Some(escaped) = chars.next() else {
        return parse_failure(i);
    };
    let rest = chars.as_str();
    let node = match escaped {
        's' => GrammarAst::new(SyntaxKind::CharsetWhitespace, -1, "", vec![]),
        'S' => GrammarAst::new(SyntaxKind::CharsetNotWhitespace, -1, "", vec![]),
        'd' => GrammarAst::new(SyntaxKind::CharsetDigits, -1, "", vec![]),
        'D' => GrammarAst::new(SyntaxKind::CharsetNotDigits, -1, "", vec![]),
        'n' => charset_char('\n'),
        'r' => charset_char('\r'),
        't' => charset_char('\t'),
        c if !c.is_ascii_alphanumeric() => charset_char(c),
        _ => return parse_failure(rest),
    };
    Ok((rest, node))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_small_grammar() {
        let root = parse_grammar(
            r#"
            options
                lookaheads = 2
            tokens
                <integer> : regex = "[0-9]+"
            rules
                E ::= E '+' <integer> : (Add $1 $3)
                    | <integer>
            "#,
        )
        .unwrap();
        assert_eq!(root.kind, SyntaxKind::Grammar);
        let options = root.child(0);
        assert_eq!(options.children.len(), 1);
        assert_eq!(options.child(0).kind, SyntaxKind::Lookaheads);
        let tokens = root.child(1);
        assert_eq!(tokens.child(0).kind, SyntaxKind::TokenDeclaration);
        assert_eq!(tokens.child(0).child(0).lexeme, "<integer>");
        let rules = root.child(2);
        assert_eq!(rules.children.len(), 1);
        let rule = rules.child(0);
        assert_eq!(rule.kind, SyntaxKind::Rule);
        let alternatives = rule.child(1);
        assert_eq!(alternatives.children.len(), 2);
        let first = alternatives.child(0);
        assert_eq!(first.children.len(), 5);
        assert_eq!(first.child(3).kind, SyntaxKind::AstFormer);
        assert!(alternatives.child(1).child(1).is_null());
    }

    #[test]
    fn rule_boundaries_do_not_swallow_the_next_lhs() {
        let root = parse_grammar(
            "rules\n S ::= 'a' T\n T ::= 'b'\n",
        )
        .unwrap();
        let rules = root.child(2);
        assert_eq!(rules.children.len(), 2);
        let first_rhs = rules.child(0).child(1).child(0);
        // Two items plus the former/action slots.
        assert_eq!(first_rhs.children.len(), 4);
    }

    #[test]
    fn locations_are_code_point_offsets() {
        // The multibyte character in the comment shifts byte offsets
        // away from code-point offsets.
        let root = parse_grammar("rules // \u{00e9}\n S ::= 'a'\n").unwrap();
        let rule = root.child(2).child(0);
        assert_eq!(rule.location, 12);
    }

    #[test]
    fn precedence_tiers_parse() {
        let root = parse_grammar(
            "rules\n E ::= precedence <integer> << { '+' '-' } >> { '^' }\n",
        )
        .unwrap();
        let rule = root.child(2).child(0);
        assert_eq!(rule.kind, SyntaxKind::RulePrecedence);
        let tiers = rule.child(2);
        assert_eq!(tiers.children.len(), 2);
        assert_eq!(tiers.child(0).child(0).kind, SyntaxKind::RuleLeftAssoc);
        assert_eq!(tiers.child(1).child(0).kind, SyntaxKind::RuleRightAssoc);
        assert_eq!(tiers.child(0).child(1).children.len(), 2);
    }

    #[test]
    fn regex_syntax() {
        let regex = parse_regex(r"[A-Za-z_] [A-Za-z0-9_]* | {integer} | a\.b").unwrap();
        assert_eq!(regex.kind, SyntaxKind::Regex);
        let alt = regex.child(0);
        assert_eq!(alt.kind, SyntaxKind::RegexOr);
        assert_eq!(alt.children.len(), 3);
        assert_eq!(alt.child(1).kind, SyntaxKind::MacroString);
        assert_eq!(alt.child(1).lexeme, "integer");
        assert!(parse_regex("a(b").is_err());
    }

    #[test]
    fn charset_ranges_and_classes() {
        let regex = parse_regex(r"[^a-z\d\]]").unwrap();
        let set = regex.child(0);
        assert_eq!(set.kind, SyntaxKind::CharsetInvert);
        assert_eq!(set.children.len(), 3);
        assert_eq!(set.child(0).children.len(), 2);
        assert_eq!(set.child(1).kind, SyntaxKind::CharsetDigits);
    }

    #[test]
    fn syntax_errors_carry_offsets() {
        let err = parse_grammar("rules\n S ::= | \n").unwrap_err();
        assert!(err.0 > 0);
        assert!(err.1.contains("syntax error"));
    }
}
