//! The public parser object: a small state machine over grammar
//! generation, source parsing and artifact exchange.
use std::sync::Arc;

use ahash::AHashMap;
use displaydoc::Display;

use crate::ast::{Ast, KindMap};
use crate::codegen::generate_code;
use crate::engine::ParserEngine;
use crate::errors::{ErrorHandler, ErrorMessage, ErrorType, HoshiError};
use crate::extract::extract_grammar;
use crate::lalr::generate_tables;
use crate::parser_data::ParserData;
use crate::source::SourceBuffer;
use crate::syntax::parse_grammar;
use crate::DebugFlags;

/// The lifecycle state of a [`Parser`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
enum ParserState {
    /// No grammar and no kind map yet.
    Invalid,
    /// A kind map is set; no grammar yet.
    KindMapGood,
    /// A grammar generated successfully.
    GrammarGood,
    /// The last generate failed.
    GrammarBad,
    /// The last parse succeeded.
    SourceGood,
    /// The last parse failed.
    SourceBad,
}

/// A parser generator and parser.
///
/// A `Parser` starts empty, acquires a grammar through [`generate`]
/// (or [`decode`]), and can then [`parse`] any number of sources.
/// Cloning is cheap: clones share the immutable generated tables, so a
/// parser can be handed to other threads by cloning it.
///
/// [`generate`]: Parser::generate
/// [`decode`]: Parser::decode
/// [`parse`]: Parser::parse
#[derive(Debug, Clone)]
pub struct Parser {
    state: ParserState,
    kind_map: KindMap,
    data: Option<Arc<ParserData>>,
    errh: ErrorHandler,
    err_src: SourceBuffer,
    ast: Option<Ast>,
}

impl Default for Parser {
    fn default() -> Parser {
        Parser::new()
    }
}

impl Parser {
    /// A parser with no grammar and no kind map.
    pub fn new() -> Parser {
        Parser {
            state: ParserState::Invalid,
            kind_map: KindMap::new(),
            data: None,
            errh: ErrorHandler::new(),
            err_src: SourceBuffer::default(),
            ast: None,
        }
    }

    //
    //  State queries
    //

    /// Whether a generated or decoded grammar is attached.
    pub fn is_grammar_loaded(&self) -> bool {
        matches!(
            self.state,
            ParserState::GrammarGood | ParserState::SourceGood | ParserState::SourceBad
        )
    }

    /// Whether the last generate failed.
    pub fn is_grammar_failed(&self) -> bool {
        self.state == ParserState::GrammarBad
    }

    /// Whether the last parse produced an AST.
    pub fn is_source_loaded(&self) -> bool {
        self.state == ParserState::SourceGood
    }

    /// Whether the last parse failed.
    pub fn is_source_failed(&self) -> bool {
        self.state == ParserState::SourceBad
    }

    //
    //  Result generators
    //

    /// Pre-assign AST kind integers before generating.
    ///
    /// # Errors
    ///
    /// Returns [`HoshiError::KindMap`] when the map is not bijective.
    pub fn set_kind_map(&mut self, kind_map: &AHashMap<String, i32>) -> Result<(), HoshiError> {
        self.kind_map.set(kind_map)?;
        self.state = ParserState::KindMapGood;
        Ok(())
    }

    /// Generate a parser from grammar source text.
    ///
    /// On failure the parser enters the grammar-failed state and the
    /// collected diagnostics stay available through
    /// [`get_error_messages`](Parser::get_error_messages).
    pub fn generate(
        &mut self,
        grammar_source: &str,
        kind_map: Option<&AHashMap<String, i32>>,
        debug_flags: DebugFlags,
    ) -> Result<(), HoshiError> {
        self.ast = None;
        self.data = None;
        self.errh = ErrorHandler::new();
        self.err_src = SourceBuffer::new(grammar_source);
        if debug_flags.has(DebugFlags::PROGRESS) {
            log::debug!(target: "hoshi", "beginning parser generation");
        }

        let mut kinds = KindMap::new();
        if let Some(map) = kind_map {
            kinds.set(map)?;
        } else if self.state == ParserState::KindMapGood {
            kinds = self.kind_map.clone();
        }

        let root = match parse_grammar(grammar_source) {
            Ok(root) => root,
            Err((location, message)) => {
                self.errh.add_error(ErrorType::Syntax, location, &message);
                return self.fail_grammar();
            }
        };
        let mut gram = extract_grammar(&root, &mut self.errh, debug_flags);
        if self.errh.error_count() > 0 {
            return self.fail_grammar();
        }
        let Some(tables) = generate_tables(&mut gram, &mut self.errh, debug_flags) else {
            return self.fail_grammar();
        };
        let code = generate_code(&gram, &mut kinds, &mut self.errh, debug_flags);
        if self.errh.error_count() > 0 {
            return self.fail_grammar();
        }

        let prsd = ParserData::build(&gram, kinds, grammar_source, tables, code);
        self.kind_map = prsd.kind_map.clone();
        self.data = Some(Arc::new(prsd));
        self.state = ParserState::GrammarGood;
        if debug_flags.has(DebugFlags::PROGRESS) {
            log::debug!(target: "hoshi", "finished parser generation");
        }
        Ok(())
    }

    fn fail_grammar(&mut self) -> Result<(), HoshiError> {
        self.state = ParserState::GrammarBad;
        Err(HoshiError::Grammar(format!(
            "{} error(s) in grammar",
            self.errh.error_count()
        )))
    }

    /// Parse source text with the generated parser.
    ///
    /// On failure the diagnostics collected during the parse remain
    /// available; an AST is only retained on success.
    pub fn parse(&mut self, source: &str, debug_flags: DebugFlags) -> Result<(), HoshiError> {
        if !self.is_grammar_loaded() {
            return Err(HoshiError::State(
                "parse called with no grammar loaded".to_string(),
            ));
        }
        self.ast = None;
        self.errh = ErrorHandler::new();
        self.err_src = SourceBuffer::new(source);
        let data = self.data.as_ref().unwrap().clone();
        let src = SourceBuffer::new(source);
        let mut engine = ParserEngine::new(&data, &src, &mut self.errh, debug_flags);
        match engine.parse() {
            Ok(ast) if self.errh.error_count() == 0 => {
                self.ast = Some(ast);
                self.state = ParserState::SourceGood;
                Ok(())
            }
            Ok(_) => {
                // The parse reached accept, but diagnostics were
                // collected along the way.
                self.state = ParserState::SourceBad;
                Err(HoshiError::Source("source errors".to_string()))
            }
            Err(error) => {
                self.state = ParserState::SourceBad;
                Err(error)
            }
        }
    }

    //
    //  Result accessors
    //

    /// The AST of the last successful parse.
    pub fn get_ast(&self) -> Option<&Ast> {
        self.ast.as_ref()
    }

    /// Render an AST with this parser's kind names.
    pub fn dump_ast(&self, ast: &Ast) -> String {
        ast.dump(&self.kind_map)
    }

    /// Diagnostics from the last generate or parse, sorted by source
    /// location.
    pub fn get_error_messages(&self) -> Vec<ErrorMessage> {
        self.errh.error_messages(&self.err_src)
    }

    /// Error-severity diagnostics from the last generate or parse.
    pub fn get_error_count(&self) -> usize {
        self.errh.error_count()
    }

    /// Warning-severity diagnostics from the last generate or parse.
    pub fn get_warning_count(&self) -> usize {
        self.errh.warning_count()
    }

    /// The kind map in force, including auto-assigned kinds.
    pub fn get_kind_map(&self) -> AHashMap<String, i32> {
        self.kind_map.as_map()
    }

    /// The integer for a kind name, or -1 when unmapped.
    pub fn get_kind(&self, kind_str: &str) -> i32 {
        self.kind_map.kind(kind_str)
    }

    /// The integer for a kind name, assigning a fresh one if needed.
    /// Assignments made after generation affect only this parser's
    /// working map, never the shared artifact.
    pub fn get_kind_force(&mut self, kind_str: &str) -> i32 {
        self.kind_map.kind_force(kind_str)
    }

    /// The name for a kind integer.
    pub fn get_kind_string(&self, kind: i32) -> Option<String> {
        self.kind_map.kind_string(kind)
    }

    //
    //  Encode and decode
    //

    /// Encode the generated parser as a portable text artifact.
    pub fn encode(&self) -> Result<String, HoshiError> {
        match &self.data {
            Some(data) => Ok(data.encode()),
            None => Err(HoshiError::State(
                "encode called with no grammar loaded".to_string(),
            )),
        }
    }

    /// Rebuild a parser from an encoded artifact.
    pub fn decode(
        &mut self,
        encoded: &str,
        kind_map: Option<&AHashMap<String, i32>>,
    ) -> Result<(), HoshiError> {
        self.ast = None;
        self.errh = ErrorHandler::new();
        self.err_src = SourceBuffer::default();
        let prsd = ParserData::decode(encoded, kind_map)?;
        self.kind_map = prsd.kind_map.clone();
        self.data = Some(Arc::new(prsd));
        self.state = ParserState::GrammarGood;
        Ok(())
    }

    /// Write the encoded parser as a C++ string-literal definition.
    pub fn export_cpp(&self, file_name: &str, identifier: &str) -> Result<(), HoshiError> {
        match &self.data {
            Some(data) => data.export_cpp(file_name, identifier),
            None => Err(HoshiError::State(
                "export_cpp called with no grammar loaded".to_string(),
            )),
        }
    }
}
