use ahash::AHashMap;
use hoshi::{Ast, DebugFlags, ErrorType, HoshiError, Parser};

fn generated(grammar: &str) -> Parser {
    let mut parser = Parser::new();
    parser
        .generate(grammar, None, DebugFlags::NONE)
        .unwrap_or_else(|e| {
            for message in parser.get_error_messages() {
                eprintln!("{}", message.to_display_string());
            }
            panic!("generate failed: {e}");
        });
    parser
}

/// Structural equality, ignoring source locations.
fn same_shape(left: &Ast, right: &Ast) -> bool {
    left.kind() == right.kind()
        && left.lexeme() == right.lexeme()
        && left.num_children() == right.num_children()
        && left
            .children()
            .iter()
            .zip(right.children())
            .all(|(a, b)| same_shape(a, b))
}

#[test]
fn right_recursive_chain() {
    let mut parser = generated("rules\n S ::= 'a' S | 'a'\n");
    parser.parse("aaa", DebugFlags::NONE).unwrap();
    assert_eq!(parser.get_error_count(), 0);
    assert!(parser.get_error_messages().is_empty());

    // A chain of S nodes three tokens deep.
    let s = parser.get_kind("S");
    let a = parser.get_kind("'a'");
    let root = parser.get_ast().unwrap();
    assert_eq!(root.kind(), s);
    assert_eq!(root.num_children(), 2);
    assert_eq!(root.child(0).kind(), a);
    let middle = root.child(1);
    assert_eq!(middle.kind(), s);
    assert_eq!(middle.child(1).kind(), a);
    assert_eq!(middle.child(1).num_children(), 0);
}

#[test]
fn whitespace_is_skipped_by_default() {
    let mut parser = generated("rules\n S ::= 'a' S | 'a'\n");
    parser.parse("aaa", DebugFlags::NONE).unwrap();
    let packed = parser.get_ast().unwrap().clone();
    parser.parse("a a a", DebugFlags::NONE).unwrap();
    let spaced = parser.get_ast().unwrap();
    assert!(same_shape(&packed, spaced));
    assert_eq!(parser.get_error_count(), 0);
}

#[test]
fn ambiguous_expression_grammar_is_rejected() {
    let mut parser = Parser::new();
    let result = parser.generate(
        "rules\n E ::= E '+' E | E '*' E | <integer>\n",
        None,
        DebugFlags::NONE,
    );
    assert!(matches!(result, Err(HoshiError::Grammar(_))));
    assert!(parser.is_grammar_failed());
    assert!(parser
        .get_error_messages()
        .iter()
        .any(|m| m.error_type() == ErrorType::LalrConflict));
    // With no parser there is nothing to parse with.
    assert!(parser.parse("1+2", DebugFlags::NONE).is_err());
}

#[test]
fn precedence_tiers_shape_the_tree() {
    let mut parser = generated(
        r#"
        tokens
            <integer> : regex = "[0-9]+"
        rules
            E ::= precedence <integer>
                  << { '+' : (Add $1 $3) }
                  << { '*' : (Mul $1 $3) }
        "#,
    );
    parser.parse("1+2*3", DebugFlags::NONE).unwrap();
    let root = parser.get_ast().unwrap();
    assert_eq!(root.kind(), parser.get_kind("Add"));
    assert_eq!(root.child(0).lexeme(), "1");
    let product = root.child(1);
    assert_eq!(product.kind(), parser.get_kind("Mul"));
    assert_eq!(product.child(0).lexeme(), "2");
    assert_eq!(product.child(1).lexeme(), "3");
}

#[test]
fn zero_closure_collects_in_order() {
    let mut parser = generated(
        "tokens\n <integer> : regex = \"[0-9]+\"\nrules\n L ::= <integer>*\n",
    );
    parser.parse("1 2 3", DebugFlags::NONE).unwrap();
    let root = parser.get_ast().unwrap();
    assert_eq!(root.num_children(), 3);
    let lexemes: Vec<&str> = root.children().iter().map(|c| c.lexeme()).collect();
    assert_eq!(lexemes, vec!["1", "2", "3"]);

    parser.parse("", DebugFlags::NONE).unwrap();
    assert_eq!(parser.get_ast().unwrap().num_children(), 0);
}

#[test]
fn syntax_error_reports_expected_terminals() {
    let mut parser = generated(
        "tokens\n <stray> : regex = \"x\"\nrules\n S ::= 'a' 'b' 'c'\n",
    );
    let result = parser.parse("a x c", DebugFlags::NONE);
    assert!(matches!(result, Err(HoshiError::Source(_))));
    assert!(parser.is_source_failed());

    let messages = parser.get_error_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].error_type(), ErrorType::Syntax);
    assert_eq!(messages[0].location(), 2);
    assert!(messages[0].short_message().contains("'b'"));
}

#[test]
fn recovery_surfaces_multiple_errors() {
    let mut parser = generated(
        "tokens\n <integer> : regex = \"[0-9]+\"\nrules\n L ::= { '(' <integer> ')' }*\n",
    );
    let result = parser.parse("(1) (x (2) (y (3)", DebugFlags::NONE);
    assert!(result.is_err());
    assert!(parser.get_error_count() >= 2);
}

#[test]
fn disabled_recovery_stops_at_the_first_error() {
    let mut parser = generated(
        "options\n error_recovery = false\nrules\n S ::= 'a' 'b' 'c'\n",
    );
    let result = parser.parse("a c", DebugFlags::NONE);
    assert!(matches!(result, Err(HoshiError::Source(_))));
    assert_eq!(parser.get_error_messages().len(), 1);
    assert_eq!(parser.get_error_messages()[0].error_type(), ErrorType::Syntax);
}

#[test]
fn encode_decode_round_trip() {
    let grammar = r#"
        tokens
            <integer> : regex = "[0-9]+"
        rules
            E ::= precedence <integer>
                  << { '+' : (Add $1 $3) }
                  << { '*' : (Mul $1 $3) }
    "#;
    let mut original = generated(grammar);
    let encoded = original.encode().unwrap();

    let mut decoded = Parser::new();
    decoded.decode(&encoded, None).unwrap();
    assert!(decoded.is_grammar_loaded());
    // The artifact survives a second round untouched.
    assert_eq!(decoded.encode().unwrap(), encoded);

    original.parse("7+8*9", DebugFlags::NONE).unwrap();
    decoded.parse("7+8*9", DebugFlags::NONE).unwrap();
    assert_eq!(original.get_ast().unwrap(), decoded.get_ast().unwrap());
    assert_eq!(
        original.get_error_messages(),
        decoded.get_error_messages()
    );
}

#[test]
fn kind_maps_are_bijective_and_sticky() {
    let mut kinds = AHashMap::new();
    kinds.insert("Add".to_string(), 40);
    kinds.insert("Mul".to_string(), 41);
    let grammar = r#"
        tokens
            <integer> : regex = "[0-9]+"
        rules
            E ::= precedence <integer>
                  << { '+' : (Add $1 $3) }
                  << { '*' : (Mul $1 $3) }
    "#;
    let mut parser = Parser::new();
    parser.generate(grammar, Some(&kinds), DebugFlags::NONE).unwrap();
    assert_eq!(parser.get_kind("Add"), 40);
    parser.parse("1*2", DebugFlags::NONE).unwrap();
    assert_eq!(parser.get_ast().unwrap().kind(), 41);

    // Decoding with an explicit map that lacks an encoded kind fails.
    let encoded = parser.encode().unwrap();
    let mut incomplete = AHashMap::new();
    incomplete.insert("Add".to_string(), 1);
    let mut other = Parser::new();
    assert!(matches!(
        other.decode(&encoded, Some(&incomplete)),
        Err(HoshiError::KindMap(_))
    ));

    let mut duplicated = AHashMap::new();
    duplicated.insert("Add".to_string(), 1);
    duplicated.insert("Mul".to_string(), 1);
    assert!(parser.set_kind_map(&duplicated).is_err());
}

#[test]
fn formers_can_reach_back_into_consumed_slots() {
    // The `&$1` lexeme item runs after `$1` has already been moved into
    // the formed node, so the engine has to chase the moved subtree.
    let mut parser = generated(
        "tokens\n <word> : template = identifier\nrules\n S ::= <word> <word> : (Pair &$1 $1 $2)\n",
    );
    parser.parse("hello world", DebugFlags::NONE).unwrap();
    let root = parser.get_ast().unwrap();
    assert_eq!(root.kind(), parser.get_kind("Pair"));
    assert_eq!(root.lexeme(), "hello");
    assert_eq!(root.num_children(), 2);
    assert_eq!(root.child(0).lexeme(), "hello");
    assert_eq!(root.child(1).lexeme(), "world");
}

#[test]
fn guard_actions_and_optional_items_generate() {
    let mut parser = generated(
        r#"
        tokens
            <integer> : regex = "[0-9]+"
        rules
            S ::= 'print'? <integer>+ => { statements := statements + 1; }
        "#,
    );
    parser.parse("print 1 2 3", DebugFlags::NONE).unwrap();
    parser.parse("4", DebugFlags::NONE).unwrap();
    assert!(parser.is_source_loaded());
}

#[test]
fn lexical_errors_synthesize_error_tokens() {
    let mut parser = generated("rules\n S ::= 'a'\n");
    let result = parser.parse("@ a", DebugFlags::NONE);
    assert!(result.is_err());
    assert!(parser
        .get_error_messages()
        .iter()
        .any(|m| m.error_type() == ErrorType::Lexical));
}

#[test]
fn unused_tokens_warn_but_generate() {
    let mut parser = Parser::new();
    parser
        .generate(
            "tokens\n <lonely> : regex = \"z\"\nrules\n S ::= 'a'\n",
            None,
            DebugFlags::NONE,
        )
        .unwrap();
    assert_eq!(parser.get_error_count(), 0);
    assert!(parser.get_warning_count() >= 1);
    assert!(parser
        .get_error_messages()
        .iter()
        .any(|m| m.error_type() == ErrorType::UnusedTerm));
}

#[test]
fn lookahead_extension_parses_lalr2_grammars() {
    let grammar = "options\n lookaheads = 2\nrules\n S ::= A 'x' 'p' | B 'x' 'q'\n A ::= 'a'\n B ::= 'a'\n";
    let mut parser = generated(grammar);
    parser.parse("a x p", DebugFlags::NONE).unwrap();
    let root = parser.get_ast().unwrap();
    assert_eq!(root.kind(), parser.get_kind("S"));
    parser.parse("a x q", DebugFlags::NONE).unwrap();
    parser.parse("axq", DebugFlags::NONE).unwrap();
}

#[test]
fn diagnostics_serialize_as_json() {
    let mut parser = generated("rules\n S ::= 'a' 'b'\n");
    let _ = parser.parse("a a", DebugFlags::NONE);
    let messages = parser.get_error_messages();
    assert!(!messages.is_empty());
    let json = serde_json::to_string(&messages).unwrap();
    assert!(json.contains("Syntax"));
    let back: Vec<hoshi::ErrorMessage> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, messages);
}

#[test]
fn export_cpp_writes_a_wrapped_literal() {
    let parser = generated("rules\n S ::= 'a'\n");
    let path = std::env::temp_dir().join("hoshi_export_test.cpp");
    let path = path.to_str().unwrap();
    parser.export_cpp(path, "my_parser").unwrap();
    let exported = std::fs::read_to_string(path).unwrap();
    std::fs::remove_file(path).ok();
    assert!(exported.starts_with("static const char* my_parser ="));
    assert!(exported.trim_end().ends_with("};"));
}

#[test]
fn cloned_parsers_share_tables() {
    let mut parser = generated("rules\n S ::= 'a' S | 'a'\n");
    let mut clone = parser.clone();
    parser.parse("aa", DebugFlags::NONE).unwrap();
    clone.parse("aaa", DebugFlags::NONE).unwrap();
    assert_eq!(parser.get_ast().unwrap().num_children(), 2);
    assert!(clone.is_source_loaded());
}

#[test]
fn state_queries_follow_the_lifecycle() {
    let mut parser = Parser::new();
    assert!(!parser.is_grammar_loaded());
    assert!(parser.encode().is_err());
    assert!(parser.parse("a", DebugFlags::NONE).is_err());

    parser
        .generate("rules\n S ::= 'a'\n", None, DebugFlags::NONE)
        .unwrap();
    assert!(parser.is_grammar_loaded());
    assert!(!parser.is_source_loaded());

    parser.parse("a", DebugFlags::NONE).unwrap();
    assert!(parser.is_source_loaded());
    assert!(parser.is_grammar_loaded());

    let _ = parser.parse("b b", DebugFlags::NONE);
    assert!(parser.is_source_failed());
    assert!(parser.get_ast().is_none());
}
