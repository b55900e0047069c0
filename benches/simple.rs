use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hoshi::{DebugFlags, Parser};

const EXPRESSION_GRAMMAR: &str = r#"
tokens
    <integer> : regex = "[0-9]+"
rules
    E ::= precedence Primary
          << { '+' : (Add $1 $3)  '-' : (Sub $1 $3) }
          << { '*' : (Mul $1 $3)  '/' : (Div $1 $3) }
    Primary ::= <integer> | { '(' E ')' : (Group $2) }
"#;

fn generate(c: &mut Criterion) {
    c.bench_function("generate_expression_grammar", |b| {
        b.iter(|| {
            let mut parser = Parser::new();
            parser
                .generate(black_box(EXPRESSION_GRAMMAR), None, DebugFlags::NONE)
                .unwrap();
            parser
        })
    });
}

fn parse(c: &mut Criterion) {
    let mut parser = Parser::new();
    parser
        .generate(EXPRESSION_GRAMMAR, None, DebugFlags::NONE)
        .unwrap();
    let mut source = String::from("1");
    for n in 0..2000 {
        source.push_str(if n % 2 == 0 { " + " } else { " * " });
        source.push_str("(2 + 3)");
    }
    c.bench_function("parse_long_expression", |b| {
        b.iter(|| {
            let mut worker = parser.clone();
            worker.parse(black_box(&source), DebugFlags::NONE).unwrap();
            worker
        })
    });
}

criterion_group!(benches, generate, parse);
criterion_main!(benches);
