//
// parser_pool.rs
//
// Thread-local parser pool for efficient parser reuse
//

use std::cell::RefCell;
use tree_sitter::{Parser, Tree};

thread_local! {
    static PARSER: RefCell<Option<Parser>> = RefCell::new(new_go_parser());
}

fn new_go_parser() -> Option<Parser> {
    let mut parser = Parser::new();
    match parser.set_language(&tree_sitter_go::LANGUAGE.into()) {
        Ok(()) => Some(parser),
        Err(err) => {
            log::error!("Failed to load the Go grammar: {}", err);
            None
        }
    }
}

/// Execute a function with a thread-local parser instance.
/// The parser is reused across calls on the same thread. Returns `None`
/// if the grammar could not be loaded.
pub fn with_parser<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Parser) -> R,
{
    PARSER.with(|parser| parser.borrow_mut().as_mut().map(f))
}

/// Parse Go source with the pooled parser.
pub fn parse_go(source: &str) -> Option<Tree> {
    with_parser(|parser| parser.parse(source, None)).flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_initialized_with_go_language() {
        let tree = parse_go("package a\n").expect("parse should succeed");
        assert_eq!(tree.root_node().kind(), "source_file");
        assert!(!tree.root_node().has_error());
    }

    #[test]
    fn test_parser_reuse_on_same_thread() {
        let first = parse_go("package a\nvar x = 1\n");
        let second = parse_go("package b\nfunc f() {}\n");
        assert!(first.is_some() && second.is_some());
        let second = second.unwrap();
        let decl = second.root_node().named_child(1).map(|n| n.kind());
        assert_eq!(decl, Some("function_declaration"));
    }

    #[test]
    fn test_parser_reports_errors() {
        let tree = parse_go("package a\nfunc {\n").unwrap();
        assert!(tree.root_node().has_error());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn go_snippet() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9_]{0,5}".prop_map(|name| format!("var {} = 1", name)),
            "[a-z][a-z0-9_]{0,5}".prop_map(|name| format!("func {}(x int) int {{ return x }}", name)),
            "[A-Z][a-z0-9_]{0,5}".prop_map(|name| format!("type {} struct{{ n int }}", name)),
            Just("const c = iota".to_string()),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any sequence of snippets parses on the same pooled parser.
        #[test]
        fn prop_parser_instance_reuse(
            snippets in prop::collection::vec(go_snippet(), 1..10)
        ) {
            for snippet in &snippets {
                let source = format!("package p\n{}\n", snippet);
                let tree = parse_go(&source);
                prop_assert!(tree.is_some(), "Parser should parse: {}", source);
                prop_assert!(!tree.unwrap().root_node().has_error(), "unexpected error in {}", source);
            }
        }
    }
}
