//! The abstract syntax tree produced by parses and the kind map that
//! names its node kinds.
use std::fmt::Write as _;

use ahash::AHashMap;

use crate::errors::HoshiError;
use crate::source::to_ascii_chop;

/// A node of an abstract syntax tree.
///
/// A parent owns its children outright: dropping a node drops the whole
/// subtree and copying requires a deep clone. The engine replaces a
/// child it has moved out with a null sentinel node (kind -1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ast {
    kind: i32,
    location: i64,
    lexeme: String,
    children: Vec<Ast>,
}

impl Default for Ast {
    fn default() -> Ast {
        Ast {
            kind: -1,
            location: -1,
            lexeme: String::new(),
            children: Vec::new(),
        }
    }
}

impl Ast {
    /// Build a node directly, taking ownership of its children.
    pub fn new(kind: i32, location: i64, lexeme: String, children: Vec<Ast>) -> Ast {
        Ast {
            kind,
            location,
            lexeme,
            children,
        }
    }

    /// The sentinel left behind when the engine moves a child out.
    pub(crate) fn null_sentinel() -> Ast {
        Ast::default()
    }

    /// The node's kind integer; the kind map names it.
    pub fn kind(&self) -> i32 {
        self.kind
    }

    /// Replace the node's kind.
    pub fn set_kind(&mut self, kind: i32) {
        self.kind = kind;
    }

    /// Code-point offset of the node in its source, or -1.
    pub fn location(&self) -> i64 {
        self.location
    }

    /// Replace the node's source location.
    pub fn set_location(&mut self, location: i64) {
        self.location = location;
    }

    /// The lexeme captured for the node, possibly empty.
    pub fn lexeme(&self) -> &str {
        &self.lexeme
    }

    /// Replace the node's lexeme.
    pub fn set_lexeme(&mut self, lexeme: String) {
        self.lexeme = lexeme;
    }

    /// The number of children.
    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// All children, in order.
    pub fn children(&self) -> &[Ast] {
        &self.children
    }

    /// One child by index.
    ///
    /// # Panics
    ///
    /// Panics when the index is out of range.
    pub fn child(&self, index: usize) -> &Ast {
        &self.children[index]
    }

    pub(crate) fn child_mut(&mut self, index: usize) -> &mut Ast {
        &mut self.children[index]
    }

    /// Render the subtree as an indented listing for debugging.
    pub fn dump(&self, kind_map: &KindMap) -> String {
        let mut out = String::new();
        self.dump_into(kind_map, 0, &mut out);
        out
    }

    fn dump_into(&self, kind_map: &KindMap, indent: usize, out: &mut String) {
        let kind_name = kind_map
            .kind_string(self.kind)
            .unwrap_or_else(|| "?".to_string());
        let _ = write!(out, "{:indent$}{}", "", kind_name, indent = indent);
        if !self.lexeme.is_empty() {
            let _ = write!(out, " \"{}\"", to_ascii_chop(&self.lexeme));
        }
        if self.location >= 0 {
            let _ = write!(out, " @ {}", self.location);
        }
        out.push('\n');
        for child in &self.children {
            child.dump_into(kind_map, indent + 4, out);
        }
    }
}

/// A bijective mapping from AST kind names to integers.
///
/// Kind names are the free-form identifiers used in AST-former
/// expressions. Clients may pre-assign integers; any name used by a
/// grammar but absent from the map is auto-assigned the next free
/// integer during generation.
#[derive(Debug, Clone, Default)]
pub struct KindMap {
    kind_by_name: AHashMap<String, i32>,
    name_by_kind: AHashMap<i32, String>,
}

impl KindMap {
    /// An empty mapping.
    pub fn new() -> KindMap {
        KindMap::default()
    }

    /// Replace the whole mapping.
    ///
    /// # Errors
    ///
    /// Returns [`HoshiError::KindMap`] when two names share an integer.
    pub fn set(&mut self, kind_map: &AHashMap<String, i32>) -> Result<(), HoshiError> {
        let mut name_by_kind = AHashMap::with_capacity(kind_map.len());
        for (name, &kind) in kind_map {
            if let Some(other) = name_by_kind.insert(kind, name.clone()) {
                return Err(HoshiError::KindMap(format!(
                    "kinds {other} and {name} are both mapped to {kind}"
                )));
            }
        }
        self.kind_by_name = kind_map.clone();
        self.name_by_kind = name_by_kind;
        Ok(())
    }

    /// The integer for a kind name, or -1 when unmapped.
    pub fn kind(&self, kind_str: &str) -> i32 {
        self.kind_by_name.get(kind_str).copied().unwrap_or(-1)
    }

    /// The integer for a kind name, assigning a fresh one if needed.
    pub fn kind_force(&mut self, kind_str: &str) -> i32 {
        if let Some(&kind) = self.kind_by_name.get(kind_str) {
            return kind;
        }
        let mut kind = self.kind_by_name.len() as i32;
        while self.name_by_kind.contains_key(&kind) {
            kind += 1;
        }
        self.kind_by_name.insert(kind_str.to_string(), kind);
        self.name_by_kind.insert(kind, kind_str.to_string());
        kind
    }

    /// The name for a kind integer.
    pub fn kind_string(&self, kind: i32) -> Option<String> {
        self.name_by_kind.get(&kind).cloned()
    }

    /// A copy of the mapping as a plain map.
    pub fn as_map(&self) -> AHashMap<String, i32> {
        self.kind_by_name.clone()
    }

    /// Name/integer pairs sorted by integer, for serialization.
    pub(crate) fn sorted_pairs(&self) -> Vec<(String, i32)> {
        let mut pairs: Vec<(String, i32)> = self
            .kind_by_name
            .iter()
            .map(|(name, &kind)| (name.clone(), kind))
            .collect();
        pairs.sort_by_key(|&(_, kind)| kind);
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_map_is_bijective() {
        let mut kind_map = KindMap::new();
        let mut seed = AHashMap::new();
        seed.insert("Add".to_string(), 7);
        seed.insert("Sub".to_string(), 8);
        kind_map.set(&seed).unwrap();
        assert_eq!(kind_map.kind("Add"), 7);
        assert_eq!(kind_map.kind("Missing"), -1);
        let forced = kind_map.kind_force("Missing");
        assert!(forced != 7 && forced != 8);
        assert_eq!(kind_map.kind_string(forced).as_deref(), Some("Missing"));

        let mut bad = AHashMap::new();
        bad.insert("A".to_string(), 1);
        bad.insert("B".to_string(), 1);
        assert!(kind_map.set(&bad).is_err());
    }

    #[test]
    fn dump_includes_lexemes() {
        let mut kind_map = KindMap::new();
        let add = kind_map.kind_force("Add");
        let num = kind_map.kind_force("Number");
        let tree = Ast::new(
            add,
            0,
            String::new(),
            vec![
                Ast::new(num, 0, "1".to_string(), vec![]),
                Ast::new(num, 2, "2".to_string(), vec![]),
            ],
        );
        let listing = tree.dump(&kind_map);
        assert!(listing.contains("Add"));
        assert!(listing.contains("\"1\""));
    }
}
