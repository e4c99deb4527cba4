//! KDL parsing helper functions.
//!
//! Common utilities for extracting values from KDL nodes.

use anyhow::Result;

/// Convert a byte offset to line and column numbers (1-indexed)
pub fn offset_to_line_col(content: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in content.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Helper to get a string entry from a KDL node
pub fn get_string_entry(node: &kdl::KdlNode, name: &str) -> Option<String> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Helper to get an integer entry from a KDL node
pub fn get_int_entry(node: &kdl::KdlNode, name: &str) -> Option<i128> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_integer())
}

/// Helper to get a boolean entry from a KDL node
pub fn get_bool_entry(node: &kdl::KdlNode, name: &str) -> Option<bool> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_bool())
}

/// Helper to get every positional string argument of a child node,
/// e.g. `challenge-types "http-01" "dns-01"`
pub fn get_string_list_entry(node: &kdl::KdlNode, name: &str) -> Option<Vec<String>> {
    node.children().and_then(|children| children.get(name)).map(|n| {
        n.entries()
            .iter()
            .filter(|e| e.name().is_none())
            .filter_map(|e| e.value().as_string())
            .map(|s| s.to_string())
            .collect()
    })
}

/// Integer entry that must fit the target type and be non-negative
pub fn get_uint_entry<T: TryFrom<i128>>(node: &kdl::KdlNode, name: &str) -> Result<Option<T>> {
    match get_int_entry(node, name) {
        None => Ok(None),
        Some(v) => T::try_from(v).map(Some).map_err(|_| {
            anyhow::anyhow!(
                "Value {} for '{}' in '{}' block is out of range",
                v,
                name,
                node.name().value()
            )
        }),
    }
}
