//! Radix tree for resource pattern literals
//!
//! Keys are the literal part of a prefix pattern (`^/node/.*` is stored as
//! `/node/`). Suffix patterns are stored reversed so the same walk serves
//! both: walking `reverse("a/foo")` finds the key stored for `.*foo`.
//!
//! Edges carry string labels. Inserting splits an edge at the first
//! differing char; removing prunes empty leaves and merges a node left with a
//! single child into it.

use std::collections::HashSet;

/// Policy identifier set
pub type IdSet = HashSet<String>;

#[derive(Debug, Default, Clone)]
struct Node {
    /// Edge label from the parent; empty only at the root
    label: String,
    ids: IdSet,
    /// Labels start with distinct chars
    children: Vec<Node>,
}

impl Node {
    fn leaf(label: &str, id: &str) -> Self {
        Self {
            label: label.to_string(),
            ids: IdSet::from([id.to_string()]),
            children: Vec::new(),
        }
    }

    fn child_starting_with(&self, ch: char) -> Option<usize> {
        self.children
            .iter()
            .position(|child| child.label.starts_with(ch))
    }
}

/// Radix tree mapping literal prefixes to policy ID sets
#[derive(Debug, Default, Clone)]
pub struct PrefixTree {
    root: Node,
    keys: usize,
}

impl PrefixTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` under `key`
    pub fn insert(&mut self, key: &str, id: &str) {
        if insert(&mut self.root, key, id) {
            self.keys += 1;
        }
    }

    /// Remove `id` from `key`, dropping the key once its set is empty
    pub fn remove(&mut self, key: &str, id: &str) {
        if remove(&mut self.root, key, id) {
            self.keys -= 1;
        }
    }

    /// Visit the ID set of every stored key that is a prefix of `path`,
    /// shortest first
    pub fn walk_path<'a>(&'a self, path: &str, mut visit: impl FnMut(&'a IdSet)) {
        let mut node = &self.root;
        let mut rest = path;
        loop {
            if !node.ids.is_empty() {
                visit(&node.ids);
            }
            let next = node
                .children
                .iter()
                .find(|child| rest.starts_with(child.label.as_str()));
            match next {
                Some(child) => {
                    rest = &rest[child.label.len()..];
                    node = child;
                }
                None => return,
            }
        }
    }

    /// Visit every ID set in the tree
    pub fn walk<'a>(&'a self, mut visit: impl FnMut(&'a IdSet)) {
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if !node.ids.is_empty() {
                visit(&node.ids);
            }
            stack.extend(node.children.iter());
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.keys
    }

    /// True if no keys are stored
    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }
}

/// Returns true if `key` was not stored before
fn insert(node: &mut Node, key: &str, id: &str) -> bool {
    let Some(first) = key.chars().next() else {
        let created = node.ids.is_empty();
        node.ids.insert(id.to_string());
        return created;
    };

    let Some(index) = node.child_starting_with(first) else {
        node.children.push(Node::leaf(key, id));
        return true;
    };

    let child = &mut node.children[index];
    let common = common_prefix_len(&child.label, key);
    if common < child.label.len() {
        let tail = child.label.split_off(common);
        let moved = Node {
            label: tail,
            ids: std::mem::take(&mut child.ids),
            children: std::mem::take(&mut child.children),
        };
        child.children.push(moved);
    }
    insert(child, &key[common..], id)
}

/// Returns true if `key` lost its last ID
fn remove(node: &mut Node, key: &str, id: &str) -> bool {
    let Some(first) = key.chars().next() else {
        return node.ids.remove(id) && node.ids.is_empty();
    };

    let Some(index) = node.child_starting_with(first) else {
        return false;
    };
    let label_len = node.children[index].label.len();
    if !key.starts_with(node.children[index].label.as_str()) {
        return false;
    }

    let dropped = remove(&mut node.children[index], &key[label_len..], id);

    let child = &mut node.children[index];
    if child.ids.is_empty() {
        match child.children.len() {
            0 => {
                node.children.swap_remove(index);
            }
            1 => {
                if let Some(mut grandchild) = child.children.pop() {
                    grandchild.label.insert_str(0, &child.label);
                    *child = grandchild;
                }
            }
            _ => {}
        }
    }
    dropped
}

/// Byte length of the longest common prefix, on a char boundary
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .take_while(|((_, x), y)| x == y)
        .last()
        .map(|((start, ch), _)| start + ch.len_utf8())
        .unwrap_or(0)
}
