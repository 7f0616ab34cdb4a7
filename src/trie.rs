//! Ordered hierarchical map from path components to entries.
//!
//! Nodes live in a flat arena (`Vec<Node>`) rather than as a graph of
//! `Rc`/`RefCell` nodes: parent/child/sibling links are arena indices, which
//! sidesteps the cyclic-ownership problem a pointer-based tree would have
//! (see the design notes on cyclic ownership) while staying entirely safe.
//! The trie itself is not internally synchronised; [`crate::cache::Cache`]
//! wraps it in a mutex.

use crate::entry::Entry;

#[derive(Debug)]
struct Node {
    component: String,
    payload: Option<Entry>,
    parent: Option<usize>,
    first_child: Option<usize>,
    next_sibling: Option<usize>,
}

impl Node {
    fn leaf(component: String, parent: Option<usize>) -> Self {
        Node {
            component,
            payload: None,
            parent,
            first_child: None,
            next_sibling: None,
        }
    }
}

pub struct Trie {
    separator: String,
    nodes: Vec<Node>,
}

const ROOT: usize = 0;

impl Trie {
    /// `new(separator, len)` in the spec; `len` is implied by `separator`
    /// being an owned `String` rather than a raw byte-pointer-plus-length pair.
    pub fn new(separator: impl Into<String>) -> Self {
        let root = Node::leaf(String::new(), None);
        Trie {
            separator: separator.into(),
            nodes: vec![root],
        }
    }

    fn split_key(&self, key: &str) -> Vec<String> {
        split_key(key, &self.separator)
    }

    /// Finds or creates the node chain for `key`, returning its terminal
    /// index. Returns `None` if `key` splits to no components (the
    /// solely-separators no-op case).
    fn find_or_create(&mut self, key: &str) -> Option<usize> {
        let components = self.split_key(key);
        if components.is_empty() {
            return None;
        }
        let mut current = ROOT;
        for component in components {
            current = self.find_or_create_child(current, &component);
        }
        Some(current)
    }

    fn find_or_create_child(&mut self, parent: usize, component: &str) -> usize {
        if let Some(existing) = self.find_child(parent, component) {
            return existing;
        }
        let new_index = self.nodes.len();
        self.nodes
            .push(Node::leaf(component.to_string(), Some(parent)));
        match self.last_child(parent) {
            Some(last) => self.nodes[last].next_sibling = Some(new_index),
            None => self.nodes[parent].first_child = Some(new_index),
        }
        new_index
    }

    fn find_child(&self, parent: usize, component: &str) -> Option<usize> {
        let mut cursor = self.nodes[parent].first_child;
        while let Some(idx) = cursor {
            if self.nodes[idx].component == component {
                return Some(idx);
            }
            cursor = self.nodes[idx].next_sibling;
        }
        None
    }

    fn last_child(&self, parent: usize) -> Option<usize> {
        let mut cursor = self.nodes[parent].first_child?;
        while let Some(next) = self.nodes[cursor].next_sibling {
            cursor = next;
        }
        Some(cursor)
    }

    /// Navigates to the terminal node for `key` without creating anything.
    fn find_node(&self, key: &str) -> Option<usize> {
        let components = self.split_key(key);
        if components.is_empty() {
            return None;
        }
        let mut current = ROOT;
        for component in components {
            current = self.find_child(current, &component)?;
        }
        Some(current)
    }

    /// `add(key, payload)`, replaces any existing payload on the terminal node.
    pub fn add(&mut self, key: &str, payload: Entry) {
        if let Some(idx) = self.find_or_create(key) {
            self.nodes[idx].payload = Some(payload);
        }
    }

    /// `find(key)`.
    pub fn find(&self, key: &str) -> Option<&Entry> {
        self.find_node(key).and_then(|idx| self.nodes[idx].payload.as_ref())
    }

    /// Clears only the terminal node's own payload, keeping the node and any
    /// children in place. This is the non-cascading half of `cache.delete`;
    /// see [`Trie::delete_subtree`] for the cascading half the engine facade
    /// needs for `delete`/`clear`.
    pub fn clear_payload(&mut self, key: &str) -> Option<Entry> {
        let idx = self.find_node(key)?;
        self.nodes[idx].payload.take()
    }

    /// `delete(key, dtor)`, unlinks the terminal subtree entirely and
    /// returns every payload that subtree carried, in post-order. Parent and
    /// sibling links are repaired so the arena stays consistent (orphaned
    /// nodes are simply left unreachable from the root; the arena is never
    /// compacted, matching the spec's silence on memory reclamation
    /// strategy).
    pub fn delete_subtree(&mut self, key: &str) -> Vec<Entry> {
        let Some(idx) = self.find_node(key) else {
            return Vec::new();
        };
        self.unlink(idx);
        let mut out = Vec::new();
        self.collect_post_order(idx, &mut out);
        out
    }

    fn unlink(&mut self, idx: usize) {
        let Some(parent) = self.nodes[idx].parent else {
            return;
        };
        let mut cursor = self.nodes[parent].first_child;
        if cursor == Some(idx) {
            self.nodes[parent].first_child = self.nodes[idx].next_sibling;
            return;
        }
        while let Some(cur) = cursor {
            if self.nodes[cur].next_sibling == Some(idx) {
                self.nodes[cur].next_sibling = self.nodes[idx].next_sibling;
                return;
            }
            cursor = self.nodes[cur].next_sibling;
        }
    }

    fn collect_post_order(&self, idx: usize, out: &mut Vec<Entry>) {
        let mut child = self.nodes[idx].first_child;
        while let Some(c) = child {
            self.collect_post_order(c, out);
            child = self.nodes[c].next_sibling;
        }
        if let Some(entry) = &self.nodes[idx].payload {
            out.push(entry.clone());
        }
    }

    /// `foreach`, post-order traversal of all payload-bearing nodes.
    pub fn foreach(&self, mut visitor: impl FnMut(&Entry)) {
        self.foreach_from(ROOT, &mut visitor);
    }

    fn foreach_from(&self, idx: usize, visitor: &mut impl FnMut(&Entry)) {
        let mut child = self.nodes[idx].first_child;
        while let Some(c) = child {
            self.foreach_from(c, visitor);
            child = self.nodes[c].next_sibling;
        }
        if let Some(entry) = &self.nodes[idx].payload {
            visitor(entry);
        }
    }

    /// Visits the entry at `key` (if any) and every descendant that carries
    /// a payload, in post-order. Grounds `Cache::foreach_child`.
    pub fn foreach_subtree(&self, key: &str, mut visitor: impl FnMut(&Entry)) {
        if let Some(idx) = self.find_node(key) {
            self.foreach_from(idx, &mut visitor);
        }
    }

    /// The direct payload-bearing children of the node at `key`, in trie
    /// order. If a child node is itself a bare prefix (no directory was ever
    /// `add`-ed at exactly that path), its shallowest payload-bearing
    /// descendants stand in for it. Mirrors `foreach_top`'s treatment of the
    /// root. Grounds the worker's "every cached direct child" rescan step.
    pub fn direct_children(&self, key: &str) -> Vec<Entry> {
        let Some(idx) = self.find_node(key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut child = self.nodes[idx].first_child;
        while let Some(c) = child {
            self.shallowest_payloads(c, &mut |e| out.push(e.clone()));
            child = self.nodes[c].next_sibling;
        }
        out
    }

    /// Grounds `Cache::foreach_top`: for each root child, either its own
    /// payload or the payloads of its shallowest payload-bearing descendants.
    pub fn foreach_top(&self, mut visitor: impl FnMut(&Entry)) {
        let mut child = self.nodes[ROOT].first_child;
        while let Some(c) = child {
            self.shallowest_payloads(c, &mut visitor);
            child = self.nodes[c].next_sibling;
        }
    }

    fn shallowest_payloads(&self, idx: usize, visitor: &mut impl FnMut(&Entry)) {
        if let Some(entry) = &self.nodes[idx].payload {
            visitor(entry);
            return;
        }
        let mut child = self.nodes[idx].first_child;
        while let Some(c) = child {
            self.shallowest_payloads(c, visitor);
            child = self.nodes[c].next_sibling;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].first_child.is_none()
    }

    /// Drops every node but the root.
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        self.nodes[ROOT].first_child = None;
    }
}

/// Key-splitting policy (§4.1): a run of consecutive separators collapses to
/// a single skipped empty component; a leading separator is preserved as one
/// component equal to the separator itself; a key made solely of separators
/// (and longer than one separator) splits to no components at all, which
/// callers treat as a no-op.
fn split_key(key: &str, sep: &str) -> Vec<String> {
    if key.is_empty() {
        return Vec::new();
    }
    if key == sep {
        return vec![sep.to_string()];
    }
    if key.replace(sep, "").is_empty() {
        return Vec::new();
    }

    let mut components = Vec::new();
    let mut rest = key;
    if let Some(stripped) = rest.strip_prefix(sep) {
        components.push(sep.to_string());
        rest = stripped;
    }
    for part in rest.split(sep) {
        if !part.is_empty() {
            components.push(part.to_string());
        }
    }
    components
}
