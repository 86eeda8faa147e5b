//! Rooted phylogenetic tree with branch lengths.
//!
//! Nodes are indexed `0..n_nodes` with tips first, then internal nodes.
//! Trees built from Newick number internal nodes in postorder, so the root
//! is always the last index.
//!
//! A tree also carries the subscription state that likelihood processes rely
//! on: a set of listener ids and a queue of change events fired by edits
//! (`set_branch_length`, `nni`). Cloning a tree produces a new object with no
//! listeners and no pending events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TraitError};

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// Identity of an object listening for tree change events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate a fresh, process-unique listener id.
    pub fn next() -> Self {
        ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

/// What changed on a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeChangeKind {
    /// The node's branch length changed.
    BranchLength,
    /// The node's children changed.
    Topology,
}

/// A change event queued on the tree until a listener drains it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeChangeEvent {
    pub node: usize,
    pub kind: TreeChangeKind,
}

#[derive(Debug)]
pub struct Tree {
    n_nodes: usize,
    n_tips: usize,
    parents: Vec<Option<usize>>,
    branch_lengths: Vec<f64>,
    children: Vec<Vec<usize>>,
    names: Vec<Option<String>>,
    root_index: usize,
    tip_name_to_idx: HashMap<String, usize>,
    listeners: Vec<ListenerId>,
    events: Vec<TreeChangeEvent>,
}

impl Clone for Tree {
    fn clone(&self) -> Self {
        Tree {
            n_nodes: self.n_nodes,
            n_tips: self.n_tips,
            parents: self.parents.clone(),
            branch_lengths: self.branch_lengths.clone(),
            children: self.children.clone(),
            names: self.names.clone(),
            root_index: self.root_index,
            tip_name_to_idx: self.tip_name_to_idx.clone(),
            listeners: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl Tree {
    /// Build a tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Branch length for each node
    /// * `n_tips` - Number of tip nodes; nodes `0..n_tips` must be childless
    pub fn from_structure(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        n_tips: usize,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();

        if branch_lengths.len() != n_nodes {
            return Err(TraitError::invalid_input(
                "parent_indices and branch_lengths must have same length",
            ));
        }
        if n_tips == 0 || n_tips > n_nodes {
            return Err(TraitError::invalid_input(format!(
                "{} tips requested for a tree of {} nodes",
                n_tips, n_nodes
            )));
        }

        let mut parents = Vec::with_capacity(n_nodes);
        let mut children = vec![Vec::new(); n_nodes];
        let mut root_index = None;
        for (child_idx, &parent_idx) in parent_indices.iter().enumerate() {
            if parent_idx < 0 {
                if root_index.is_some() {
                    return Err(TraitError::invalid_input("more than one root node"));
                }
                root_index = Some(child_idx);
                parents.push(None);
            } else {
                let p = parent_idx as usize;
                if p >= n_nodes || p == child_idx {
                    return Err(TraitError::invalid_input(format!(
                        "node {} has invalid parent {}",
                        child_idx, parent_idx
                    )));
                }
                children[p].push(child_idx);
                parents.push(Some(p));
            }
        }

        let root_index = root_index
            .ok_or_else(|| TraitError::invalid_input("no root node found (no parent_idx == -1)"))?;

        for (node, kids) in children.iter().enumerate() {
            let is_tip_slot = node < n_tips;
            if is_tip_slot != kids.is_empty() {
                return Err(TraitError::invalid_input(format!(
                    "node {} violates the tips-first ordering",
                    node
                )));
            }
        }

        let tree = Tree {
            n_nodes,
            n_tips,
            parents,
            branch_lengths,
            children,
            names: vec![None; n_nodes],
            root_index,
            tip_name_to_idx: HashMap::new(),
            listeners: Vec::new(),
            events: Vec::new(),
        };

        if tree.post_order().len() != n_nodes {
            return Err(TraitError::invalid_input("tree is not connected"));
        }
        Ok(tree)
    }

    /// Attach names to the tips, in tip-index order.
    pub fn with_tip_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n_tips {
            return Err(TraitError::invalid_input(format!(
                "{} names given for {} tips",
                names.len(),
                self.n_tips
            )));
        }
        self.tip_name_to_idx.clear();
        for (i, name) in names.into_iter().enumerate() {
            if self.tip_name_to_idx.insert(name.clone(), i).is_some() {
                return Err(TraitError::invalid_input(format!("duplicate tip name '{}'", name)));
            }
            self.names[i] = Some(name);
        }
        Ok(self)
    }

    /// Parse a Newick string.
    ///
    /// Tips are numbered left to right, internal nodes in postorder.
    /// Missing branch lengths default to 0. Every tip must be named.
    pub fn from_newick(newick: &str) -> Result<Self> {
        let raw = NewickParser::new(newick.as_bytes()).parse()?;

        // Renumber: tips first in input order, then internal nodes in postorder.
        let mut order = Vec::with_capacity(raw.len());
        fn visit(raw: &[RawNode], id: usize, order: &mut Vec<usize>) {
            for &c in &raw[id].children {
                visit(raw, c, order);
            }
            order.push(id);
        }
        visit(&raw, 0, &mut order);

        let tips: Vec<usize> = order.iter().copied().filter(|&i| raw[i].children.is_empty()).collect();
        let internals: Vec<usize> = order.iter().copied().filter(|&i| !raw[i].children.is_empty()).collect();
        let mut new_index = vec![0usize; raw.len()];
        for (k, &old) in tips.iter().chain(internals.iter()).enumerate() {
            new_index[old] = k;
        }

        let n_nodes = raw.len();
        let mut parent_indices = vec![-1i32; n_nodes];
        let mut branch_lengths = vec![0.0; n_nodes];
        for (old, node) in raw.iter().enumerate() {
            let idx = new_index[old];
            branch_lengths[idx] = node.length.unwrap_or(0.0);
            for &c in &node.children {
                parent_indices[new_index[c]] = idx as i32;
            }
        }

        let mut tip_names = Vec::with_capacity(tips.len());
        for &old in &tips {
            match &raw[old].name {
                Some(name) => tip_names.push(name.clone()),
                None => return Err(TraitError::invalid_input("every tip must be named")),
            }
        }

        let mut tree = Tree::from_structure(parent_indices, branch_lengths, tips.len())?
            .with_tip_names(tip_names)?;
        for &old in &internals {
            tree.names[new_index[old]] = raw[old].name.clone();
        }
        Ok(tree)
    }

    /// Serialize to Newick, lengths with ten significant decimals.
    pub fn to_newick(&self) -> String {
        fn write(tree: &Tree, node: usize, buf: &mut String) {
            if !tree.children[node].is_empty() {
                buf.push('(');
                for (i, &c) in tree.children[node].iter().enumerate() {
                    if i > 0 {
                        buf.push(',');
                    }
                    write(tree, c, buf);
                }
                buf.push(')');
            }
            if let Some(name) = &tree.names[node] {
                buf.push_str(name);
            }
            if !tree.is_root(node) {
                let s = format!("{:.10}", tree.branch_lengths[node]);
                let s = s.trim_end_matches('0').trim_end_matches('.');
                buf.push(':');
                buf.push_str(s);
            }
        }
        let mut buf = String::new();
        write(self, self.root_index, &mut buf);
        buf.push(';');
        buf
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn n_tips(&self) -> usize {
        self.n_tips
    }

    pub fn root(&self) -> usize {
        self.root_index
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    pub fn is_tip(&self, node: usize) -> bool {
        self.children[node].is_empty()
    }

    pub fn is_root(&self, node: usize) -> bool {
        node == self.root_index
    }

    pub fn branch_length(&self, node: usize) -> f64 {
        self.branch_lengths[node]
    }

    pub fn tip_name(&self, tip: usize) -> Option<&str> {
        self.names.get(tip).and_then(|n| n.as_deref())
    }

    /// Tip index for a name, `None` if absent.
    pub fn tip_index(&self, name: &str) -> Option<usize> {
        self.tip_name_to_idx.get(name).copied()
    }

    /// Change one branch length and fire a `BranchLength` event.
    pub fn set_branch_length(&mut self, node: usize, length: f64) -> Result<()> {
        if node >= self.n_nodes {
            return Err(TraitError::out_of_range("node", node, self.n_nodes));
        }
        if !length.is_finite() || length < 0.0 {
            return Err(TraitError::invalid_parameter(format!(
                "branch length {} for node {}",
                length, node
            )));
        }
        self.branch_lengths[node] = length;
        self.fire_tree_change_event(node, TreeChangeKind::BranchLength);
        Ok(())
    }

    /// Nearest-neighbour interchange around the edge above `node`.
    ///
    /// Swaps `child` (a child of `node`) with `uncle` (a child of `node`'s
    /// parent other than `node`). Applying the same call with `child` and
    /// `uncle` exchanged undoes the move. Fires a `Topology` event at `node`.
    pub fn nni(&mut self, node: usize, child: usize, uncle: usize) -> Result<()> {
        if node >= self.n_nodes || child >= self.n_nodes || uncle >= self.n_nodes {
            return Err(TraitError::out_of_range("node", node.max(child).max(uncle), self.n_nodes));
        }
        let parent = self
            .parents[node]
            .ok_or_else(|| TraitError::invalid_input("NNI needs a non-root internal node"))?;
        if self.parents[child] != Some(node) {
            return Err(TraitError::invalid_input(format!("{} is not a child of {}", child, node)));
        }
        if uncle == node || self.parents[uncle] != Some(parent) {
            return Err(TraitError::invalid_input(format!("{} is not a sibling of {}", uncle, node)));
        }

        let ci = self.children[node].iter().position(|&c| c == child);
        let ui = self.children[parent].iter().position(|&c| c == uncle);
        if let (Some(ci), Some(ui)) = (ci, ui) {
            self.children[node][ci] = uncle;
            self.children[parent][ui] = child;
            self.parents[uncle] = Some(node);
            self.parents[child] = Some(parent);
        }
        self.fire_tree_change_event(node, TreeChangeKind::Topology);
        Ok(())
    }

    /// Get post-order traversal of nodes (tips to root).
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut visited = vec![false; self.n_nodes];

        fn visit(node: usize, tree: &Tree, visited: &mut Vec<bool>, order: &mut Vec<usize>) {
            if visited[node] {
                return;
            }
            visited[node] = true;
            for &child in &tree.children[node] {
                visit(child, tree, visited, order);
            }
            order.push(node);
        }

        visit(self.root_index, self, &mut visited, &mut order);
        order
    }

    /// Pre-order traversal (root first).
    pub fn pre_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut stack = vec![self.root_index];
        while let Some(node) = stack.pop() {
            order.push(node);
            for &c in self.children[node].iter().rev() {
                stack.push(c);
            }
        }
        order
    }

    /// Distance from the root to every node.
    pub fn depths(&self) -> Vec<f64> {
        let mut depths = vec![0.0; self.n_nodes];
        for node in self.pre_order() {
            if let Some(p) = self.parents[node] {
                depths[node] = depths[p] + self.branch_lengths[node];
            }
        }
        depths
    }

    /// Age of every node, measured back from the youngest tip.
    pub fn ages(&self) -> Vec<f64> {
        let depths = self.depths();
        let height = self.height_from(&depths);
        depths.iter().map(|d| height - d).collect()
    }

    /// Largest root-to-tip distance.
    pub fn height(&self) -> f64 {
        self.height_from(&self.depths())
    }

    fn height_from(&self, depths: &[f64]) -> f64 {
        (0..self.n_tips).map(|t| depths[t]).fold(0.0, f64::max)
    }

    pub fn is_ultrametric(&self, tolerance: f64) -> bool {
        let depths = self.depths();
        let height = self.height_from(&depths);
        (0..self.n_tips).all(|t| (depths[t] - height).abs() <= tolerance)
    }

    /// Tip indices beneath `node`, in tree order.
    pub fn tips_below(&self, node: usize) -> Vec<usize> {
        let mut tips = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if self.is_tip(n) {
                tips.push(n);
            } else {
                for &c in self.children[n].iter().rev() {
                    stack.push(c);
                }
            }
        }
        tips
    }

    pub fn add_listener(&mut self, listener: ListenerId) {
        if !self.listeners.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    pub fn remove_listener(&mut self, listener: ListenerId) {
        self.listeners.retain(|&l| l != listener);
    }

    pub fn has_listener(&self, listener: ListenerId) -> bool {
        self.listeners.contains(&listener)
    }

    /// Queue a change event for listeners.
    pub fn fire_tree_change_event(&mut self, node: usize, kind: TreeChangeKind) {
        self.events.push(TreeChangeEvent { node, kind });
    }

    /// Take all pending change events.
    pub fn drain_change_events(&mut self) -> Vec<TreeChangeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn clear_change_events(&mut self) {
        self.events.clear();
    }
}

#[derive(Debug)]
struct RawNode {
    name: Option<String>,
    length: Option<f64>,
    children: Vec<usize>,
}

/// Recursive-descent Newick reader.
///
/// ```text
/// tree     = subtree ';'
/// subtree  = '(' children ')' label | label
/// children = subtree (',' subtree)*
/// label    = name? (':' length)?
/// ```
struct NewickParser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> NewickParser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<Vec<RawNode>> {
        self.skip_whitespace();
        self.parse_subtree()?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(TraitError::parse(self.pos, "expected ';' at end of Newick string"));
        }
        Ok(self.nodes)
    }

    fn parse_subtree(&mut self) -> Result<usize> {
        self.skip_whitespace();
        let id = self.nodes.len();
        self.nodes.push(RawNode {
            name: None,
            length: None,
            children: Vec::new(),
        });

        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.parse_subtree()?;
                self.nodes[id].children.push(child);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(TraitError::parse(self.pos, "expected ',' or ')'")),
                }
            }
        }

        self.skip_whitespace();
        let name = self.take_while(|b| !matches!(b, b':' | b',' | b')' | b'(' | b';') && !b.is_ascii_whitespace());
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let start = self.pos;
            let text = self.take_while(|b| matches!(b, b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E'));
            let length: f64 = text
                .parse()
                .map_err(|_| TraitError::parse(start, format!("invalid branch length '{}'", text)))?;
            self.nodes[id].length = Some(length);
        }
        Ok(id)
    }

    fn take_while(&mut self, keep: impl Fn(u8) -> bool) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !keep(b) {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_creation() {
        let tree = Tree::from_newick("((A:1,B:1):1,C:1);").unwrap();

        assert_eq!(tree.n_tips(), 3);
        assert_eq!(tree.n_nodes(), 5);
        assert_eq!(tree.root(), 4);
        assert_eq!(tree.tip_index("C"), Some(2));
        assert_eq!(tree.tip_index("D"), None);
    }

    #[test]
    fn test_post_order() {
        let tree = Tree::from_newick("(A:1,B:1);").unwrap();

        let order = tree.post_order();
        assert_eq!(order.last(), Some(&tree.root()));
        assert_eq!(tree.pre_order().first(), Some(&tree.root()));
    }

    #[test]
    fn test_from_structure_rejects_bad_input() {
        assert!(Tree::from_structure(vec![-1, -1], vec![1.0, 1.0], 1).is_err());
        assert!(Tree::from_structure(vec![2, 2], vec![1.0, 1.0], 2).is_err());
        assert!(Tree::from_structure(vec![2, 2, -1], vec![1.0], 2).is_err());
        // internal node placed among the tips
        assert!(Tree::from_structure(vec![2, 0, -1], vec![1.0, 1.0, 0.0], 2).is_err());
    }

    #[test]
    fn test_depths_and_ages() {
        let tree = Tree::from_newick("((A:1,B:2):1,C:2);").unwrap();
        let depths = tree.depths();
        assert!((depths[0] - 2.0).abs() < 1e-12);
        assert!((depths[1] - 3.0).abs() < 1e-12);
        assert!((tree.height() - 3.0).abs() < 1e-12);
        assert!(!tree.is_ultrametric(1e-9));

        let ages = tree.ages();
        assert!((ages[tree.root()] - 3.0).abs() < 1e-12);
        assert!(ages[1].abs() < 1e-12);
    }

    #[test]
    fn test_newick_errors() {
        assert!(matches!(Tree::from_newick("((A,B),C)"), Err(TraitError::Parse { .. })));
        assert!(matches!(Tree::from_newick("((A:x,B),C);"), Err(TraitError::Parse { .. })));
        assert!(Tree::from_newick("((A,),C);").is_err());
    }

    #[test]
    fn test_newick_roundtrip() {
        let tree = Tree::from_newick("((A:0.5,B:1.25):1,C:2);").unwrap();
        let again = Tree::from_newick(&tree.to_newick()).unwrap();
        assert_eq!(again.n_nodes(), tree.n_nodes());
        for node in 0..tree.n_nodes() {
            assert!((again.branch_length(node) - tree.branch_length(node)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_nni_and_undo() {
        let mut tree = Tree::from_newick("(((A:1,B:1):1,C:2):1,D:3);").unwrap();
        let ab = tree.parent(0).unwrap();
        let c = tree.tip_index("C").unwrap();
        let before = tree.to_newick();

        tree.nni(ab, 0, c).unwrap();
        assert_eq!(tree.parent(0), tree.parent(ab));
        assert_eq!(tree.parent(c), Some(ab));
        let events = tree.drain_change_events();
        assert_eq!(events, vec![TreeChangeEvent { node: ab, kind: TreeChangeKind::Topology }]);

        tree.nni(ab, c, 0).unwrap();
        assert_eq!(tree.to_newick(), before);
    }

    #[test]
    fn test_listeners_not_cloned() {
        let mut tree = Tree::from_newick("(A:1,B:1);").unwrap();
        let id = ListenerId::next();
        tree.add_listener(id);
        tree.set_branch_length(0, 2.0).unwrap();
        assert!(tree.has_listener(id));

        let copy = tree.clone();
        assert!(!copy.has_listener(id));
        assert_eq!(tree.drain_change_events().len(), 1);
        assert!(tree.drain_change_events().is_empty());
    }
}
