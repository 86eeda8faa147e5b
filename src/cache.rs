//! Incremental-evaluation bookkeeping for MCMC proposals.
//!
//! Every tree node owns two cache slots. During a proposal the node's
//! `active` slot is flipped (once) so that the old values stay untouched in
//! the other slot; `restore` flips back, `keep` just forgets the flags.

use ndarray::{Array2, Array3, ArrayView1, ArrayViewMut1};
use tracing::trace;

use crate::tree::{ListenerId, Tree};

/// Dirty / active / changed flags for every node of one tree.
#[derive(Clone, Debug)]
pub struct CacheController {
    active: Vec<usize>,
    dirty: Vec<bool>,
    changed: Vec<bool>,
    listener: ListenerId,
    recomputed: usize,
}

impl CacheController {
    /// Controller for `n_nodes` nodes, all dirty.
    pub fn new(n_nodes: usize) -> Self {
        Self {
            active: vec![0; n_nodes],
            dirty: vec![true; n_nodes],
            changed: vec![false; n_nodes],
            listener: ListenerId::next(),
            recomputed: 0,
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.dirty.len()
    }

    /// Resize for a new tree and mark every node dirty.
    pub fn reset(&mut self, n_nodes: usize) {
        self.active = vec![0; n_nodes];
        self.dirty = vec![true; n_nodes];
        self.changed = vec![false; n_nodes];
    }

    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Subscribe to `tree` if not already subscribed.
    ///
    /// Returns `true` when the subscription was missing, i.e. the tree was
    /// replaced without notification and every cached value is stale.
    pub fn ensure_subscribed(&mut self, tree: &mut Tree) -> bool {
        if tree.has_listener(self.listener) {
            return false;
        }
        tree.add_listener(self.listener);
        true
    }

    /// Slot currently holding the node's live values.
    pub fn active(&self, node: usize) -> usize {
        self.active[node]
    }

    pub fn is_dirty(&self, node: usize) -> bool {
        self.dirty[node]
    }

    pub fn is_changed(&self, node: usize) -> bool {
        self.changed[node]
    }

    /// Mark `node` and its ancestors dirty, flipping each buffer at most once.
    pub fn flag_dirty(&mut self, tree: &Tree, node: usize) {
        if self.dirty[node] {
            return;
        }
        if let Some(parent) = tree.parent(node) {
            self.flag_dirty(tree, parent);
        }
        self.dirty[node] = true;
        if !self.changed[node] {
            self.active[node] ^= 1;
            self.changed[node] = true;
        }
        trace!(node, slot = self.active[node], "flagged dirty");
    }

    /// Mark every node dirty.
    pub fn flag_all(&mut self, tree: &Tree) {
        for node in tree.post_order() {
            self.flag_dirty(tree, node);
        }
    }

    /// Record that `node` has been recomputed into its active slot.
    pub fn mark_clean(&mut self, node: usize) {
        self.dirty[node] = false;
        self.recomputed += 1;
    }

    /// Accept the proposal: the active slots become permanent.
    pub fn keep(&mut self) {
        self.dirty.iter_mut().for_each(|d| *d = false);
        self.changed.iter_mut().for_each(|c| *c = false);
    }

    /// Reject the proposal: every flipped node goes back to its stored slot.
    pub fn restore(&mut self) {
        for node in 0..self.active.len() {
            if self.changed[node] {
                self.active[node] ^= 1;
            }
        }
        self.keep();
    }

    /// Total node recomputations since construction.
    pub fn recomputations(&self) -> usize {
        self.recomputed
    }
}

/// Double-buffered per-node values laid out `[slot, node, site]`.
#[derive(Clone, Debug)]
pub struct NodeBuffers {
    contrasts: Array3<f64>,
    partials: Array3<f64>,
    uncertainty: Array2<f64>,
}

impl NodeBuffers {
    pub fn new(n_nodes: usize, n_sites: usize) -> Self {
        Self {
            contrasts: Array3::zeros((2, n_nodes, n_sites)),
            partials: Array3::zeros((2, n_nodes, n_sites)),
            uncertainty: Array2::zeros((2, n_nodes)),
        }
    }

    pub fn n_sites(&self) -> usize {
        self.contrasts.dim().2
    }

    pub fn contrasts(&self, slot: usize, node: usize) -> ArrayView1<'_, f64> {
        self.contrasts.slice(ndarray::s![slot, node, ..])
    }

    pub fn partials(&self, slot: usize, node: usize) -> ArrayView1<'_, f64> {
        self.partials.slice(ndarray::s![slot, node, ..])
    }

    pub fn uncertainty(&self, slot: usize, node: usize) -> f64 {
        self.uncertainty[[slot, node]]
    }

    pub fn contrasts_mut(&mut self, slot: usize, node: usize) -> ArrayViewMut1<'_, f64> {
        self.contrasts.slice_mut(ndarray::s![slot, node, ..])
    }

    pub fn partials_mut(&mut self, slot: usize, node: usize) -> ArrayViewMut1<'_, f64> {
        self.partials.slice_mut(ndarray::s![slot, node, ..])
    }

    pub fn set_uncertainty(&mut self, slot: usize, node: usize, value: f64) {
        self.uncertainty[[slot, node]] = value;
    }

    /// Write one node's values into the given slot.
    pub fn store(&mut self, slot: usize, node: usize, contrasts: &[f64], partials: &[f64], uncertainty: f64) {
        for (dst, src) in self.contrasts_mut(slot, node).iter_mut().zip(contrasts) {
            *dst = *src;
        }
        for (dst, src) in self.partials_mut(slot, node).iter_mut().zip(partials) {
            *dst = *src;
        }
        self.uncertainty[[slot, node]] = uncertainty;
    }
}

/// Two preallocated values with an active index and per-slot validity.
///
/// Used for whole-tree quantities such as the phylogenetic covariance.
#[derive(Clone, Debug)]
pub struct DoubleBuffer<T> {
    slots: [Option<T>; 2],
    active: usize,
    changed: bool,
}

impl<T> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self {
            slots: [None, None],
            active: 0,
            changed: false,
        }
    }
}

impl<T> DoubleBuffer<T> {
    /// Live value, `None` if it must be rebuilt.
    pub fn active(&self) -> Option<&T> {
        self.slots[self.active].as_ref()
    }

    pub fn set_active(&mut self, value: T) {
        self.slots[self.active] = Some(value);
    }

    /// Invalidate the live value, preserving the other slot for rollback.
    pub fn touch(&mut self) {
        if !self.changed {
            self.active ^= 1;
            self.changed = true;
        }
        self.slots[self.active] = None;
    }

    pub fn keep(&mut self) {
        self.changed = false;
    }

    pub fn restore(&mut self) {
        if self.changed {
            self.active ^= 1;
            self.changed = false;
        }
    }

    /// Drop both slots.
    pub fn clear(&mut self) {
        self.slots = [None, None];
        self.changed = false;
    }
}
