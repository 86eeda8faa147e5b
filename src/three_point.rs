//! Three-point generalized-least-squares pass for a single OU regime.
//!
//! The OU covariance with a fixed root factorises as
//! `V = (sigma^2 / 2 alpha) * W V' W`, where `V'` is a Brownian covariance on
//! the same topology with node heights `g(d) = exp(-2 alpha (T - d)) - exp(-2 alpha T)`
//! (`T` the tree height) and `W = diag(exp(alpha (T - d_i)))`. One postorder
//! pass over the transformed edges accumulates `log|V'|`, `1'V'^-1 1` and, per
//! site, `y'V'^-1 1`, `y'V'^-1 y`, `X'V'^-1 1`, `X'V'^-1 X`, `X'V'^-1 y` by
//! Sherman-Morrison updates, with no matrix ever formed.

use ndarray::Array3;

use crate::cache::CacheController;
use crate::covariance::{CovarianceModel, OU_ALPHA_EPSILON, ZERO_EDGE_EPSILON};
use crate::error::{Result, TraitError};
use crate::observations::TipObservations;
use crate::tree::Tree;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

// per-site statistic positions
const Y1: usize = 0;
const YY: usize = 1;
const X1: usize = 2;
const XX: usize = 3;
const XY: usize = 4;
const N_SITE_STATS: usize = 5;

/// Sufficient statistics of one subtree, including the edge above it.
#[derive(Clone, Debug, PartialEq)]
struct Stats {
    log_det: f64,
    one: f64,
    sites: Vec<[f64; N_SITE_STATS]>,
}

impl Stats {
    fn zero(n_sites: usize) -> Self {
        Self {
            log_det: 0.0,
            one: 0.0,
            sites: vec![[0.0; N_SITE_STATS]; n_sites],
        }
    }

    fn add(&mut self, other: &Stats) {
        self.log_det += other.log_det;
        self.one += other.one;
        for (a, b) in self.sites.iter_mut().zip(&other.sites) {
            for k in 0..N_SITE_STATS {
                a[k] += b[k];
            }
        }
    }
}

/// Edge lengths, tip weights and scale of the Brownian-equivalent tree.
#[derive(Clone, Debug)]
struct Transform {
    edges: Vec<f64>,
    weights: Vec<f64>,
    decay: Vec<f64>,
    scale: f64,
    theta: f64,
}

impl Transform {
    fn new(tree: &Tree, sigma: f64, alpha: f64, theta: f64) -> Self {
        let depths = tree.depths();
        let height = tree.height();
        let brownian = alpha < OU_ALPHA_EPSILON;

        // g(d_c) - g(d_p) written in the branch length alone
        let edges = (0..tree.n_nodes())
            .map(|node| match tree.parent(node) {
                Some(_) if brownian => tree.branch_length(node),
                Some(p) => {
                    let t = tree.branch_length(node);
                    (-2.0 * alpha * (height - depths[p])).exp() * (2.0 * alpha * t).exp_m1()
                }
                None => 0.0,
            })
            .collect();
        let weights = (0..tree.n_tips())
            .map(|tip| if brownian { 1.0 } else { (alpha * (height - depths[tip])).exp() })
            .collect();
        let decay = (0..tree.n_tips())
            .map(|tip| if brownian { 1.0 } else { (-alpha * depths[tip]).exp() })
            .collect();
        let scale = if brownian {
            sigma * sigma
        } else {
            sigma * sigma / (2.0 * alpha)
        };

        Self {
            edges,
            weights,
            decay,
            scale,
            theta,
        }
    }

    /// Weighted observation and weighted expectation of a tip at one site.
    fn tip_values(&self, tips: &TipObservations, model: &CovarianceModel, tip: usize, site: usize) -> (f64, f64) {
        let w = self.weights[tip];
        let e = self.decay[tip];
        let expected = model.root_state(site) * e + self.theta * (1.0 - e);
        (tips.value(tip, site) / w, expected / w)
    }
}

/// Three-point state: per-node statistics in two slots.
#[derive(Clone, Debug)]
pub struct ThreePoint {
    n_sites: usize,
    // [slot, node, 2 + 5 * site]: log_det, one, then the per-site block
    stats: Array3<f64>,
    root_ln_likelihood: [f64; 2],
}

impl ThreePoint {
    pub fn new(n_nodes: usize, n_sites: usize) -> Self {
        Self {
            n_sites,
            stats: Array3::zeros((2, n_nodes, 2 + N_SITE_STATS * n_sites)),
            root_ln_likelihood: [0.0; 2],
        }
    }

    pub fn resize(&mut self, n_nodes: usize, n_sites: usize) {
        *self = Self::new(n_nodes, n_sites);
    }

    /// Log-likelihood summed over sites, recomputing only dirty nodes.
    pub fn compute(
        &mut self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        cache: &mut CacheController,
    ) -> Result<f64> {
        let root = tree.root();
        if !cache.is_dirty(root) {
            return Ok(self.root_ln_likelihood[cache.active(root)]);
        }

        let (sigma, alpha, theta) = model.single_regime()?;
        let transform = Transform::new(tree, sigma, alpha, theta);
        self.recursive_compute(tree, model, tips, &transform, cache, root)?;

        let total = self.load(cache.active(root), root);
        let n = tree.n_tips() as f64;
        let log_weights: f64 = transform.weights.iter().map(|w| w.ln()).sum();
        let mut ln_l = 0.0;
        for (site, s) in total.sites.iter().enumerate() {
            let rate = model.site_rate(site);
            let scale = transform.scale * rate * rate;
            let quadratic = s[YY] - 2.0 * s[XY] + s[XX];
            ln_l += -0.5 * (n * LN_2PI + total.log_det + 2.0 * log_weights + n * scale.ln() + quadratic / scale);
        }

        self.root_ln_likelihood[cache.active(root)] = ln_l;
        Ok(ln_l)
    }

    fn recursive_compute(
        &mut self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        transform: &Transform,
        cache: &mut CacheController,
        node: usize,
    ) -> Result<()> {
        if !cache.is_dirty(node) {
            return Ok(());
        }

        let edge = transform.edges[node];
        let zero_length = is_zero_length(tree, node);
        if !zero_length && !(edge > 0.0 && edge.is_finite()) {
            return Err(TraitError::singular(format!(
                "transformed edge above node {} is out of floating-point range",
                node
            )));
        }
        let stats = if tree.is_tip(node) {
            let mut stats = Stats::zero(self.n_sites);
            // zero-length tips are absorbed by their parent
            if !zero_length {
                stats.log_det = edge.ln();
                stats.one = 1.0 / edge;
                for (site, s) in stats.sites.iter_mut().enumerate() {
                    let (y, x) = transform.tip_values(tips, model, node, site);
                    *s = [y / edge, y * y / edge, x / edge, x * x / edge, x * y / edge];
                }
            }
            stats
        } else {
            for &child in tree.children(node) {
                self.recursive_compute(tree, model, tips, transform, cache, child)?;
            }

            let mut zero_tip = None;
            let mut sum = Stats::zero(self.n_sites);
            for &child in tree.children(node) {
                if tree.is_tip(child) && is_zero_length(tree, child) {
                    if zero_tip.replace(child).is_some() {
                        return Err(TraitError::singular(format!(
                            "two zero-length sister tips below node {}",
                            node
                        )));
                    }
                } else {
                    sum.add(&self.load(cache.active(child), child));
                }
            }

            match zero_tip {
                None => attach_edge(sum, edge),
                Some(tip) => {
                    if zero_length {
                        return Err(TraitError::singular(format!(
                            "zero-length tip {} below a zero-length edge at node {}",
                            tip, node
                        )));
                    }
                    absorb_observed_node(sum, edge, |site| transform.tip_values(tips, model, tip, site))
                }
            }
        };

        self.save(cache.active(node), node, &stats);
        cache.mark_clean(node);
        Ok(())
    }

    fn load(&self, slot: usize, node: usize) -> Stats {
        let row = self.stats.slice(ndarray::s![slot, node, ..]);
        Stats {
            log_det: row[0],
            one: row[1],
            sites: (0..self.n_sites)
                .map(|site| {
                    let base = 2 + N_SITE_STATS * site;
                    [row[base], row[base + 1], row[base + 2], row[base + 3], row[base + 4]]
                })
                .collect(),
        }
    }

    fn save(&mut self, slot: usize, node: usize, stats: &Stats) {
        let mut row = self.stats.slice_mut(ndarray::s![slot, node, ..]);
        row[0] = stats.log_det;
        row[1] = stats.one;
        for (site, s) in stats.sites.iter().enumerate() {
            let base = 2 + N_SITE_STATS * site;
            for k in 0..N_SITE_STATS {
                row[base + k] = s[k];
            }
        }
    }
}

/// Zero-ness is judged on the untransformed branch; the root has no edge.
fn is_zero_length(tree: &Tree, node: usize) -> bool {
    tree.is_root(node) || tree.branch_length(node) <= ZERO_EDGE_EPSILON
}

/// Add the edge of length `t` above a set of independent subtrees:
/// `V = t 11' + V_sub`, updated by Sherman-Morrison.
fn attach_edge(sum: Stats, t: f64) -> Stats {
    let p = sum.one;
    let f = 1.0 + t * p;
    Stats {
        log_det: sum.log_det + f.ln(),
        one: p / f,
        sites: sum
            .sites
            .iter()
            .map(|s| {
                [
                    s[Y1] / f,
                    s[YY] - t * s[Y1] * s[Y1] / f,
                    s[X1] / f,
                    s[XX] - t * s[X1] * s[X1] / f,
                    s[XY] - t * s[X1] * s[Y1] / f,
                ]
            })
            .collect(),
    }
}

/// Node whose value equals a zero-length tip child `(y0, x0)`: the other
/// subtrees are conditionally independent given it, and the node's own edge
/// `t` carries the only remaining variance.
fn absorb_observed_node(others: Stats, t: f64, observed: impl Fn(usize) -> (f64, f64)) -> Stats {
    let p = others.one;
    Stats {
        log_det: others.log_det + t.ln(),
        one: 1.0 / t,
        sites: others
            .sites
            .iter()
            .enumerate()
            .map(|(site, s)| {
                let (y0, x0) = observed(site);
                [
                    y0 / t,
                    y0 * y0 / t + s[YY] - 2.0 * y0 * s[Y1] + y0 * y0 * p,
                    x0 / t,
                    x0 * x0 / t + s[XX] - 2.0 * x0 * s[X1] + x0 * x0 * p,
                    x0 * y0 / t + s[XY] - x0 * s[Y1] - y0 * s[X1] + x0 * y0 * p,
                ]
            })
            .collect(),
    }
}
