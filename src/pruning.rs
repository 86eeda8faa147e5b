//! Independent-contrasts (REML) pruning for Gaussian trait models.
//!
//! Computes log P(tip data | tree, model) in one postorder pass by replacing
//! each pair of sister subtrees with a contrast and a propagated variance.
//! Only dirty nodes are recomputed; clean children are read from their
//! active cache slot.

use rayon::prelude::*;

use crate::cache::{CacheController, NodeBuffers};
use crate::covariance::{CovarianceModel, OU_ALPHA_EPSILON};
use crate::error::{Result, TraitError};
use crate::observations::TipObservations;
use crate::tree::Tree;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Log density of `Normal(mean, sd)` at `x`.
pub fn ln_normal_pdf(mean: f64, sd: f64, x: f64) -> f64 {
    let z = (x - mean) / sd;
    -LN_SQRT_2PI - sd.ln() - 0.5 * z * z
}

/// How a child's message crosses its branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKernel {
    Brownian,
    OrnsteinUhlenbeck,
}

/// Whether the root value is a fixed parameter or integrated out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootTreatment {
    /// The root equals the model's root state; its density is folded in.
    #[default]
    Fixed,
    /// Restricted likelihood of the contrasts only.
    Restricted,
}

/// Gaussian message of a subtree, expressed at its parent node.
struct Message {
    mean: Vec<f64>,
    variance: f64,
    partial: Vec<f64>,
}

/// Contrast pruning state: kernel choice plus double-buffered node values.
#[derive(Clone, Debug)]
pub struct ContrastPruning {
    kernel: BranchKernel,
    root_treatment: RootTreatment,
    buffers: NodeBuffers,
    root_ln_likelihood: [f64; 2],
    parallel_threshold: usize,
}

impl ContrastPruning {
    pub fn new(
        kernel: BranchKernel,
        root_treatment: RootTreatment,
        n_nodes: usize,
        n_sites: usize,
        parallel_threshold: usize,
    ) -> Self {
        Self {
            kernel,
            root_treatment,
            buffers: NodeBuffers::new(n_nodes, n_sites),
            root_ln_likelihood: [0.0; 2],
            parallel_threshold,
        }
    }

    /// Reallocate buffers for a new tree or site count.
    pub fn resize(&mut self, n_nodes: usize, n_sites: usize) {
        self.buffers = NodeBuffers::new(n_nodes, n_sites);
        self.root_ln_likelihood = [0.0; 2];
    }

    pub fn kernel(&self) -> BranchKernel {
        self.kernel
    }

    /// Active-slot contrast of a node (the species mean for a tip).
    pub fn contrast(&self, cache: &CacheController, node: usize, site: usize) -> f64 {
        self.buffers.contrasts(cache.active(node), node)[site]
    }

    /// Active-slot propagated uncertainty of a node.
    pub fn uncertainty(&self, cache: &CacheController, node: usize) -> f64 {
        self.buffers.uncertainty(cache.active(node), node)
    }

    /// Active-slot partial log-likelihood of a node.
    pub fn partial(&self, cache: &CacheController, node: usize, site: usize) -> f64 {
        self.buffers.partials(cache.active(node), node)[site]
    }

    /// Log-likelihood summed over sites, recomputing only dirty nodes.
    ///
    /// # Arguments
    /// * `within_species_variance` - `Some(v)` for multi-sample tips, `None` otherwise
    pub fn compute(
        &mut self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        within_species_variance: Option<f64>,
        cache: &mut CacheController,
    ) -> Result<f64> {
        let root = tree.root();
        if !cache.is_dirty(root) {
            return Ok(self.root_ln_likelihood[cache.active(root)]);
        }
        if tree.is_tip(root) {
            return Err(TraitError::invalid_input("contrast pruning needs at least two tips"));
        }

        self.recursive_compute(tree, model, tips, within_species_variance, cache, root)?;

        let slot = cache.active(root);
        let contrasts = self.buffers.contrasts(slot, root);
        let partials = self.buffers.partials(slot, root);
        let root_sd = self.buffers.uncertainty(slot, root).sqrt();
        let mut ln_l = 0.0;
        for site in 0..tips.n_sites() {
            ln_l += partials[site];
            if self.root_treatment == RootTreatment::Fixed {
                let sd = root_sd * model.site_rate(site);
                ln_l += ln_normal_pdf(contrasts[site], sd, model.root_state(site));
            }
        }
        self.root_ln_likelihood[slot] = ln_l;
        Ok(ln_l)
    }

    fn recursive_compute(
        &mut self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        within_species_variance: Option<f64>,
        cache: &mut CacheController,
        node: usize,
    ) -> Result<()> {
        if !cache.is_dirty(node) {
            return Ok(());
        }

        if tree.is_tip(node) {
            self.initialize_tip(model, tips, within_species_variance, cache.active(node), node)?;
        } else {
            for &child in tree.children(node) {
                self.recursive_compute(tree, model, tips, within_species_variance, cache, child)?;
            }

            let mut combined: Option<Message> = None;
            for &child in tree.children(node) {
                let message = self.branch_message(tree, model, cache, child);
                combined = Some(match combined {
                    None => message,
                    Some(acc) => self.combine(model, acc, message),
                });
            }
            if let Some(message) = combined {
                self.buffers.store(
                    cache.active(node),
                    node,
                    &message.mean,
                    &message.partial,
                    message.variance,
                );
            }
        }

        cache.mark_clean(node);
        Ok(())
    }

    /// Tip values: observation (or species mean), its variance and the
    /// within-species density terms.
    fn initialize_tip(
        &mut self,
        model: &CovarianceModel,
        tips: &TipObservations,
        within_species_variance: Option<f64>,
        slot: usize,
        tip: usize,
    ) -> Result<()> {
        let n_sites = tips.n_sites();
        let n = tips.n_samples(tip);
        let means: Vec<f64> = (0..n_sites).map(|s| tips.value(tip, s)).collect();
        let mut partials = vec![0.0; n_sites];
        let mut uncertainty = 0.0;

        if let Some(v) = within_species_variance {
            if v < 0.0 || (v == 0.0 && n > 1) {
                return Err(TraitError::invalid_parameter(format!(
                    "within-species variance {} with {} samples",
                    v, n
                )));
            }
            uncertainty = v / n as f64;
            if n > 1 {
                let samples = tips.samples(tip);
                for (site, partial) in partials.iter_mut().enumerate() {
                    let rate = model.site_rate(site);
                    let sd = v.sqrt() * rate;
                    let mean = means[site];
                    *partial = samples
                        .column(site)
                        .iter()
                        .map(|&x| ln_normal_pdf(mean, sd, x))
                        .sum::<f64>()
                        + 0.5 * (2.0 * std::f64::consts::PI * rate * rate * uncertainty).ln();
                }
            }
        }

        self.buffers.store(slot, tip, &means, &partials, uncertainty);
        Ok(())
    }

    /// Move a child's active values across its branch.
    fn branch_message(&self, tree: &Tree, model: &CovarianceModel, cache: &CacheController, child: usize) -> Message {
        let slot = cache.active(child);
        let contrasts = self.buffers.contrasts(slot, child);
        let partials = self.buffers.partials(slot, child);
        let uncertainty = self.buffers.uncertainty(slot, child);
        let t = tree.branch_length(child);

        let alpha = model.branch_alpha(child);
        if self.kernel == BranchKernel::Brownian || alpha < OU_ALPHA_EPSILON {
            return Message {
                mean: contrasts.to_vec(),
                variance: model.branch_time(child, t) + uncertainty,
                partial: partials.to_vec(),
            };
        }

        let theta = model.branch_theta(child);
        let growth = (alpha * t).exp();
        let log_factor = alpha * t;
        Message {
            mean: contrasts.iter().map(|&m| growth * (m - theta) + theta).collect(),
            variance: (model.ou_branch_variance(child, t) + uncertainty) * growth * growth,
            partial: partials.iter().map(|&p| p + log_factor).collect(),
        }
    }

    /// Merge two messages at the same node, emitting one contrast per site.
    fn combine(&self, model: &CovarianceModel, left: Message, right: Message) -> Message {
        let total = left.variance + right.variance;
        let scale = total.sqrt();
        let per_site = |site: usize| {
            let raw = left.mean[site] - right.mean[site];
            let sd = scale * model.site_rate(site);
            let mean = (left.mean[site] * right.variance + right.mean[site] * left.variance) / total;
            let partial = left.partial[site] + right.partial[site] + ln_normal_pdf(0.0, sd, raw);
            (mean, partial)
        };

        let n_sites = left.mean.len();
        let values: Vec<(f64, f64)> = if n_sites >= self.parallel_threshold {
            (0..n_sites).into_par_iter().map(per_site).collect()
        } else {
            (0..n_sites).map(per_site).collect()
        };
        let (mean, partial): (Vec<f64>, Vec<f64>) = values.into_iter().unzip();

        Message {
            mean,
            variance: left.variance * right.variance / total,
            partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trait_matrix::TraitMatrix;

    fn setup(newick: &str, rows: Vec<(&str, Vec<f64>)>) -> (Tree, TipObservations) {
        let tree = Tree::from_newick(newick).unwrap();
        let matrix = TraitMatrix::from_rows(rows).unwrap();
        let n_sites = matrix.number_of_characters();
        let tips = TipObservations::single_sample(&tree, &matrix, n_sites).unwrap();
        (tree, tips)
    }

    #[test]
    fn test_ln_normal_pdf() {
        assert!((ln_normal_pdf(0.0, 1.0, 0.0) + LN_SQRT_2PI).abs() < 1e-15);
        let expected = -LN_SQRT_2PI - 2.0f64.ln() - 0.5 * 0.25;
        assert!((ln_normal_pdf(1.0, 2.0, 2.0) - expected).abs() < 1e-15);
    }

    #[test]
    fn test_two_tip_contrast() {
        let (tree, tips) = setup("(A:1,B:3);", vec![("A", vec![1.0]), ("B", vec![3.0])]);
        let model = CovarianceModel::brownian(1.0, 0.0);
        let mut cache = CacheController::new(tree.n_nodes());
        let mut pruning = ContrastPruning::new(BranchKernel::Brownian, RootTreatment::Fixed, 3, 1, 64);

        let ln_l = pruning.compute(&tree, &model, &tips, None, &mut cache).unwrap();

        let root = tree.root();
        assert!((pruning.uncertainty(&cache, root) - 0.75).abs() < 1e-12);
        assert!((pruning.contrast(&cache, root, 0) - 1.5).abs() < 1e-12);
        let expected = ln_normal_pdf(0.0, 2.0, -2.0) + ln_normal_pdf(1.5, 0.75f64.sqrt(), 0.0);
        assert!((ln_l - expected).abs() < 1e-12);
    }

    #[test]
    fn test_restricted_skips_root_term() {
        let (tree, tips) = setup("(A:1,B:3);", vec![("A", vec![1.0]), ("B", vec![3.0])]);
        let model = CovarianceModel::brownian(1.0, 0.0);
        let mut cache = CacheController::new(tree.n_nodes());
        let mut pruning = ContrastPruning::new(BranchKernel::Brownian, RootTreatment::Restricted, 3, 1, 64);

        let ln_l = pruning.compute(&tree, &model, &tips, None, &mut cache).unwrap();
        assert!((ln_l - ln_normal_pdf(0.0, 2.0, -2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_site_rate_scales_contrasts() {
        let (tree, tips) = setup("(A:1,B:1);", vec![("A", vec![1.0, 1.0]), ("B", vec![-1.0, -1.0])]);
        let model = CovarianceModel::brownian(1.0, 0.0).with_site_rates(vec![1.0, 2.0]);
        let mut cache = CacheController::new(tree.n_nodes());
        let mut pruning = ContrastPruning::new(BranchKernel::Brownian, RootTreatment::Restricted, 3, 2, 1);

        pruning.compute(&tree, &model, &tips, None, &mut cache).unwrap();
        let root = tree.root();
        let sd = 2.0f64.sqrt();
        assert!((pruning.partial(&cache, root, 0) - ln_normal_pdf(0.0, sd, 2.0)).abs() < 1e-12);
        assert!((pruning.partial(&cache, root, 1) - ln_normal_pdf(0.0, 2.0 * sd, 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_clean_root_is_cached() {
        let (tree, tips) = setup("((A:1,B:1):1,C:2);", vec![("A", vec![0.5]), ("B", vec![-0.3]), ("C", vec![1.0])]);
        let model = CovarianceModel::brownian(1.0, 0.0);
        let mut cache = CacheController::new(tree.n_nodes());
        let mut pruning = ContrastPruning::new(BranchKernel::Brownian, RootTreatment::Fixed, 5, 1, 64);

        let first = pruning.compute(&tree, &model, &tips, None, &mut cache).unwrap();
        let count = cache.recomputations();
        assert_eq!(count, 5);
        let second = pruning.compute(&tree, &model, &tips, None, &mut cache).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.recomputations(), count);
    }

    #[test]
    fn test_ou_matches_brownian_at_zero_alpha() {
        let (tree, tips) = setup("((A:1,B:2):1,C:2);", vec![("A", vec![0.5]), ("B", vec![-0.3]), ("C", vec![1.0])]);
        let bm = CovarianceModel::brownian(1.3, 0.2);
        let ou = CovarianceModel::ornstein_uhlenbeck(1.3, 0.0, 5.0, 0.2);

        let mut c1 = CacheController::new(5);
        let mut p1 = ContrastPruning::new(BranchKernel::Brownian, RootTreatment::Fixed, 5, 1, 64);
        let mut c2 = CacheController::new(5);
        let mut p2 = ContrastPruning::new(BranchKernel::OrnsteinUhlenbeck, RootTreatment::Fixed, 5, 1, 64);

        let a = p1.compute(&tree, &bm, &tips, None, &mut c1).unwrap();
        let b = p2.compute(&tree, &ou, &tips, None, &mut c2).unwrap();
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_negative_within_variance() {
        let (tree, tips) = setup("(A:1,B:1);", vec![("A", vec![1.0]), ("B", vec![3.0])]);
        let model = CovarianceModel::brownian(1.0, 0.0);
        let mut cache = CacheController::new(3);
        let mut pruning = ContrastPruning::new(BranchKernel::Brownian, RootTreatment::Fixed, 3, 1, 64);
        assert!(matches!(
            pruning.compute(&tree, &model, &tips, Some(-1.0), &mut cache),
            Err(TraitError::InvalidParameter { .. })
        ));
    }
}
