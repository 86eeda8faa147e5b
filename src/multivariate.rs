//! Contrast pruning for correlated traits.
//!
//! Every included character is one trait; traits covary through a `k × k`
//! rate matrix `R`. A node carries a contrast vector over traits, one scalar
//! propagated uncertainty and one scalar partial log-likelihood (kept in the
//! first partial entry of the node's buffer). With several individuals per
//! species, a tip starts from the species mean vector with uncertainty
//! `v / n`, individuals scattering around it as `N(mean, v R)`.

use nalgebra::{DMatrix, DVector};

use crate::cache::{CacheController, DoubleBuffer, NodeBuffers};
use crate::covariance::CovarianceModel;
use crate::error::{Result, TraitError};
use crate::mvn::Factorized;
use crate::observations::TipObservations;
use crate::pruning::RootTreatment;
use crate::tree::Tree;

#[derive(Clone, Debug)]
pub struct MultivariatePruning {
    root_treatment: RootTreatment,
    buffers: NodeBuffers,
    rate_matrix: DoubleBuffer<Factorized>,
    root_ln_likelihood: [f64; 2],
}

impl MultivariatePruning {
    pub fn new(root_treatment: RootTreatment, n_nodes: usize, n_traits: usize) -> Self {
        Self {
            root_treatment,
            buffers: NodeBuffers::new(n_nodes, n_traits),
            rate_matrix: DoubleBuffer::default(),
            root_ln_likelihood: [0.0; 2],
        }
    }

    pub fn resize(&mut self, n_nodes: usize, n_traits: usize) {
        self.buffers = NodeBuffers::new(n_nodes, n_traits);
        self.rate_matrix.clear();
        self.root_ln_likelihood = [0.0; 2];
    }

    /// The rate matrix changed: refactorise it next time.
    pub fn touch_rate_matrix(&mut self) {
        self.rate_matrix.touch();
    }

    pub fn keep(&mut self) {
        self.rate_matrix.keep();
    }

    pub fn restore(&mut self) {
        self.rate_matrix.restore();
    }

    /// Active-slot contrast vector of a node.
    pub fn contrast(&self, cache: &CacheController, node: usize) -> Vec<f64> {
        self.buffers.contrasts(cache.active(node), node).to_vec()
    }

    pub fn compute(
        &mut self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        rate_matrix: &DMatrix<f64>,
        within_species_variance: Option<f64>,
        cache: &mut CacheController,
    ) -> Result<f64> {
        let root = tree.root();
        if !cache.is_dirty(root) {
            return Ok(self.root_ln_likelihood[cache.active(root)]);
        }
        let k = tips.n_sites();
        if rate_matrix.shape() != (k, k) {
            return Err(TraitError::invalid_parameter(format!(
                "rate matrix is {}x{}, expected {}x{}",
                rate_matrix.nrows(),
                rate_matrix.ncols(),
                k,
                k
            )));
        }
        if self.rate_matrix.active().is_none() {
            self.rate_matrix.set_active(Factorized::new(rate_matrix.clone())?);
        }
        let factor = self
            .rate_matrix
            .active()
            .cloned()
            .ok_or_else(|| TraitError::singular("rate matrix unavailable"))?;

        self.recursive_compute(tree, model, tips, &factor, within_species_variance, cache, root)?;

        let slot = cache.active(root);
        let mut ln_l = self.buffers.partials(slot, root)[0];
        if self.root_treatment == RootTreatment::Fixed {
            let contrast = DVector::from_iterator(k, self.buffers.contrasts(slot, root).iter().copied());
            let root_state = DVector::from_iterator(k, (0..k).map(|t| model.root_state(t)));
            let sd = self.buffers.uncertainty(slot, root).sqrt();
            ln_l += factor.ln_density(&root_state, &contrast, sd);
        }
        self.root_ln_likelihood[slot] = ln_l;
        Ok(ln_l)
    }

    fn recursive_compute(
        &mut self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        factor: &Factorized,
        within_species_variance: Option<f64>,
        cache: &mut CacheController,
        node: usize,
    ) -> Result<()> {
        if !cache.is_dirty(node) {
            return Ok(());
        }
        let k = tips.n_sites();

        if tree.is_tip(node) {
            self.initialize_tip(tips, factor, within_species_variance, cache.active(node), node)?;
        } else {
            for &child in tree.children(node) {
                self.recursive_compute(tree, model, tips, factor, within_species_variance, cache, child)?;
            }

            let mut acc: Option<(DVector<f64>, f64, f64)> = None;
            for &child in tree.children(node) {
                let slot = cache.active(child);
                let contrast = DVector::from_iterator(k, self.buffers.contrasts(slot, child).iter().copied());
                let variance = model.branch_time(child, tree.branch_length(child)) + self.buffers.uncertainty(slot, child);
                let partial = self.buffers.partials(slot, child)[0];

                acc = Some(match acc {
                    None => (contrast, variance, partial),
                    Some((c_acc, v_acc, p_acc)) => {
                        let total = v_acc + variance;
                        let raw = &c_acc - &contrast;
                        let term = factor.ln_density(&raw, &DVector::zeros(k), total.sqrt());
                        let merged = (&c_acc * variance + &contrast * v_acc) / total;
                        (merged, v_acc * variance / total, p_acc + partial + term)
                    }
                });
            }

            if let Some((contrast, variance, partial)) = acc {
                let mut partials = vec![0.0; k];
                if let Some(first) = partials.first_mut() {
                    *first = partial;
                }
                self.buffers
                    .store(cache.active(node), node, contrast.as_slice(), &partials, variance);
            }
        }

        cache.mark_clean(node);
        Ok(())
    }

    fn initialize_tip(
        &mut self,
        tips: &TipObservations,
        factor: &Factorized,
        within_species_variance: Option<f64>,
        slot: usize,
        tip: usize,
    ) -> Result<()> {
        let k = tips.n_sites();
        let n = tips.n_samples(tip);
        let mean = DVector::from_iterator(k, (0..k).map(|t| tips.value(tip, t)));
        let mut partials = vec![0.0; k];
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
                let scatter: f64 = samples
                    .rows()
                    .into_iter()
                    .map(|row| {
                        let x = DVector::from_iterator(k, row.iter().copied());
                        factor.ln_density(&x, &mean, v.sqrt())
                    })
                    .sum();
                // ln N(mean; mu, (v / n) R) is carried by the pruning above the tip
                let normaliser = 0.5 * (k as f64 * (2.0 * std::f64::consts::PI * uncertainty).ln() + factor.log_det);
                if let Some(first) = partials.first_mut() {
                    *first = scatter + normaliser;
                }
            }
        }

        self.buffers.store(slot, tip, mean.as_slice(), &partials, uncertainty);
        Ok(())
    }
}
