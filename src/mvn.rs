//! Direct multivariate-normal likelihood on the full tip covariance.
//!
//! Per site, the observed tip values are scored against
//! `Normal(mean, siteRate^2 * V)` in the precision parametrisation. The
//! covariance factorisation is double-buffered so a rejected proposal gets
//! the previous matrix back without refactoring it.

use nalgebra::{Cholesky, DMatrix, DVector};
use rayon::prelude::*;
use tracing::debug;

use crate::cache::{CacheController, DoubleBuffer};
use crate::covariance::CovarianceModel;
use crate::error::{Result, TraitError};
use crate::observations::TipObservations;
use crate::tree::Tree;
use crate::vcv;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Which process generated the tip covariance and mean.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CovarianceKind {
    /// Brownian motion: shared branch time, mean = root state.
    Brownian,
    /// One global OU regime, closed-form covariance.
    OrnsteinUhlenbeck,
    /// Branch-heterogeneous OU, recursive variances.
    Eve,
}

/// Precision matrix and log-determinant of one covariance.
#[derive(Clone, Debug)]
pub struct Factorized {
    pub precision: DMatrix<f64>,
    pub log_det: f64,
}

impl Factorized {
    /// Factorise a symmetric positive-definite matrix.
    pub fn new(cov: DMatrix<f64>) -> Result<Self> {
        let n = cov.nrows();
        if cov.iter().any(|v| !v.is_finite()) {
            return Err(TraitError::singular("covariance has non-finite entries"));
        }
        let chol = Cholesky::new(cov)
            .ok_or_else(|| TraitError::singular(format!("{}x{} covariance is not positive definite", n, n)))?;
        let log_det = 2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        Ok(Self {
            precision: chol.inverse(),
            log_det,
        })
    }

    /// `ln N(x; mean, scale^2 * V)`.
    pub fn ln_density(&self, x: &DVector<f64>, mean: &DVector<f64>, scale: f64) -> f64 {
        let n = x.len() as f64;
        let d = x - mean;
        let q = d.dot(&(&self.precision * &d));
        -0.5 * (n * LN_2PI + self.log_det + 2.0 * n * scale.ln() + q / (scale * scale))
    }
}

#[derive(Clone, Debug)]
pub struct MvnCore {
    kind: CovarianceKind,
    covariance: DoubleBuffer<Factorized>,
    root_ln_likelihood: [f64; 2],
    parallel_threshold: usize,
    rebuilds: usize,
}

impl MvnCore {
    pub fn new(kind: CovarianceKind, parallel_threshold: usize) -> Self {
        Self {
            kind,
            covariance: DoubleBuffer::default(),
            root_ln_likelihood: [0.0; 2],
            parallel_threshold,
            rebuilds: 0,
        }
    }

    pub fn kind(&self) -> CovarianceKind {
        self.kind
    }

    /// Drop both covariance slots (new tree or data).
    pub fn reset(&mut self) {
        self.covariance.clear();
    }

    /// The covariance depends on the touched parameter: rebuild it next time.
    pub fn touch_covariance(&mut self) {
        self.covariance.touch();
    }

    pub fn keep(&mut self) {
        self.covariance.keep();
    }

    pub fn restore(&mut self) {
        self.covariance.restore();
    }

    /// Number of covariance factorisations performed.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    /// Covariance over observation units (tips, or individuals when
    /// `within_species_variance` is given), before site-rate scaling.
    pub fn covariance_matrix(
        &self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        within_species_variance: Option<f64>,
    ) -> Result<DMatrix<f64>> {
        let cov = match self.kind {
            CovarianceKind::Brownian => vcv::brownian_covariance(tree, model),
            CovarianceKind::OrnsteinUhlenbeck => {
                let (sigma, alpha, _) = model.single_regime()?;
                vcv::ou_covariance(tree, sigma, alpha)
            }
            CovarianceKind::Eve => vcv::eve_covariance(tree, model),
        };
        Ok(match within_species_variance {
            Some(v) => vcv::expand_to_individuals(&cov, tips, v),
            None => cov,
        })
    }

    /// Expected value of every observation unit at one site.
    pub fn mean_vector(
        &self,
        tree: &Tree,
        model: &CovarianceModel,
        tips: &TipObservations,
        multi_sample: bool,
        site: usize,
    ) -> Result<DVector<f64>> {
        let root_state = model.root_state(site);
        let tip_means = match self.kind {
            CovarianceKind::Brownian => vec![root_state; tree.n_tips()],
            CovarianceKind::OrnsteinUhlenbeck => {
                let (_, alpha, theta) = model.single_regime()?;
                vcv::ou_means(tree, alpha, theta, root_state)
            }
            CovarianceKind::Eve => vcv::eve_means(tree, model, root_state),
        };
        Ok(if multi_sample {
            DVector::from_iterator(
                tips.n_individuals(),
                (0..tips.n_tips()).flat_map(|tip| std::iter::repeat(tip_means[tip]).take(tips.n_samples(tip))),
            )
        } else {
            DVector::from_vec(tip_means)
        })
    }

    /// Log-likelihood summed over sites.
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
        if let Some(v) = within_species_variance {
            if v < 0.0 {
                return Err(TraitError::invalid_parameter(format!("within-species variance {}", v)));
            }
        }

        if self.covariance.active().is_none() {
            let cov = self.covariance_matrix(tree, model, tips, within_species_variance)?;
            self.covariance.set_active(Factorized::new(cov)?);
            self.rebuilds += 1;
            debug!(rebuilds = self.rebuilds, "phylogenetic covariance rebuilt");
        }
        let factor = self
            .covariance
            .active()
            .ok_or_else(|| TraitError::singular("covariance unavailable"))?;

        let multi_sample = within_species_variance.is_some();
        let n_sites = tips.n_sites();
        let mut observations = Vec::with_capacity(n_sites);
        let mut means = Vec::with_capacity(n_sites);
        for site in 0..n_sites {
            observations.push(observation_vector(tips, multi_sample, site));
            means.push(self.mean_vector(tree, model, tips, multi_sample, site)?);
        }

        let per_site = |site: usize| factor.ln_density(&observations[site], &means[site], model.site_rate(site));
        let ln_l: f64 = if n_sites >= self.parallel_threshold {
            (0..n_sites).into_par_iter().map(per_site).sum()
        } else {
            (0..n_sites).map(per_site).sum()
        };

        for node in tree.post_order() {
            if cache.is_dirty(node) {
                cache.mark_clean(node);
            }
        }
        self.root_ln_likelihood[cache.active(root)] = ln_l;
        Ok(ln_l)
    }
}

fn observation_vector(tips: &TipObservations, multi_sample: bool, site: usize) -> DVector<f64> {
    if multi_sample {
        DVector::from_iterator(
            tips.n_individuals(),
            (0..tips.n_tips()).flat_map(|tip| tips.samples(tip).column(site).to_vec()),
        )
    } else {
        DVector::from_iterator(tips.n_tips(), (0..tips.n_tips()).map(|tip| tips.value(tip, site)))
    }
}
