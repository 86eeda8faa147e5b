//! Phylogenetic trait processes: one likelihood core plus its cache.
//!
//! A [`PhyloProcess`] owns the tree, the covariance model, the observed
//! matrix and the cache controller of one model variant. The MCMC driver
//! mutates parameters through [`PhyloProcess::model_mut`] or
//! [`PhyloProcess::tree_mut`], announces the change with
//! [`PhyloProcess::touch`], evaluates, and then calls either
//! [`PhyloProcess::keep`] or [`PhyloProcess::restore`].

pub mod simulation;

use nalgebra::DMatrix;
use tracing::{debug, instrument, trace};

use crate::cache::CacheController;
use crate::covariance::CovarianceModel;
use crate::error::{Result, TraitError};
use crate::multivariate::MultivariatePruning;
use crate::mvn::{CovarianceKind, MvnCore};
use crate::observations::TipObservations;
use crate::pruning::{BranchKernel, ContrastPruning, RootTreatment};
use crate::three_point::ThreePoint;
use crate::trait_matrix::TraitMatrix;
use crate::tree::{Tree, TreeChangeKind};

/// Closed set of continuous-trait models.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessVariant {
    BrownianMvn,
    BrownianReml,
    OrnsteinUhlenbeckMvn,
    OrnsteinUhlenbeckEve,
    OrnsteinUhlenbeckReml,
    OrnsteinUhlenbeckThreePoint,
    /// Several individuals per species, tips named by species.
    MultiSampleBrownianReml { within_species_variance: f64 },
    MultiSampleBrownianMvn { within_species_variance: f64 },
    MultiSampleOrnsteinUhlenbeckReml { within_species_variance: f64 },
    MultiSampleOrnsteinUhlenbeckMvn { within_species_variance: f64 },
    /// Correlated traits; every site is one trait of the `k × k` rate matrix.
    MultivariateBrownianReml { rate_matrix: DMatrix<f64> },
    /// Correlated traits measured on several individuals per species; an
    /// individual deviates from its species by `within_species_variance * R`.
    MultivariateMultiSampleBrownianReml {
        rate_matrix: DMatrix<f64>,
        within_species_variance: f64,
    },
}

impl ProcessVariant {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BrownianMvn => "BM-MVN",
            Self::BrownianReml => "BM-REML",
            Self::OrnsteinUhlenbeckMvn => "OU-MVN",
            Self::OrnsteinUhlenbeckEve => "OU-EVE",
            Self::OrnsteinUhlenbeckReml => "OU-REML",
            Self::OrnsteinUhlenbeckThreePoint => "OU-3P",
            Self::MultiSampleBrownianReml { .. } => "multi-sample BM-REML",
            Self::MultiSampleBrownianMvn { .. } => "multi-sample BM-MVN",
            Self::MultiSampleOrnsteinUhlenbeckReml { .. } => "multi-sample OU-REML",
            Self::MultiSampleOrnsteinUhlenbeckMvn { .. } => "multi-sample OU-MVN",
            Self::MultivariateBrownianReml { .. } => "multivariate BM-REML",
            Self::MultivariateMultiSampleBrownianReml { .. } => "multivariate multi-sample BM-REML",
        }
    }

    pub fn within_species_variance(&self) -> Option<f64> {
        match self {
            Self::MultiSampleBrownianReml { within_species_variance }
            | Self::MultiSampleBrownianMvn { within_species_variance }
            | Self::MultiSampleOrnsteinUhlenbeckReml { within_species_variance }
            | Self::MultiSampleOrnsteinUhlenbeckMvn { within_species_variance }
            | Self::MultivariateMultiSampleBrownianReml {
                within_species_variance, ..
            } => Some(*within_species_variance),
            _ => None,
        }
    }

    pub fn is_multi_sample(&self) -> bool {
        self.within_species_variance().is_some()
    }

    pub fn rate_matrix(&self) -> Option<&DMatrix<f64>> {
        match self {
            Self::MultivariateBrownianReml { rate_matrix }
            | Self::MultivariateMultiSampleBrownianReml { rate_matrix, .. } => Some(rate_matrix),
            _ => None,
        }
    }

    /// Whether branches follow an OU rather than a Brownian kernel.
    pub fn is_ornstein_uhlenbeck(&self) -> bool {
        matches!(
            self,
            Self::OrnsteinUhlenbeckMvn
                | Self::OrnsteinUhlenbeckEve
                | Self::OrnsteinUhlenbeckReml
                | Self::OrnsteinUhlenbeckThreePoint
                | Self::MultiSampleOrnsteinUhlenbeckReml { .. }
                | Self::MultiSampleOrnsteinUhlenbeckMvn { .. }
        )
    }
}

impl std::fmt::Display for ProcessVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which parameter a `touch`, `keep` or `restore` refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parameter {
    /// The whole sigma vector (or the homogeneous rate).
    Sigma,
    /// Sigma of the branch above one node.
    SigmaElement(usize),
    Alpha,
    AlphaElement(usize),
    Theta,
    ThetaElement(usize),
    SiteRates,
    RootState,
    WithinSpeciesVariance,
    RateMatrix,
    /// Branch lengths or topology; the tree's pending events say where.
    Tree,
}

/// Process settings.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Number of included characters evaluated (traits, for the multivariate variant)
    pub num_sites: usize,
    /// Site count from which per-site work is spread over the rayon pool
    pub parallel_site_threshold: usize,
    /// Root handling of the contrast-based variants
    pub root_treatment: RootTreatment,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            num_sites: 1,
            parallel_site_threshold: 64,
            root_treatment: RootTreatment::Fixed,
        }
    }
}

#[derive(Clone, Debug)]
enum Core {
    Contrasts(ContrastPruning),
    Mvn(MvnCore),
    ThreePoint(ThreePoint),
    Multivariate(MultivariatePruning),
}

impl Core {
    fn new(variant: &ProcessVariant, config: &ProcessConfig, n_nodes: usize) -> Self {
        let n_sites = config.num_sites;
        let threshold = config.parallel_site_threshold;
        let contrasts = |kernel| {
            Core::Contrasts(ContrastPruning::new(kernel, config.root_treatment, n_nodes, n_sites, threshold))
        };
        match variant {
            ProcessVariant::BrownianMvn | ProcessVariant::MultiSampleBrownianMvn { .. } => {
                Core::Mvn(MvnCore::new(CovarianceKind::Brownian, threshold))
            }
            ProcessVariant::OrnsteinUhlenbeckMvn | ProcessVariant::MultiSampleOrnsteinUhlenbeckMvn { .. } => {
                Core::Mvn(MvnCore::new(CovarianceKind::OrnsteinUhlenbeck, threshold))
            }
            ProcessVariant::OrnsteinUhlenbeckEve => Core::Mvn(MvnCore::new(CovarianceKind::Eve, threshold)),
            ProcessVariant::BrownianReml | ProcessVariant::MultiSampleBrownianReml { .. } => {
                contrasts(BranchKernel::Brownian)
            }
            ProcessVariant::OrnsteinUhlenbeckReml | ProcessVariant::MultiSampleOrnsteinUhlenbeckReml { .. } => {
                contrasts(BranchKernel::OrnsteinUhlenbeck)
            }
            ProcessVariant::OrnsteinUhlenbeckThreePoint => Core::ThreePoint(ThreePoint::new(n_nodes, n_sites)),
            ProcessVariant::MultivariateBrownianReml { .. }
            | ProcessVariant::MultivariateMultiSampleBrownianReml { .. } => {
                Core::Multivariate(MultivariatePruning::new(config.root_treatment, n_nodes, n_sites))
            }
        }
    }

    fn resize(&mut self, n_nodes: usize, n_sites: usize) {
        match self {
            Core::Contrasts(core) => core.resize(n_nodes, n_sites),
            Core::Mvn(core) => core.reset(),
            Core::ThreePoint(core) => core.resize(n_nodes, n_sites),
            Core::Multivariate(core) => core.resize(n_nodes, n_sites),
        }
    }

    fn keep(&mut self) {
        match self {
            Core::Mvn(core) => core.keep(),
            Core::Multivariate(core) => core.keep(),
            Core::Contrasts(_) | Core::ThreePoint(_) => {}
        }
    }

    fn restore(&mut self) {
        match self {
            Core::Mvn(core) => core.restore(),
            Core::Multivariate(core) => core.restore(),
            Core::Contrasts(_) | Core::ThreePoint(_) => {}
        }
    }
}

/// A continuous-trait process attached to one tree.
#[derive(Clone, Debug)]
pub struct PhyloProcess {
    variant: ProcessVariant,
    model: CovarianceModel,
    tree: Tree,
    config: ProcessConfig,
    data: Option<TraitMatrix>,
    tips: Option<TipObservations>,
    cache: CacheController,
    core: Core,
}

impl PhyloProcess {
    /// Create a process and subscribe it to `tree`.
    ///
    /// # Arguments
    /// * `variant` - Model variant, carrying its own extra parameters
    /// * `tree` - Phylogeny; tip names must match the data's taxa (or species)
    /// * `model` - Branch and site parameters
    /// * `config` - Site count and evaluation settings
    pub fn new(variant: ProcessVariant, mut tree: Tree, model: CovarianceModel, config: ProcessConfig) -> Result<Self> {
        if config.num_sites == 0 {
            return Err(TraitError::invalid_input("a process needs at least one site"));
        }
        if let Some(rate_matrix) = variant.rate_matrix() {
            check_rate_matrix(rate_matrix, config.num_sites)?;
        }
        if let Some(v) = variant.within_species_variance() {
            check_within_species_variance(v)?;
        }
        let cache = CacheController::new(tree.n_nodes());
        tree.add_listener(cache.listener());
        let core = Core::new(&variant, &config, tree.n_nodes());
        debug!(variant = %variant, n_tips = tree.n_tips(), n_sites = config.num_sites, "process created");
        Ok(Self {
            variant,
            model,
            tree,
            config,
            data: None,
            tips: None,
            cache,
            core,
        })
    }

    /// Attach observed data and re-initialise every tip.
    pub fn set_value(&mut self, matrix: TraitMatrix) -> Result<()> {
        self.data = Some(matrix);
        self.reset_value()
    }

    /// Rebuild the tip observations from the attached data and flag the
    /// whole tree dirty.
    pub fn reset_value(&mut self) -> Result<()> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| TraitError::invalid_input("no observed data attached"))?;
        if self.tree.n_tips() < 2 {
            return Err(TraitError::invalid_input("a process needs at least two tips"));
        }
        let n_sites = self.config.num_sites;
        let tips = if self.variant.is_multi_sample() {
            TipObservations::multi_sample(&self.tree, data, n_sites)?
        } else {
            TipObservations::single_sample(&self.tree, data, n_sites)?
        };
        self.tips = Some(tips);
        self.cache.reset(self.tree.n_nodes());
        self.core.resize(self.tree.n_nodes(), n_sites);
        self.tree.clear_change_events();
        debug!(variant = %self.variant, n_sites, "tip values reset");
        Ok(())
    }

    /// Log-likelihood of the attached data, recomputing only dirty nodes.
    #[instrument(skip_all, fields(variant = %self.variant))]
    pub fn compute_ln_probability(&mut self) -> Result<f64> {
        if self.cache.ensure_subscribed(&mut self.tree) {
            debug!("tree replaced without notification; resubscribed");
            self.reset_value()?;
        }
        self.model.validate(self.tree.n_nodes(), self.config.num_sites)?;
        let tips = self
            .tips
            .as_ref()
            .ok_or_else(|| TraitError::invalid_input("no observed data attached"))?;

        let before = self.cache.recomputations();
        let within = self.variant.within_species_variance();
        let ln_l = match &mut self.core {
            Core::Contrasts(core) => core.compute(&self.tree, &self.model, tips, within, &mut self.cache),
            Core::Mvn(core) => core.compute(&self.tree, &self.model, tips, within, &mut self.cache),
            Core::ThreePoint(core) => core.compute(&self.tree, &self.model, tips, &mut self.cache),
            Core::Multivariate(core) => match self.variant.rate_matrix() {
                Some(rate_matrix) => core.compute(&self.tree, &self.model, tips, rate_matrix, within, &mut self.cache),
                None => Err(TraitError::invalid_parameter("multivariate core without a rate matrix")),
            },
        }?;
        debug!(recomputed = self.cache.recomputations() - before, ln_l, "evaluated");
        Ok(ln_l)
    }

    /// Announce that `parameter` changed since the last evaluation.
    ///
    /// Contrast-based variants flag only the nodes whose messages depend on
    /// the parameter. MVN variants rebuild the covariance unless only the
    /// mean moved. The three-point variant flags every node for any
    /// parameter: its transformed edges and tip weights depend on the tree
    /// height and on sigma, alpha and theta together.
    pub fn touch(&mut self, parameter: Parameter) {
        trace!(?parameter, "touch");
        let root = self.tree.root();
        match &mut self.core {
            Core::Mvn(core) => {
                match parameter {
                    Parameter::RootState | Parameter::Theta | Parameter::ThetaElement(_) | Parameter::SiteRates => {}
                    Parameter::Tree => {
                        self.tree.clear_change_events();
                        core.touch_covariance();
                    }
                    _ => core.touch_covariance(),
                }
                self.cache.flag_dirty(&self.tree, root);
                return;
            }
            Core::ThreePoint(_) => {
                self.tree.clear_change_events();
                self.cache.flag_all(&self.tree);
                return;
            }
            Core::Multivariate(core) if parameter == Parameter::RateMatrix => core.touch_rate_matrix(),
            Core::Multivariate(_) | Core::Contrasts(_) => {}
        }

        match parameter {
            Parameter::SigmaElement(node) | Parameter::AlphaElement(node) | Parameter::ThetaElement(node) => {
                self.flag_path(node)
            }
            Parameter::RootState => self.cache.flag_dirty(&self.tree, root),
            Parameter::Tree => self.flag_tree_events(),
            _ => self.cache.flag_all(&self.tree),
        }
    }

    /// Accept the proposal.
    pub fn keep(&mut self, parameter: Parameter) {
        trace!(?parameter, "keep");
        self.cache.keep();
        self.core.keep();
        self.tree.clear_change_events();
    }

    /// Reject the proposal: every touched node returns to its stored value.
    ///
    /// The caller restores the parameter value (or undoes the tree move)
    /// itself.
    pub fn restore(&mut self, parameter: Parameter) {
        trace!(?parameter, "restore");
        self.cache.restore();
        self.core.restore();
        self.tree.clear_change_events();
    }

    fn flag_path(&mut self, node: usize) {
        if node < self.tree.n_nodes() {
            self.cache.flag_dirty(&self.tree, node);
        } else {
            self.cache.flag_all(&self.tree);
        }
    }

    fn flag_tree_events(&mut self) {
        let events = self.tree.drain_change_events();
        if events.is_empty() {
            self.cache.flag_all(&self.tree);
            return;
        }
        for event in events {
            match event.kind {
                TreeChangeKind::BranchLength | TreeChangeKind::Topology => self.flag_path(event.node),
            }
        }
    }

    pub fn variant(&self) -> &ProcessVariant {
        &self.variant
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn model(&self) -> &CovarianceModel {
        &self.model
    }

    /// Mutable parameters; follow every change with [`touch`](Self::touch).
    pub fn model_mut(&mut self) -> &mut CovarianceModel {
        &mut self.model
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutable tree; follow branch-length or NNI edits with `touch(Parameter::Tree)`.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Replace the tree, moving the subscription and re-initialising tips.
    pub fn set_tree(&mut self, mut tree: Tree) -> Result<()> {
        self.tree.remove_listener(self.cache.listener());
        tree.add_listener(self.cache.listener());
        self.tree = tree;
        self.cache.reset(self.tree.n_nodes());
        self.core.resize(self.tree.n_nodes(), self.config.num_sites);
        if self.data.is_some() {
            self.reset_value()?;
        }
        Ok(())
    }

    pub fn data(&self) -> Option<&TraitMatrix> {
        self.data.as_ref()
    }

    pub fn set_within_species_variance(&mut self, value: f64) -> Result<()> {
        check_within_species_variance(value)?;
        let name = self.variant.name();
        match &mut self.variant {
            ProcessVariant::MultiSampleBrownianReml { within_species_variance }
            | ProcessVariant::MultiSampleBrownianMvn { within_species_variance }
            | ProcessVariant::MultiSampleOrnsteinUhlenbeckReml { within_species_variance }
            | ProcessVariant::MultiSampleOrnsteinUhlenbeckMvn { within_species_variance }
            | ProcessVariant::MultivariateMultiSampleBrownianReml {
                within_species_variance, ..
            } => {
                *within_species_variance = value;
                Ok(())
            }
            _ => Err(TraitError::invalid_parameter(format!("{} has no within-species variance", name))),
        }
    }

    pub fn set_rate_matrix(&mut self, value: DMatrix<f64>) -> Result<()> {
        check_rate_matrix(&value, self.config.num_sites)?;
        let name = self.variant.name();
        match &mut self.variant {
            ProcessVariant::MultivariateBrownianReml { rate_matrix }
            | ProcessVariant::MultivariateMultiSampleBrownianReml { rate_matrix, .. } => {
                *rate_matrix = value;
                Ok(())
            }
            _ => Err(TraitError::invalid_parameter(format!("{} has no rate matrix", name))),
        }
    }

    /// Total node recomputations so far.
    pub fn recomputations(&self) -> usize {
        self.cache.recomputations()
    }

    pub fn cache(&self) -> &CacheController {
        &self.cache
    }

    /// Stored contrast of a node for the contrast-based variants.
    pub fn node_contrast(&self, node: usize, site: usize) -> Option<f64> {
        if node >= self.tree.n_nodes() || site >= self.config.num_sites {
            return None;
        }
        match &self.core {
            Core::Contrasts(core) => Some(core.contrast(&self.cache, node, site)),
            Core::Multivariate(core) => Some(core.contrast(&self.cache, node)[site]),
            _ => None,
        }
    }

    /// Stored partial log-likelihood of a node for the univariate contrast variants.
    pub fn node_partial(&self, node: usize, site: usize) -> Option<f64> {
        match &self.core {
            Core::Contrasts(core) if node < self.tree.n_nodes() && site < self.config.num_sites => {
                Some(core.partial(&self.cache, node, site))
            }
            _ => None,
        }
    }

    /// Observation covariance (before site-rate scaling) of the MVN variants.
    pub fn covariance_matrix(&self) -> Result<DMatrix<f64>> {
        let tips = self
            .tips
            .as_ref()
            .ok_or_else(|| TraitError::invalid_input("no observed data attached"))?;
        match &self.core {
            Core::Mvn(core) => {
                core.covariance_matrix(&self.tree, &self.model, tips, self.variant.within_species_variance())
            }
            _ => Err(TraitError::invalid_input(format!(
                "{} does not build a covariance matrix",
                self.variant
            ))),
        }
    }
}

fn check_within_species_variance(v: f64) -> Result<()> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(TraitError::invalid_parameter(format!("within-species variance {}", v)))
    }
}

fn check_rate_matrix(rate_matrix: &DMatrix<f64>, n_traits: usize) -> Result<()> {
    if rate_matrix.shape() != (n_traits, n_traits) {
        return Err(TraitError::invalid_parameter(format!(
            "rate matrix is {}x{}, expected {}x{}",
            rate_matrix.nrows(),
            rate_matrix.ncols(),
            n_traits,
            n_traits
        )));
    }
    Ok(())
}
