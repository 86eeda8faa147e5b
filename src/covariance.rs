//! Parameter resolution shared by every likelihood algorithm.
//!
//! A [`CovarianceModel`] answers "what is sigma / alpha / theta on this
//! branch" and "what is the rate of this site" without knowing whether the
//! underlying parameter is one scalar or a vector.

use crate::error::{Result, TraitError};

/// Floor applied to any branch variance that would otherwise be `<= 0`.
pub const MIN_BRANCH_VARIANCE: f64 = 1e-16;

/// Edge lengths at or below this are treated as zero by the three-point pass.
pub const ZERO_EDGE_EPSILON: f64 = MIN_BRANCH_VARIANCE;

/// Below this alpha the OU kernels fall back to Brownian motion.
pub const OU_ALPHA_EPSILON: f64 = 1e-10;

/// A scalar parameter that is either shared or given per element.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Homogeneous(f64),
    Heterogeneous(Vec<f64>),
}

impl Param {
    /// Value at `index`; homogeneous parameters ignore the index.
    ///
    /// Heterogeneous lookups assume the length was checked by
    /// [`CovarianceModel::validate`].
    pub fn value(&self, index: usize) -> f64 {
        match self {
            Param::Homogeneous(v) => *v,
            Param::Heterogeneous(values) => values[index],
        }
    }

    pub fn is_homogeneous(&self) -> bool {
        matches!(self, Param::Homogeneous(_))
    }

    fn check(&self, name: &str, expected: usize, lower: Option<f64>) -> Result<()> {
        let values: &[f64] = match self {
            Param::Homogeneous(v) => std::slice::from_ref(v),
            Param::Heterogeneous(values) => {
                if values.len() != expected {
                    return Err(TraitError::invalid_parameter(format!(
                        "{} has {} elements, expected {}",
                        name,
                        values.len(),
                        expected
                    )));
                }
                values
            }
        };
        for (i, &v) in values.iter().enumerate() {
            if !v.is_finite() || lower.is_some_and(|lo| v < lo) {
                return Err(TraitError::invalid_parameter(format!("{}[{}] = {}", name, i, v)));
            }
        }
        Ok(())
    }

    fn set_element(&mut self, name: &str, index: usize, value: f64) -> Result<()> {
        match self {
            Param::Heterogeneous(values) => {
                let len = values.len();
                let slot = values
                    .get_mut(index)
                    .ok_or_else(|| TraitError::out_of_range("parameter element", index, len))?;
                *slot = value;
                Ok(())
            }
            Param::Homogeneous(_) => Err(TraitError::invalid_parameter(format!(
                "{} is homogeneous; it has no element {}",
                name, index
            ))),
        }
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Homogeneous(v)
    }
}

impl From<Vec<f64>> for Param {
    fn from(v: Vec<f64>) -> Self {
        Param::Heterogeneous(v)
    }
}

/// Per-branch and per-site parameter lookups.
///
/// Branch vectors are indexed by node index and have one entry per node; the
/// root's entry is never read. Site vectors are indexed by included site.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceModel {
    sigma: Param,
    alpha: Param,
    theta: Param,
    site_rates: Param,
    root_state: Param,
}

impl Default for CovarianceModel {
    fn default() -> Self {
        Self {
            sigma: Param::Homogeneous(1.0),
            alpha: Param::Homogeneous(0.0),
            theta: Param::Homogeneous(0.0),
            site_rates: Param::Homogeneous(1.0),
            root_state: Param::Homogeneous(0.0),
        }
    }
}

impl CovarianceModel {
    /// Brownian motion with rate `sigma` and root value `root_state`.
    pub fn brownian(sigma: impl Into<Param>, root_state: impl Into<Param>) -> Self {
        Self {
            sigma: sigma.into(),
            root_state: root_state.into(),
            ..Self::default()
        }
    }

    /// Ornstein-Uhlenbeck with pull `alpha` toward `theta`.
    pub fn ornstein_uhlenbeck(
        sigma: impl Into<Param>,
        alpha: impl Into<Param>,
        theta: impl Into<Param>,
        root_state: impl Into<Param>,
    ) -> Self {
        Self {
            sigma: sigma.into(),
            alpha: alpha.into(),
            theta: theta.into(),
            root_state: root_state.into(),
            ..Self::default()
        }
    }

    pub fn with_site_rates(mut self, site_rates: impl Into<Param>) -> Self {
        self.site_rates = site_rates.into();
        self
    }

    pub fn sigma(&self) -> &Param {
        &self.sigma
    }

    pub fn alpha(&self) -> &Param {
        &self.alpha
    }

    pub fn theta(&self) -> &Param {
        &self.theta
    }

    pub fn site_rates(&self) -> &Param {
        &self.site_rates
    }

    pub fn root_states(&self) -> &Param {
        &self.root_state
    }

    pub fn set_sigma(&mut self, sigma: impl Into<Param>) {
        self.sigma = sigma.into();
    }

    pub fn set_alpha(&mut self, alpha: impl Into<Param>) {
        self.alpha = alpha.into();
    }

    pub fn set_theta(&mut self, theta: impl Into<Param>) {
        self.theta = theta.into();
    }

    pub fn set_site_rates(&mut self, rates: impl Into<Param>) {
        self.site_rates = rates.into();
    }

    pub fn set_root_state(&mut self, root_state: impl Into<Param>) {
        self.root_state = root_state.into();
    }

    pub fn set_sigma_element(&mut self, node: usize, value: f64) -> Result<()> {
        self.sigma.set_element("sigma", node, value)
    }

    pub fn set_alpha_element(&mut self, node: usize, value: f64) -> Result<()> {
        self.alpha.set_element("alpha", node, value)
    }

    pub fn set_theta_element(&mut self, node: usize, value: f64) -> Result<()> {
        self.theta.set_element("theta", node, value)
    }

    pub fn set_root_state_element(&mut self, site: usize, value: f64) -> Result<()> {
        self.root_state.set_element("root state", site, value)
    }

    /// Check vector lengths against the tree and site count, and value domains.
    pub fn validate(&self, n_nodes: usize, n_sites: usize) -> Result<()> {
        self.sigma.check("sigma", n_nodes, Some(0.0))?;
        self.alpha.check("alpha", n_nodes, Some(0.0))?;
        self.theta.check("theta", n_nodes, None)?;
        self.site_rates.check("site rates", n_sites, Some(0.0))?;
        self.root_state.check("root state", n_sites, None)
    }

    /// Branch variance `length * sigma^2`, floor-clamped to [`MIN_BRANCH_VARIANCE`].
    pub fn branch_time(&self, node: usize, branch_length: f64) -> f64 {
        let sigma = self.branch_sigma(node);
        let t = branch_length * sigma * sigma;
        if t > 0.0 {
            t
        } else {
            MIN_BRANCH_VARIANCE
        }
    }

    /// OU transition variance over a branch of length `t`.
    ///
    /// `sigma^2 / (2 alpha) * (1 - exp(-2 alpha t))`, or `sigma^2 t` when alpha
    /// vanishes. Clamped like [`branch_time`](Self::branch_time).
    pub fn ou_branch_variance(&self, node: usize, t: f64) -> f64 {
        let alpha = self.branch_alpha(node);
        if alpha < OU_ALPHA_EPSILON {
            return self.branch_time(node, t);
        }
        let sigma = self.branch_sigma(node);
        let v = sigma * sigma / (2.0 * alpha) * -(-2.0 * alpha * t).exp_m1();
        if v > 0.0 {
            v
        } else {
            MIN_BRANCH_VARIANCE
        }
    }

    pub fn branch_sigma(&self, node: usize) -> f64 {
        self.sigma.value(node)
    }

    pub fn branch_alpha(&self, node: usize) -> f64 {
        self.alpha.value(node)
    }

    pub fn branch_theta(&self, node: usize) -> f64 {
        self.theta.value(node)
    }

    pub fn site_rate(&self, site: usize) -> f64 {
        self.site_rates.value(site)
    }

    pub fn root_state(&self, site: usize) -> f64 {
        self.root_state.value(site)
    }

    /// The single (sigma, alpha, theta) triple of a one-regime OU model.
    pub fn single_regime(&self) -> Result<(f64, f64, f64)> {
        match (&self.sigma, &self.alpha, &self.theta) {
            (Param::Homogeneous(s), Param::Homogeneous(a), Param::Homogeneous(t)) => Ok((*s, *a, *t)),
            _ => Err(TraitError::invalid_parameter(
                "single-regime OU needs homogeneous sigma, alpha and theta",
            )),
        }
    }
}
