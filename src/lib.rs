//! Continuous-trait likelihoods on phylogenies for MCMC samplers.
//!
//! Brownian motion and Ornstein-Uhlenbeck models are scored either on the
//! full tip covariance (MVN), by contrast pruning (REML) or by the
//! three-point recursion. Every variant shares the same incremental
//! touch / compute / keep / restore lifecycle, so a proposal only pays for
//! the nodes whose values actually changed.

pub mod cache;
pub mod covariance;
pub mod error;
pub mod multivariate;
pub mod mvn;
pub mod observations;
pub mod process;
pub mod pruning;
pub mod three_point;
pub mod trait_matrix;
pub mod tree;
pub mod vcv;

pub use cache::{CacheController, DoubleBuffer, NodeBuffers};
pub use covariance::{CovarianceModel, Param, MIN_BRANCH_VARIANCE, OU_ALPHA_EPSILON, ZERO_EDGE_EPSILON};
pub use error::{Result, TraitError};
pub use observations::TipObservations;
pub use process::{Parameter, PhyloProcess, ProcessConfig, ProcessVariant};
pub use pruning::{BranchKernel, RootTreatment};
pub use trait_matrix::{TaxonData, TraitMatrix};
pub use tree::{ListenerId, Tree, TreeChangeEvent, TreeChangeKind};
