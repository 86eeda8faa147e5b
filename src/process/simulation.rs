//! Forward simulation of trait data down the tree.
//!
//! One preorder pass draws every node from its parent through the variant's
//! branch kernel; multi-sample variants then add one within-species draw per
//! individual. Replicates run in parallel, each with its own seeded RNG.

use nalgebra::{Cholesky, DVector};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use tracing::debug;

use super::PhyloProcess;
use crate::error::{Result, TraitError};
use crate::trait_matrix::{TaxonData, TraitMatrix};

impl PhyloProcess {
    /// Draw one trait matrix from the process.
    ///
    /// Tips are named after the tree. Multi-sample variants reuse the
    /// individuals (names and species) of the attached data, or draw one
    /// individual per species when no data is attached.
    pub fn simulate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<TraitMatrix> {
        let tree = &self.tree;
        let model = &self.model;
        let n_sites = self.config.num_sites;
        model.validate(tree.n_nodes(), n_sites)?;

        let factor = match self.variant.rate_matrix() {
            Some(rate_matrix) => Some(
                Cholesky::new(rate_matrix.clone())
                    .ok_or_else(|| TraitError::singular("rate matrix is not positive definite"))?
                    .l(),
            ),
            None => None,
        };
        let ornstein_uhlenbeck = self.variant.is_ornstein_uhlenbeck();

        let mut values = Array2::zeros((tree.n_nodes(), n_sites));
        for node in tree.pre_order() {
            let Some(parent) = tree.parent(node) else {
                for site in 0..n_sites {
                    values[[node, site]] = model.root_state(site);
                }
                continue;
            };
            let t = tree.branch_length(node);

            if let Some(l) = &factor {
                let z = DVector::from_iterator(n_sites, (0..n_sites).map(|_| standard_normal(rng)));
                let step = l * z * model.branch_time(node, t).sqrt();
                for site in 0..n_sites {
                    values[[node, site]] = values[[parent, site]] + step[site];
                }
                continue;
            }

            for site in 0..n_sites {
                let rate = model.site_rate(site);
                let start = values[[parent, site]];
                let (mean, variance) = if ornstein_uhlenbeck {
                    let decay = (-model.branch_alpha(node) * t).exp();
                    let theta = model.branch_theta(node);
                    (start * decay + theta * (1.0 - decay), model.ou_branch_variance(node, t))
                } else {
                    (start, model.branch_time(node, t))
                };
                values[[node, site]] = mean + variance.sqrt() * rate * standard_normal(rng);
            }
        }

        let mut matrix = TraitMatrix::new();
        match self.variant.within_species_variance() {
            None => {
                for tip in 0..tree.n_tips() {
                    let name = tip_label(tree, tip)?;
                    matrix.add_taxon_data(TaxonData::new(name, values.row(tip).to_vec()))?;
                }
            }
            Some(within) => {
                let sd = within.sqrt();
                for tip in 0..tree.n_tips() {
                    let species = tip_label(tree, tip)?;
                    let individuals: Vec<String> = match &self.data {
                        Some(data) => data
                            .taxa_of_species(species)
                            .into_iter()
                            .map(|row| data.taxon_data(row).map(|d| d.name().to_string()))
                            .collect::<Result<_>>()?,
                        None => vec![species.to_string()],
                    };
                    if individuals.is_empty() {
                        return Err(TraitError::taxon_not_found(species));
                    }
                    for name in individuals {
                        let row: Vec<f64> = match &factor {
                            Some(l) => {
                                let z = DVector::from_iterator(n_sites, (0..n_sites).map(|_| standard_normal(rng)));
                                let scatter = l * z * sd;
                                (0..n_sites).map(|site| values[[tip, site]] + scatter[site]).collect()
                            }
                            None => (0..n_sites)
                                .map(|site| values[[tip, site]] + sd * model.site_rate(site) * standard_normal(rng))
                                .collect(),
                        };
                        matrix.add_taxon_data(TaxonData::new(name.as_str(), row))?;
                        matrix.set_species(&name, species)?;
                    }
                }
            }
        }
        Ok(matrix)
    }

    /// Simulate `n_replicates` matrices in parallel.
    ///
    /// # Arguments
    /// * `n_replicates` - Number of independent draws
    /// * `seed` - Base RNG seed (each replicate gets seed + replicate_index)
    pub fn simulate_replicates(&self, n_replicates: usize, seed: u64) -> Result<Vec<TraitMatrix>> {
        debug!(n_replicates, seed, variant = %self.variant, "simulating replicates");
        (0..n_replicates)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                self.simulate(&mut rng)
            })
            .collect()
    }

    /// Replace the attached data with a fresh draw.
    pub fn redraw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let matrix = self.simulate(rng)?;
        self.set_value(matrix)
    }
}

fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    StandardNormal.sample(rng)
}

fn tip_label(tree: &crate::tree::Tree, tip: usize) -> Result<&str> {
    tree.tip_name(tip)
        .ok_or_else(|| TraitError::invalid_input(format!("tip {} has no name", tip)))
}
