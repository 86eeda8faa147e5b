//! Tip observations resolved against a tree.
//!
//! Maps every tip of the tree to its rows of the trait matrix through the
//! exclusion-aware site index map. Single-sample data has exactly one row per
//! tip; multi-sample data groups individuals by species label.

use ndarray::Array2;

use crate::error::{Result, TraitError};
use crate::trait_matrix::{TaxonData, TraitMatrix};
use crate::tree::Tree;

#[derive(Clone, Debug)]
pub struct TipObservations {
    site_map: Vec<usize>,
    means: Array2<f64>,
    samples: Vec<Array2<f64>>,
}

impl TipObservations {
    /// One matrix row per tip, matched by tip name.
    pub fn single_sample(tree: &Tree, matrix: &TraitMatrix, n_sites: usize) -> Result<Self> {
        let site_map = site_index_map(matrix, n_sites)?;
        let mut means = Array2::zeros((tree.n_tips(), n_sites));
        let mut samples = Vec::with_capacity(tree.n_tips());
        for tip in 0..tree.n_tips() {
            let name = tip_name(tree, tip)?;
            let row = matrix
                .taxon_index(name)
                .filter(|&i| !matrix.is_taxon_excluded(i))
                .ok_or_else(|| TraitError::taxon_not_found(name))?;
            let data = matrix.taxon_data(row)?;
            let mut individual = Array2::zeros((1, n_sites));
            for (site, &character) in site_map.iter().enumerate() {
                let value = finite_character(data, character)?;
                means[[tip, site]] = value;
                individual[[0, site]] = value;
            }
            samples.push(individual);
        }
        Ok(Self {
            site_map,
            means,
            samples,
        })
    }

    /// All included individuals of the tip's species, matched by species label.
    pub fn multi_sample(tree: &Tree, matrix: &TraitMatrix, n_sites: usize) -> Result<Self> {
        let site_map = site_index_map(matrix, n_sites)?;
        let mut means = Array2::zeros((tree.n_tips(), n_sites));
        let mut samples = Vec::with_capacity(tree.n_tips());
        for tip in 0..tree.n_tips() {
            let species = tip_name(tree, tip)?;
            let members = matrix.taxa_of_species(species);
            if members.is_empty() {
                return Err(TraitError::taxon_not_found(species));
            }
            let mut individuals = Array2::zeros((members.len(), n_sites));
            for (k, &row) in members.iter().enumerate() {
                let data = matrix.taxon_data(row)?;
                for (site, &character) in site_map.iter().enumerate() {
                    individuals[[k, site]] = finite_character(data, character)?;
                }
            }
            for site in 0..n_sites {
                means[[tip, site]] = individuals.column(site).sum() / members.len() as f64;
            }
            samples.push(individuals);
        }
        Ok(Self {
            site_map,
            means,
            samples,
        })
    }

    pub fn n_tips(&self) -> usize {
        self.means.nrows()
    }

    pub fn n_sites(&self) -> usize {
        self.means.ncols()
    }

    /// Matrix character index behind each site.
    pub fn site_map(&self) -> &[usize] {
        &self.site_map
    }

    /// Observed value (or species mean) of a tip.
    pub fn value(&self, tip: usize, site: usize) -> f64 {
        self.means[[tip, site]]
    }

    pub fn n_samples(&self, tip: usize) -> usize {
        self.samples[tip].nrows()
    }

    /// Individual values of a tip as `[individual, site]`.
    pub fn samples(&self, tip: usize) -> &Array2<f64> {
        &self.samples[tip]
    }

    pub fn n_individuals(&self) -> usize {
        self.samples.iter().map(Array2::nrows).sum()
    }
}

/// First `n_sites` included character indices, skipping excluded ones.
pub fn site_index_map(matrix: &TraitMatrix, n_sites: usize) -> Result<Vec<usize>> {
    let included = matrix.included_character_indices()?;
    if included.len() < n_sites {
        return Err(TraitError::InsufficientData {
            requested: n_sites,
            available: included.len(),
        });
    }
    Ok(included.into_iter().take(n_sites).collect())
}

fn finite_character(data: &TaxonData, character: usize) -> Result<f64> {
    let value = data.character(character)?;
    if !value.is_finite() {
        return Err(TraitError::invalid_input(format!(
            "taxon '{}' has a non-finite value ({}) for character {}",
            data.name(),
            value,
            character
        )));
    }
    Ok(value)
}

fn tip_name(tree: &Tree, tip: usize) -> Result<&str> {
    tree.tip_name(tip)
        .ok_or_else(|| TraitError::invalid_input(format!("tip {} has no name", tip)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_map_skips_excluded() {
        let mut m = TraitMatrix::from_rows(vec![("A", vec![0.0, 1.0, 2.0]), ("B", vec![3.0, 4.0, 5.0])]).unwrap();
        m.exclude_character(0).unwrap();
        assert_eq!(site_index_map(&m, 2).unwrap(), vec![1, 2]);
        assert!(matches!(
            site_index_map(&m, 3),
            Err(TraitError::InsufficientData { requested: 3, available: 2 })
        ));
    }

    #[test]
    fn test_single_sample_by_name() {
        let tree = Tree::from_newick("(B:1,A:1);").unwrap();
        let mut m = TraitMatrix::from_rows(vec![("A", vec![0.0, 1.0]), ("B", vec![3.0, 4.0])]).unwrap();
        m.exclude_character(0).unwrap();
        let obs = TipObservations::single_sample(&tree, &m, 1).unwrap();
        assert_eq!(obs.value(0, 0), 4.0);
        assert_eq!(obs.value(1, 0), 1.0);
        assert_eq!(obs.site_map(), &[1]);

        let missing = TraitMatrix::from_rows(vec![("A", vec![0.0])]).unwrap();
        assert!(matches!(
            TipObservations::single_sample(&tree, &missing, 1),
            Err(TraitError::TaxonNotFound { .. })
        ));
    }

    #[test]
    fn test_multi_sample_grouping() {
        let tree = Tree::from_newick("(A:1,B:1);").unwrap();
        let mut m = TraitMatrix::from_rows(vec![
            ("a1", vec![1.0]),
            ("b1", vec![3.0]),
            ("a2", vec![1.2]),
        ])
        .unwrap();
        m.set_species("a1", "A").unwrap();
        m.set_species("a2", "A").unwrap();
        m.set_species("b1", "B").unwrap();

        let obs = TipObservations::multi_sample(&tree, &m, 1).unwrap();
        assert_eq!(obs.n_samples(0), 2);
        assert_eq!(obs.n_samples(1), 1);
        assert!((obs.value(0, 0) - 1.1).abs() < 1e-12);
        assert_eq!(obs.n_individuals(), 3);
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let tree = Tree::from_newick("(A:1,B:1);").unwrap();
        let m = TraitMatrix::from_rows(vec![("A", vec![f64::NAN]), ("B", vec![1.0])]).unwrap();
        assert!(matches!(
            TipObservations::single_sample(&tree, &m, 1),
            Err(TraitError::InvalidInput { .. })
        ));

        let mut m = TraitMatrix::from_rows(vec![
            ("a1", vec![1.0]),
            ("a2", vec![f64::INFINITY]),
            ("b1", vec![3.0]),
        ])
        .unwrap();
        m.set_species("a1", "A").unwrap();
        m.set_species("a2", "A").unwrap();
        m.set_species("b1", "B").unwrap();
        assert!(matches!(
            TipObservations::multi_sample(&tree, &m, 1),
            Err(TraitError::InvalidInput { .. })
        ));
    }
}
