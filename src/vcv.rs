//! Phylogenetic variance-covariance matrices over tips.
//!
//! Each builder returns a dense symmetric `n_tips × n_tips` matrix in tip
//! index order. Multi-sample data expands the tip matrix to individuals.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::covariance::{CovarianceModel, MIN_BRANCH_VARIANCE, OU_ALPHA_EPSILON};
use crate::observations::TipObservations;
use crate::tree::Tree;

/// Brownian covariance: each non-root node adds its branch time to every
/// pair of tips beneath it (the diagonal included).
pub fn brownian_covariance(tree: &Tree, model: &CovarianceModel) -> DMatrix<f64> {
    let mut cov = DMatrix::zeros(tree.n_tips(), tree.n_tips());

    fn visit(tree: &Tree, model: &CovarianceModel, node: usize, cov: &mut DMatrix<f64>) -> Vec<usize> {
        let below: Vec<usize> = if tree.is_tip(node) {
            vec![node]
        } else {
            tree.children(node)
                .iter()
                .flat_map(|&c| visit(tree, model, c, cov))
                .collect()
        };
        if !tree.is_root(node) {
            let v = model.branch_time(node, tree.branch_length(node));
            for &i in &below {
                for &j in &below {
                    cov[(i, j)] += v;
                }
            }
        }
        below
    }

    visit(tree, model, tree.root(), &mut cov);
    cov
}

/// Depth of the most recent common ancestor of every tip pair.
///
/// The diagonal holds each tip's own root-to-tip distance.
pub fn shared_depths(tree: &Tree) -> DMatrix<f64> {
    let depths = tree.depths();
    let mut shared = DMatrix::zeros(tree.n_tips(), tree.n_tips());
    for node in tree.post_order() {
        if tree.is_tip(node) {
            shared[(node, node)] = depths[node];
            continue;
        }
        let groups: Vec<Vec<usize>> = tree.children(node).iter().map(|&c| tree.tips_below(c)).collect();
        for (a, left) in groups.iter().enumerate() {
            for right in &groups[a + 1..] {
                for &i in left {
                    for &j in right {
                        shared[(i, j)] = depths[node];
                        shared[(j, i)] = depths[node];
                    }
                }
            }
        }
    }
    shared
}

/// Single-regime OU covariance with the root fixed:
/// `V_ij = sigma^2/(2 alpha) * exp(-alpha (d_i + d_j)) * (exp(2 alpha h_ij) - 1)`.
pub fn ou_covariance(tree: &Tree, sigma: f64, alpha: f64) -> DMatrix<f64> {
    let shared = shared_depths(tree);
    let n = tree.n_tips();
    let s2 = sigma * sigma;

    let pairs: Vec<(usize, usize)> = (0..n).flat_map(|i| (i..n).map(move |j| (i, j))).collect();
    let values: Vec<((usize, usize), f64)> = pairs
        .par_iter()
        .map(|&(i, j)| {
            let h = shared[(i, j)];
            let v = if alpha < OU_ALPHA_EPSILON {
                s2 * h
            } else {
                let (di, dj) = (shared[(i, i)], shared[(j, j)]);
                s2 / (2.0 * alpha) * (-alpha * (di + dj)).exp() * (2.0 * alpha * h).exp_m1()
            };
            ((i, j), v)
        })
        .collect();

    let mut cov = DMatrix::zeros(n, n);
    for ((i, j), v) in values {
        let v = if i == j { v.max(MIN_BRANCH_VARIANCE) } else { v };
        cov[(i, j)] = v;
        cov[(j, i)] = v;
    }
    cov
}

/// Expected tip values of a single-regime OU started at `root_state`.
pub fn ou_means(tree: &Tree, alpha: f64, theta: f64, root_state: f64) -> Vec<f64> {
    let depths = tree.depths();
    (0..tree.n_tips())
        .map(|tip| {
            if alpha < OU_ALPHA_EPSILON {
                root_state
            } else {
                theta + (root_state - theta) * (-alpha * depths[tip]).exp()
            }
        })
        .collect()
}

/// Branch-heterogeneous OU covariance built from recursive node variances.
///
/// `var_c = v_branch(c) + var_p * exp(-2 alpha_c t_c)`; tips `i`, `j` with
/// MRCA `m` covary by `var_m * exp(-(L_i - L_m) - (L_j - L_m))`, where `L`
/// is the cumulative `alpha * t` from the root.
pub fn eve_covariance(tree: &Tree, model: &CovarianceModel) -> DMatrix<f64> {
    let mut variance = vec![0.0; tree.n_nodes()];
    let mut decay = vec![0.0; tree.n_nodes()];
    for node in tree.pre_order() {
        if let Some(parent) = tree.parent(node) {
            let t = tree.branch_length(node);
            let alpha = model.branch_alpha(node);
            variance[node] = model.ou_branch_variance(node, t) + variance[parent] * (-2.0 * alpha * t).exp();
            decay[node] = decay[parent] + alpha * t;
        }
    }

    let n = tree.n_tips();
    let mut cov = DMatrix::zeros(n, n);
    for node in tree.post_order() {
        if tree.is_tip(node) {
            cov[(node, node)] = variance[node];
            continue;
        }
        let groups: Vec<Vec<usize>> = tree.children(node).iter().map(|&c| tree.tips_below(c)).collect();
        for (a, left) in groups.iter().enumerate() {
            for right in &groups[a + 1..] {
                for &i in left {
                    for &j in right {
                        let v = variance[node] * (-(decay[i] - decay[node]) - (decay[j] - decay[node])).exp();
                        cov[(i, j)] = v;
                        cov[(j, i)] = v;
                    }
                }
            }
        }
    }
    cov
}

/// Expected tip values of a branch-heterogeneous OU started at `root_state`.
pub fn eve_means(tree: &Tree, model: &CovarianceModel, root_state: f64) -> Vec<f64> {
    let mut mean = vec![0.0; tree.n_nodes()];
    for node in tree.pre_order() {
        mean[node] = match tree.parent(node) {
            None => root_state,
            Some(parent) => {
                let t = tree.branch_length(node);
                let theta = model.branch_theta(node);
                theta + (mean[parent] - theta) * (-model.branch_alpha(node) * t).exp()
            }
        };
    }
    mean.truncate(tree.n_tips());
    mean
}

/// Expand a tip covariance to one row per individual, adding
/// `within_species_variance` on each individual's own diagonal.
pub fn expand_to_individuals(
    cov: &DMatrix<f64>,
    tips: &TipObservations,
    within_species_variance: f64,
) -> DMatrix<f64> {
    let owner: Vec<usize> = (0..tips.n_tips())
        .flat_map(|tip| std::iter::repeat(tip).take(tips.n_samples(tip)))
        .collect();
    let n = owner.len();
    DMatrix::from_fn(n, n, |a, b| {
        let v = cov[(owner[a], owner[b])];
        if a == b {
            v + within_species_variance
        } else {
            v
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_matrix_close(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_brownian_covariance_scenario() {
        let tree = Tree::from_newick("((A:1,B:1):1,C:2);").unwrap();
        let model = CovarianceModel::brownian(1.0, 0.0);
        let cov = brownian_covariance(&tree, &model);
        let expected = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 2.0]);
        assert_matrix_close(&cov, &expected, 1e-15);
    }

    #[test]
    fn test_shared_depths() {
        let tree = Tree::from_newick("((A:1,B:2):0.5,C:2);").unwrap();
        let shared = shared_depths(&tree);
        assert!((shared[(0, 1)] - 0.5).abs() < 1e-15);
        assert!((shared[(1, 1)] - 2.5).abs() < 1e-15);
        assert_eq!(shared[(0, 2)], 0.0);
    }

    #[test]
    fn test_ou_zero_alpha_is_brownian() {
        let tree = Tree::from_newick("((A:1,B:2):0.5,C:2);").unwrap();
        let bm = brownian_covariance(&tree, &CovarianceModel::brownian(1.5, 0.0));
        let ou = ou_covariance(&tree, 1.5, 0.0);
        assert_matrix_close(&bm, &ou, 1e-12);
    }

    #[test]
    fn test_eve_matches_single_regime() {
        let tree = Tree::from_newick("(((A:1,B:1):0.7,C:1.7):0.4,D:2.1);").unwrap();
        let model = CovarianceModel::ornstein_uhlenbeck(1.2, 0.8, 0.3, -1.0);
        let eve = eve_covariance(&tree, &model);
        let closed = ou_covariance(&tree, 1.2, 0.8);
        assert_matrix_close(&eve, &closed, 1e-12);

        let means = eve_means(&tree, &model, -1.0);
        let expected = ou_means(&tree, 0.8, 0.3, -1.0);
        for (a, b) in means.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
