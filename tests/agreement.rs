//! Different algorithms for the same model must give the same likelihood.

mod common;

use common::{assert_close, evaluate, init_tracing, matrix, matrix_for, process};
use nalgebra::{DMatrix, DVector};
use phylotrait::mvn::Factorized;
use phylotrait::vcv;
use phylotrait::{CovarianceModel, ProcessVariant, TraitMatrix, Tree};

const ULTRAMETRIC: &str = "(((A:1,B:1):0.5,C:1.5):0.5,(D:0.8,E:0.8):1.2);";
const NON_ULTRAMETRIC: &str = "((A:0.3,B:1.2):0.8,(C:0.5,(D:0.9,E:0.2):0.4):0.6);";
const VALUES: [f64; 10] = [0.4, -1.1, 2.3, 0.0, 0.7, -0.2, 1.5, -0.9, 0.3, 1.9];

const SPECIES_TREE: &str = "((A:1,B:0.6):0.5,C:1.2);";

/// Two traits on six individuals of the three species of `SPECIES_TREE`.
fn species_data() -> TraitMatrix {
    let mut data = matrix(&[
        ("a1", &[1.0, 0.2]),
        ("a2", &[1.4, -0.1]),
        ("a3", &[0.7, 0.0]),
        ("b1", &[-0.5, 1.1]),
        ("c1", &[2.0, 0.4]),
        ("c2", &[2.2, 0.9]),
    ]);
    for (taxon, species) in [("a1", "A"), ("a2", "A"), ("a3", "A"), ("b1", "B"), ("c1", "C"), ("c2", "C")] {
        data.set_species(taxon, species).unwrap();
    }
    data
}

fn agree(newick: &str, first: ProcessVariant, second: ProcessVariant, model: CovarianceModel, n_sites: usize) {
    let tree = Tree::from_newick(newick).unwrap();
    let data = matrix_for(&tree, n_sites, &VALUES);
    let a = evaluate(first, newick, model.clone(), data.clone(), n_sites);
    let b = evaluate(second, newick, model, data, n_sites);
    assert_close(a, b, 1e-8);
}

#[test]
fn test_brownian_mvn_matches_reml_ultrametric() {
    init_tracing();
    let model = CovarianceModel::brownian(1.3, 0.2);
    agree(ULTRAMETRIC, ProcessVariant::BrownianMvn, ProcessVariant::BrownianReml, model, 1);
}

#[test]
fn test_brownian_mvn_matches_reml_non_ultrametric_with_site_rates() {
    let model = CovarianceModel::brownian(0.7, vec![0.5, -0.5]).with_site_rates(vec![1.0, 2.5]);
    agree(NON_ULTRAMETRIC, ProcessVariant::BrownianMvn, ProcessVariant::BrownianReml, model, 2);
}

#[test]
fn test_brownian_mvn_matches_reml_polytomy() {
    let model = CovarianceModel::brownian(1.0, 0.1);
    agree("((A:1,B:2,C:0.5):0.3,D:1);", ProcessVariant::BrownianMvn, ProcessVariant::BrownianReml, model, 1);
}

#[test]
fn test_brownian_heterogeneous_rates() {
    let tree = Tree::from_newick(NON_ULTRAMETRIC).unwrap();
    let sigma: Vec<f64> = (0..tree.n_nodes()).map(|i| 0.5 + 0.2 * i as f64).collect();
    let model = CovarianceModel::brownian(sigma, 0.0);
    agree(NON_ULTRAMETRIC, ProcessVariant::BrownianMvn, ProcessVariant::BrownianReml, model, 1);
}

#[test]
fn test_ou_mvn_three_point_and_reml_agree() {
    let model = CovarianceModel::ornstein_uhlenbeck(1.1, 0.6, 0.8, -0.4).with_site_rates(vec![1.0, 0.5]);
    for newick in [ULTRAMETRIC, NON_ULTRAMETRIC] {
        agree(newick, ProcessVariant::OrnsteinUhlenbeckMvn, ProcessVariant::OrnsteinUhlenbeckThreePoint, model.clone(), 2);
        agree(newick, ProcessVariant::OrnsteinUhlenbeckMvn, ProcessVariant::OrnsteinUhlenbeckReml, model.clone(), 2);
        agree(newick, ProcessVariant::OrnsteinUhlenbeckMvn, ProcessVariant::OrnsteinUhlenbeckEve, model.clone(), 2);
    }
}

#[test]
fn test_ou_agreement_with_strong_pull_on_non_ultrametric_tree() {
    init_tracing();
    let newick = "((A:1,B:1):0.2,C:5);";
    let data = matrix(&[("A", &[0.3]), ("B", &[0.9]), ("C", &[0.4])]);
    let model = CovarianceModel::ornstein_uhlenbeck(1.0, 10.0, 0.5, 0.5);
    let mvn = evaluate(ProcessVariant::OrnsteinUhlenbeckMvn, newick, model.clone(), data.clone(), 1);
    let three_point = evaluate(ProcessVariant::OrnsteinUhlenbeckThreePoint, newick, model.clone(), data.clone(), 1);
    let reml = evaluate(ProcessVariant::OrnsteinUhlenbeckReml, newick, model, data, 1);
    assert_close(mvn, three_point, 1e-8);
    assert_close(mvn, reml, 1e-8);
}

#[test]
fn test_ou_reml_at_zero_alpha_is_brownian() {
    let model = CovarianceModel::ornstein_uhlenbeck(1.4, 0.0, 5.0, 0.3);
    agree(NON_ULTRAMETRIC, ProcessVariant::OrnsteinUhlenbeckReml, ProcessVariant::BrownianReml, model, 1);
}

#[test]
fn test_eve_matches_ou_reml_heterogeneous() {
    let tree = Tree::from_newick(NON_ULTRAMETRIC).unwrap();
    let n = tree.n_nodes();
    let sigma: Vec<f64> = (0..n).map(|i| 0.8 + 0.1 * i as f64).collect();
    let alpha: Vec<f64> = (0..n).map(|i| if i % 3 == 0 { 0.0 } else { 0.3 * i as f64 }).collect();
    let theta: Vec<f64> = (0..n).map(|i| -1.0 + 0.25 * i as f64).collect();
    let model = CovarianceModel::ornstein_uhlenbeck(sigma, alpha, theta, 0.6);
    agree(NON_ULTRAMETRIC, ProcessVariant::OrnsteinUhlenbeckEve, ProcessVariant::OrnsteinUhlenbeckReml, model, 1);
}

#[test]
fn test_multi_sample_reml_matches_mvn() {
    let newick = SPECIES_TREE;
    let data = species_data();
    let model = CovarianceModel::brownian(0.9, 0.3).with_site_rates(vec![1.0, 1.5]);
    let v = 0.05;

    let reml = evaluate(
        ProcessVariant::MultiSampleBrownianReml { within_species_variance: v },
        newick,
        model.clone(),
        data.clone(),
        2,
    );
    let mvn = evaluate(
        ProcessVariant::MultiSampleBrownianMvn { within_species_variance: v },
        newick,
        model.clone(),
        data.clone(),
        2,
    );
    assert_close(reml, mvn, 1e-8);

    // at alpha = 0 the OU kernel reduces to BM
    let ou_model = CovarianceModel::ornstein_uhlenbeck(0.9, 0.0, 0.0, 0.3).with_site_rates(vec![1.0, 1.5]);
    let ou = evaluate(
        ProcessVariant::MultiSampleOrnsteinUhlenbeckReml { within_species_variance: v },
        newick,
        ou_model,
        data,
        2,
    );
    assert_close(reml, ou, 1e-10);
}

#[test]
fn test_multi_sample_ou_mvn_matches_reml() {
    let v = 0.08;
    let model = CovarianceModel::ornstein_uhlenbeck(1.1, 0.7, 0.9, 0.2).with_site_rates(vec![1.0, 0.6]);
    let mvn = evaluate(
        ProcessVariant::MultiSampleOrnsteinUhlenbeckMvn { within_species_variance: v },
        SPECIES_TREE,
        model.clone(),
        species_data(),
        2,
    );
    let reml = evaluate(
        ProcessVariant::MultiSampleOrnsteinUhlenbeckReml { within_species_variance: v },
        SPECIES_TREE,
        model,
        species_data(),
        2,
    );
    assert_close(mvn, reml, 1e-8);
}

#[test]
fn test_multivariate_multi_sample_matches_kronecker_mvn() {
    let tree = Tree::from_newick(SPECIES_TREE).unwrap();
    let data = species_data();
    let k = 2;
    let v = 0.12;
    let rates = DMatrix::from_row_slice(2, 2, &[1.0, -0.4, -0.4, 0.8]);
    let model = CovarianceModel::brownian(1.3, vec![0.5, 0.1]);

    let ln_l = evaluate(
        ProcessVariant::MultivariateMultiSampleBrownianReml {
            rate_matrix: rates.clone(),
            within_species_variance: v,
        },
        SPECIES_TREE,
        model.clone(),
        data.clone(),
        k,
    );

    // individuals in tip order, each contributing its k traits
    let c = vcv::brownian_covariance(&tree, &model);
    let rows: Vec<(usize, usize)> = (0..tree.n_tips())
        .flat_map(|tip| {
            data.taxa_of_species(tree.tip_name(tip).unwrap())
                .into_iter()
                .map(move |row| (tip, row))
        })
        .collect();
    let m = rows.len();
    let individual_cov = DMatrix::from_fn(m, m, |i, j| c[(rows[i].0, rows[j].0)] + if i == j { v } else { 0.0 });
    let full = Factorized::new(individual_cov.kronecker(&rates)).unwrap();
    let x = DVector::from_iterator(
        m * k,
        rows.iter()
            .flat_map(|&(_, row)| data.taxon_data(row).unwrap().values().to_vec()),
    );
    let mean = DVector::from_iterator(m * k, (0..m).flat_map(|_| [0.5, 0.1]));
    assert_close(ln_l, full.ln_density(&x, &mean, 1.0), 1e-8);
}

#[test]
fn test_single_individual_species_match_single_sample() {
    let newick = "((A:1,B:0.6):0.5,C:1.2);";
    let data = matrix(&[("A", &[1.0]), ("B", &[-0.5]), ("C", &[2.0])]);
    let model = CovarianceModel::brownian(1.0, 0.0);
    let single = evaluate(ProcessVariant::BrownianReml, newick, model.clone(), data.clone(), 1);
    let multi = evaluate(
        ProcessVariant::MultiSampleBrownianReml { within_species_variance: 0.0 },
        newick,
        model,
        data,
        1,
    );
    assert_close(single, multi, 1e-12);
}

#[test]
fn test_multivariate_reml_matches_kronecker_mvn() {
    let tree = Tree::from_newick(NON_ULTRAMETRIC).unwrap();
    let k = 2;
    let data = matrix_for(&tree, k, &VALUES);
    let rates = DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 0.5]);
    let model = CovarianceModel::brownian(1.0, vec![0.2, -0.1]);

    let ln_l = evaluate(
        ProcessVariant::MultivariateBrownianReml { rate_matrix: rates.clone() },
        NON_ULTRAMETRIC,
        model.clone(),
        data.clone(),
        k,
    );

    let c = vcv::brownian_covariance(&tree, &model);
    let full = Factorized::new(c.kronecker(&rates)).unwrap();
    let n = tree.n_tips();
    let x = DVector::from_iterator(
        n * k,
        (0..n).flat_map(|tip| {
            let row = data.taxon_data(tip).unwrap().values().to_vec();
            row.into_iter()
        }),
    );
    let mean = DVector::from_iterator(n * k, (0..n).flat_map(|_| [0.2, -0.1]));
    assert_close(ln_l, full.ln_density(&x, &mean, 1.0), 1e-8);
}

#[test]
fn test_large_site_count_uses_parallel_path() {
    let tree = Tree::from_newick(ULTRAMETRIC).unwrap();
    let n_sites = 80;
    let values: Vec<f64> = (0..n_sites * tree.n_tips()).map(|i| ((i * 37) % 17) as f64 / 7.0 - 1.0).collect();
    let data = matrix_for(&tree, n_sites, &values);
    let model = CovarianceModel::brownian(1.2, 0.0);

    let mvn = process(ProcessVariant::BrownianMvn, ULTRAMETRIC, model.clone(), data.clone(), n_sites)
        .compute_ln_probability()
        .unwrap();
    let reml = process(ProcessVariant::BrownianReml, ULTRAMETRIC, model, data, n_sites)
        .compute_ln_probability()
        .unwrap();
    assert_close(mvn, reml, 1e-8);
}
