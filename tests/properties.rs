mod common;

use common::{evaluate, matrix_for, process, random_newick};
use phylotrait::{CovarianceModel, Parameter, ProcessVariant, Tree};
use proptest::prelude::*;

fn close(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn brownian_mvn_equals_reml(
        n_tips in 3usize..9,
        seed in any::<u64>(),
        sigma in 0.2f64..3.0,
        root in -2.0f64..2.0,
        values in proptest::collection::vec(-3.0f64..3.0, 8),
    ) {
        let newick = random_newick(n_tips, seed);
        let tree = Tree::from_newick(&newick).unwrap();
        let data = matrix_for(&tree, 1, &values);
        let model = CovarianceModel::brownian(sigma, root);
        let mvn = evaluate(ProcessVariant::BrownianMvn, &newick, model.clone(), data.clone(), 1);
        let reml = evaluate(ProcessVariant::BrownianReml, &newick, model, data, 1);
        prop_assert!(close(mvn, reml, 1e-8), "{}: {} vs {}", newick, mvn, reml);
    }

    #[test]
    fn ou_algorithms_agree(
        n_tips in 3usize..7,
        seed in any::<u64>(),
        alpha in 0.05f64..0.5,
        theta in -1.0f64..1.0,
        values in proptest::collection::vec(-2.0f64..2.0, 8),
    ) {
        let newick = random_newick(n_tips, seed);
        let tree = Tree::from_newick(&newick).unwrap();
        let data = matrix_for(&tree, 1, &values);
        let model = CovarianceModel::ornstein_uhlenbeck(1.0, alpha, theta, 0.3);
        let mvn = evaluate(ProcessVariant::OrnsteinUhlenbeckMvn, &newick, model.clone(), data.clone(), 1);
        let three_point = evaluate(ProcessVariant::OrnsteinUhlenbeckThreePoint, &newick, model.clone(), data.clone(), 1);
        let reml = evaluate(ProcessVariant::OrnsteinUhlenbeckReml, &newick, model, data, 1);
        prop_assert!(close(mvn, three_point, 1e-6), "{}: {} vs {}", newick, mvn, three_point);
        prop_assert!(close(mvn, reml, 1e-6), "{}: {} vs {}", newick, mvn, reml);
    }

    #[test]
    fn restore_returns_exact_value(
        n_tips in 3usize..9,
        seed in any::<u64>(),
        new_sigma in 0.2f64..3.0,
        values in proptest::collection::vec(-3.0f64..3.0, 8),
    ) {
        let newick = random_newick(n_tips, seed);
        let tree = Tree::from_newick(&newick).unwrap();
        let data = matrix_for(&tree, 1, &values);
        for variant in [ProcessVariant::BrownianReml, ProcessVariant::BrownianMvn] {
            let mut p = process(variant, &newick, CovarianceModel::brownian(1.0, 0.0), data.clone(), 1);
            let before = p.compute_ln_probability().unwrap();
            p.keep(Parameter::Sigma);

            p.model_mut().set_sigma(new_sigma);
            p.touch(Parameter::Sigma);
            p.compute_ln_probability().unwrap();
            p.restore(Parameter::Sigma);
            p.model_mut().set_sigma(1.0);

            prop_assert_eq!(p.compute_ln_probability().unwrap(), before);
        }
    }
}
