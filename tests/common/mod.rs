#![allow(dead_code)]

use phylotrait::{CovarianceModel, PhyloProcess, ProcessConfig, ProcessVariant, Tree, TraitMatrix};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn assert_close(a: f64, b: f64, tol: f64) {
    assert!(
        (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs())),
        "{} vs {} (diff {})",
        a,
        b,
        (a - b).abs()
    );
}

pub fn matrix(rows: &[(&str, &[f64])]) -> TraitMatrix {
    TraitMatrix::from_rows(rows.iter().map(|(name, values)| (*name, values.to_vec()))).unwrap()
}

/// Matrix with rows named like the tree's tips, filled from `values` cyclically.
pub fn matrix_for(tree: &Tree, n_sites: usize, values: &[f64]) -> TraitMatrix {
    let rows = (0..tree.n_tips()).map(|tip| {
        let row: Vec<f64> = (0..n_sites)
            .map(|site| values[(tip * n_sites + site) % values.len()])
            .collect();
        (tree.tip_name(tip).unwrap().to_string(), row)
    });
    TraitMatrix::from_rows(rows).unwrap()
}

pub fn process(
    variant: ProcessVariant,
    newick: &str,
    model: CovarianceModel,
    data: TraitMatrix,
    n_sites: usize,
) -> PhyloProcess {
    let tree = Tree::from_newick(newick).unwrap();
    let config = ProcessConfig {
        num_sites: n_sites,
        ..Default::default()
    };
    let mut process = PhyloProcess::new(variant, tree, model, config).unwrap();
    process.set_value(data).unwrap();
    process
}

pub fn evaluate(
    variant: ProcessVariant,
    newick: &str,
    model: CovarianceModel,
    data: TraitMatrix,
    n_sites: usize,
) -> f64 {
    process(variant, newick, model, data, n_sites)
        .compute_ln_probability()
        .unwrap()
}

/// Random rooted binary tree with tips `T0..T{n-1}` and branch lengths in (0.05, 2).
pub fn random_newick(n_tips: usize, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut clades: Vec<String> = (0..n_tips)
        .map(|i| format!("T{}:{:.3}", i, rng.gen_range(0.05..2.0)))
        .collect();
    while clades.len() > 2 {
        let a = clades.swap_remove(rng.gen_range(0..clades.len()));
        let b = clades.swap_remove(rng.gen_range(0..clades.len()));
        clades.push(format!("({},{}):{:.3}", a, b, rng.gen_range(0.05..2.0)));
    }
    format!("({},{});", clades[0], clades[1])
}
