use exdesign::{
    BlockStructure, CandidateSet, Convergence, Criterion, Error, ExchangeCriteria, Factor,
    ModelSpec, MomentEstimate, OptimalDesign, Result,
};
use nalgebra::DMatrix;
use std::time::Duration;

const EQ_EPS: f64 = 1e-6;
const EQ_MAX_REL: f64 = 1e-9;

fn rel_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= EQ_MAX_REL * a.abs().max(b.abs()) + EQ_EPS
}

fn sorted(rows: &[usize]) -> Vec<usize> {
    let mut rows = rows.to_vec();
    rows.sort_unstable();
    rows
}

#[test]
fn test_optimal_design_factorial_half_fraction() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let design = OptimalDesign::new(cs, ModelSpec::linear(3), 4)
        .with_criterion(Criterion::D)
        .with_repeats(10)
        .with_seed(1)
        .solve()?;

    assert!(design.is_estimable());
    assert_eq!(design.convergence(), Convergence::Converged);
    assert!(rel_eq(design.value(), 256.));
    assert!(rel_eq(design.log_det(), 256f64.ln()));

    // model matrix columns 1, A, B, C are mutually orthogonal
    let settings = design.settings();
    let x = DMatrix::from_fn(4, 4, |i, j| if j == 0 { 1. } else { settings[(j - 1, i)] });
    let xtx = x.transpose() * &x;
    assert!(xtx.relative_eq(&(4. * DMatrix::identity(4, 4)), EQ_EPS, EQ_MAX_REL));
    let fim = design.information_matrix().expect("estimable design");
    assert!(fim.relative_eq(&(4. * DMatrix::identity(4, 4)), EQ_EPS, EQ_MAX_REL));

    // half fraction: the product of all factors is constant
    let products: Vec<f64> = settings.column_iter().map(|c| c.product()).collect();
    assert!(products.iter().all(|p| *p == products[0]));

    let efficiencies = design.efficiencies().copied();
    assert!(efficiencies.is_some_and(|e| rel_eq(e.d, 1.)));
    Ok(())
}

#[test]
fn test_optimal_design_trajectory_monotone() -> Result<()> {
    let cs = CandidateSet::from_levels(3, 2)?;
    for seed in 0..5 {
        let d_design = OptimalDesign::new(cs.clone(), ModelSpec::quadratic(2), 8)
            .with_repeats(1)
            .with_seed(seed)
            .solve()?;
        assert!(
            d_design
                .trajectory()
                .windows(2)
                .all(|w| w[1] >= w[0] * (1. - 1e-12))
        );

        let i_design = OptimalDesign::new(cs.clone(), ModelSpec::quadratic(2), 8)
            .with_criterion(Criterion::I)
            .with_repeats(1)
            .with_seed(seed)
            .solve()?;
        assert!(
            i_design
                .trajectory()
                .windows(2)
                .all(|w| w[1] <= w[0] * (1. + 1e-12))
        );
        assert_eq!(i_design.trajectory().last(), Some(&i_design.value()));
    }
    Ok(())
}

#[test]
fn test_optimal_design_idempotent() -> Result<()> {
    let cs = CandidateSet::from_levels(3, 2)?;
    let model = ModelSpec::quadratic(2);
    let design = OptimalDesign::new(cs.clone(), model.clone(), 7)
        .with_repeats(4)
        .solve()?;
    let fixed_rows = design.rows().iter().copied().enumerate().collect();
    let rerun = OptimalDesign::new(cs, model, 7)
        .with_fixed_rows(fixed_rows)
        .solve()?;
    assert_eq!(rerun.rows(), design.rows());
    assert!(rel_eq(rerun.value(), design.value()));
    assert_eq!(rerun.convergence(), Convergence::Converged);
    Ok(())
}

#[test]
fn test_optimal_design_saturated_without_repetition() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let design = OptimalDesign::new(cs, ModelSpec::linear(3), 8)
        .without_repeated_points()
        .solve()?;
    assert_eq!(sorted(design.rows()), (0..8).collect::<Vec<_>>());
    assert!(rel_eq(design.value(), 8f64.powi(4)));
    Ok(())
}

#[test]
fn test_optimal_design_saturated_interactions() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let design = OptimalDesign::new(cs, ModelSpec::interactions(3), 8)
        .with_repeats(20)
        .with_seed(3)
        .solve()?;
    assert_eq!(sorted(design.rows()), (0..8).collect::<Vec<_>>());
    assert!(rel_eq(design.value(), 8f64.powi(7)));
    Ok(())
}

#[test]
fn test_optimal_design_augmentation() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let augmented = cs.augment_with_rows(&[0, 0, 7])?;
    for seed in 0..4 {
        let design = OptimalDesign::new(augmented.clone(), ModelSpec::linear(3), 7)
            .with_augmented_rows()
            .with_repeats(3)
            .with_seed(seed)
            .solve()?;
        assert_eq!(&design.rows()[..3], &[0, 1, 2]);
        assert_eq!(design.settings().column(0), cs.points().column(0));
        assert_eq!(design.settings().column(1), cs.points().column(0));
        assert_eq!(design.settings().column(2), cs.points().column(7));
        assert!(design.rows()[3..].iter().all(|r| *r >= 3));
        assert!(design.is_estimable());
    }
    Ok(())
}

#[test]
fn test_optimal_design_split_plot() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let levels = vec![-1., 1., 1., -1.];
    let blocks = BlockStructure::split_plot(vec![3, 3, 3, 3], 0, levels.clone())?;
    let design = OptimalDesign::new(cs, ModelSpec::interactions(3), 12)
        .with_blocks(blocks)
        .with_repeats(4)
        .solve()?;
    assert!(design.is_estimable());
    assert_eq!(design.n_blocks(), 4);
    for (run, block) in design.blocks().iter().enumerate() {
        assert_eq!(*block, run / 3);
        assert_eq!(design.settings()[(0, run)], levels[*block]);
    }
    Ok(())
}

#[test]
fn test_optimal_design_block_effects() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let model = ModelSpec::linear(3).with_blocks(2);
    let design = OptimalDesign::new(cs, model, 8)
        .with_blocks(BlockStructure::new(vec![4, 4])?)
        .with_repeats(10)
        .solve()?;
    assert!(design.is_estimable());
    assert_eq!(design.blocks(), &[0, 0, 0, 0, 1, 1, 1, 1]);
    let fim = design.information_matrix().expect("estimable design");
    assert_eq!(fim.shape(), (5, 5));
    assert!(rel_eq(design.value(), 8f64.powi(5)));
    Ok(())
}

#[test]
fn test_optimal_design_deterministic() -> Result<()> {
    let cs = CandidateSet::from_levels(3, 3)?;
    let solver = OptimalDesign::new(cs, ModelSpec::quadratic(3), 14)
        .with_repeats(6)
        .with_seed(2024);
    let first = solver.solve()?;
    let second = solver.solve()?;
    let sequential = solver.clone().sequential().solve()?;
    assert_eq!(first.rows(), second.rows());
    assert_eq!(first.value(), second.value());
    assert_eq!(first.rows(), sequential.rows());
    assert_eq!(first.best_repeat(), sequential.best_repeat());
    assert_eq!(first.repeats(), sequential.repeats());
    assert_eq!(first.repeats().len(), 6);
    Ok(())
}

#[test]
fn test_optimal_design_i_quadratic() -> Result<()> {
    let cs = CandidateSet::from_levels(3, 2)?;
    let model = ModelSpec::quadratic(2);
    let design = OptimalDesign::new(cs.clone(), model.clone(), 9)
        .with_criterion(Criterion::I)
        .with_repeats(20)
        .solve()?;
    assert!(design.is_estimable());
    assert!(design.value().is_finite());
    assert!(design.efficiencies().is_some_and(|e| e.i == Some(design.value())));

    // the full 3^2 factorial is a feasible 9 run design
    let factorial = OptimalDesign::new(cs.clone(), model.clone(), 9)
        .with_criterion(Criterion::I)
        .with_fixed_rows((0..9).map(|j| (j, j)).collect())
        .solve()?;
    assert!(design.value() <= factorial.value() + EQ_EPS);

    let sampled = OptimalDesign::new(cs, model, 9)
        .with_criterion(Criterion::I)
        .with_moments(MomentEstimate::Sample(500))
        .with_repeats(4)
        .solve()?;
    assert!(sampled.is_estimable());
    Ok(())
}

#[test]
fn test_optimal_design_a_criterion() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let design = OptimalDesign::new(cs, ModelSpec::linear(3), 4)
        .with_criterion(Criterion::A)
        .with_repeats(10)
        .solve()?;
    assert_eq!(design.criterion(), Criterion::A);
    assert!(rel_eq(design.value(), 1.));
    Ok(())
}

#[test]
fn test_optimal_design_non_estimable() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 3)?;
    let design = OptimalDesign::new(cs, ModelSpec::linear(3), 3)
        .with_repeats(3)
        .solve()?;
    assert!(!design.is_estimable());
    assert_eq!(design.rank(), 3);
    assert!(design.repeats().iter().all(|r| !r.estimable));
    assert_eq!(
        design.into_estimable(),
        Err(Error::NonEstimableModel {
            rank: 3,
            parameters: 4
        })
    );
    Ok(())
}

#[test]
fn test_optimal_design_time_limit() -> Result<()> {
    let cs = CandidateSet::from_levels(3, 3)?;
    let criteria = ExchangeCriteria {
        time_limit: Some(Duration::ZERO),
        ..Default::default()
    };
    let design = OptimalDesign::new(cs, ModelSpec::quadratic(3), 12)
        .with_criteria(criteria)
        .with_repeats(2)
        .solve()?;
    assert_eq!(design.convergence(), Convergence::Capped);
    assert_eq!(design.passes(), 0);
    assert!(design.is_estimable());
    Ok(())
}

#[test]
fn test_optimal_design_overlapping_whole_plots() -> Result<()> {
    // blocks 0 and 1 both admit (-1, -1), only block 0 admits (-1, +1)
    let cs = CandidateSet::from_levels(2, 2)?;
    let blocks = BlockStructure::new(vec![1, 1, 1])?
        .with_whole_plot(0, 0, -1.)?
        .with_whole_plot(1, 0, -1.)?
        .with_whole_plot(1, 1, -1.)?
        .with_whole_plot(2, 0, 1.)?;
    for seed in 0..200 {
        let design = OptimalDesign::new(cs.clone(), ModelSpec::linear(2), 3)
            .with_blocks(blocks.clone())
            .with_repeats(1)
            .with_seed(seed)
            .sequential()
            .solve()?;
        assert!(design.is_estimable(), "seed {seed}: rows {:?}", design.rows());
        assert_eq!(design.rows()[0], 1);
        assert_eq!(design.rows()[1], 0);
    }
    Ok(())
}

#[test]
fn test_optimal_design_large_weights() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 5)?.with_weights(vec![1e20; 32])?;
    let design = OptimalDesign::new(cs, ModelSpec::interactions(5), 20)
        .with_repeats(6)
        .with_seed(5)
        .solve()?;

    assert!(design.is_estimable());
    // the determinant itself leaves the f64 range
    assert!(design.log_det() > 709.);
    assert!(design.log_det().is_finite());
    assert_eq!(design.value(), f64::INFINITY);

    let best = &design.repeats()[design.best_repeat()];
    assert_eq!(best.log_det, design.log_det());
    assert!(design.repeats().iter().all(|r| r.log_det <= design.log_det()));
    let first_best = design
        .repeats()
        .iter()
        .position(|r| r.log_det == design.log_det());
    assert_eq!(first_best, Some(design.best_repeat()));
    assert!(design.efficiencies().is_some_and(|e| e.d.is_finite()));
    Ok(())
}

#[test]
fn test_optimal_design_decoded_settings() -> Result<()> {
    let cs = CandidateSet::full_factorial(vec![
        Factor::two_level("temperature").with_range(150., 200.),
        Factor::three_level("time").with_range(10., 30.),
    ])?;
    let design = OptimalDesign::new(cs, ModelSpec::linear(2).with_quadratic(1), 6)
        .with_repeats(3)
        .solve()?;
    for (coded, decoded) in design
        .settings()
        .column_iter()
        .zip(design.decoded().column_iter())
    {
        assert!(rel_eq(decoded[0], 175. + 25. * coded[0]));
        assert!(rel_eq(decoded[1], 20. + 10. * coded[1]));
    }
    Ok(())
}

#[test]
fn test_optimal_design_configuration_errors() -> Result<()> {
    let cs = CandidateSet::from_levels(2, 2)?;
    let model = ModelSpec::linear(2);
    let invalid = |result: Result<_>| {
        matches!(
            result,
            Err(Error::InvalidConfiguration { .. }) | Err(Error::ShapeMismatch { .. })
        )
    };
    let solver = || OptimalDesign::new(cs.clone(), model.clone(), 4);

    assert!(invalid(OptimalDesign::new(cs.clone(), model.clone(), 0).solve()));
    assert!(invalid(solver().with_repeats(0).solve()));
    assert!(invalid(
        OptimalDesign::new(cs.clone(), model.clone(), 5)
            .without_repeated_points()
            .solve()
    ));
    assert!(invalid(
        solver()
            .with_blocks(BlockStructure::new(vec![2, 3])?)
            .solve()
    ));
    assert!(invalid(
        OptimalDesign::new(cs.clone(), ModelSpec::linear(3), 4).solve()
    ));
    assert!(invalid(
        OptimalDesign::new(cs.clone(), model.clone().with_blocks(3), 4)
            .with_blocks(BlockStructure::new(vec![2, 2])?)
            .solve()
    ));
    assert!(invalid(solver().with_fixed_rows(vec![(4, 0)]).solve()));
    assert!(invalid(solver().with_fixed_rows(vec![(0, 4)]).solve()));
    assert!(invalid(
        solver()
            .with_blocks(BlockStructure::split_plot(vec![2, 2], 0, vec![-1., 1.])?)
            .with_fixed_rows(vec![(0, 3)])
            .solve()
    ));
    assert!(invalid(
        solver()
            .with_criterion(Criterion::I)
            .with_moments(MomentEstimate::Custom(DMatrix::identity(2, 2)))
            .solve()
    ));
    assert!(invalid(
        solver()
            .with_criteria(ExchangeCriteria {
                refresh_interval: 0,
                ..Default::default()
            })
            .solve()
    ));
    assert_eq!(
        CandidateSet::from_points(vec![Factor::two_level("A")], DMatrix::zeros(1, 0)),
        Err(Error::EmptyCandidateSet)
    );
    Ok(())
}
