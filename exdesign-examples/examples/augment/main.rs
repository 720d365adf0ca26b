use exdesign::{CandidateSet, ModelSpec, OptimalDesign, Result};

// f(x): 1 + A + B + A:B + A^2 + B^2
fn main() -> Result<()> {
    let candidates = CandidateSet::from_levels(3, 2)?;

    // a first order screening experiment was already run at the corners and the center
    let prior = [0, 2, 4, 6, 8];
    let augmented = candidates.augment_with_rows(&prior)?;

    // augment the prior runs by 5 runs to fit a full second order model
    let design = OptimalDesign::new(augmented, ModelSpec::quadratic(2), 10)
        .with_augmented_rows()
        .with_repeats(10)
        .solve()?
        .into_estimable()?;

    println!("{design}");

    let new_runs = &design.rows()[prior.len()..];
    println!("new runs: {new_runs:?}");

    Ok(())
}
