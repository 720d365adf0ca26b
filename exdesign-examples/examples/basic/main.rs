use exdesign::{CandidateSet, Criterion, ModelSpec, OptimalDesign, Result};

// f(x): 1 + A + B + C
fn main() -> Result<()> {
    // 2^3 full factorial with factors A, B and C at coded levels -1 and +1
    let candidates = CandidateSet::from_levels(2, 3)?;

    // define linear model with intercept and main effects
    let model = ModelSpec::linear(3);

    // define exact optimal design solver for 4 runs
    let od = OptimalDesign::new(candidates, model, 4)
        .with_criterion(Criterion::D)
        .with_repeats(10)
        .with_seed(1);

    // find optimal design
    let design = od.solve()?;

    // display optimal design, a half fraction of the 2^3 factorial
    println!("{design}");
    // Output (the selected half fraction may differ in its rows)
    // ------------------------ Design -------------------------
    // Run     Block   Candidate       [ A, B, C ]
    // 0       0       3               [ -1.0000, +1.0000, +1.0000 ]
    // 1       0       5               [ +1.0000, -1.0000, +1.0000 ]
    // 2       0       0               [ -1.0000, -1.0000, -1.0000 ]
    // 3       0       6               [ +1.0000, +1.0000, -1.0000 ]
    // ---------------------- Statistics -----------------------
    // Criterion: D
    // Criterion value: 256.000000
    // Estimable: true (rank 4 of 4)
    // D-efficiency: 1.000000
    // Passes: 3 (Converged)
    // Best repeat: 0 of 10
    // ---------------------------------------------------------

    Ok(())
}
