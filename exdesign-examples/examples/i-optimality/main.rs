use exdesign::{CandidateSet, Criterion, ModelSpec, MomentEstimate, OptimalDesign, Result};

// f(x): 1 + A + B + C + A:B + A:C + B:C + A^2 + B^2 + C^2
fn main() -> Result<()> {
    let candidates = CandidateSet::from_levels(5, 3)?;
    let model = ModelSpec::quadratic(3);

    // I-optimal design averaging the prediction variance over the whole grid
    let i_design = OptimalDesign::new(candidates.clone(), model.clone(), 16)
        .with_criterion(Criterion::I)
        .with_moments(MomentEstimate::Enumerate)
        .with_repeats(10)
        .solve()?;
    println!("{i_design}");

    // D-optimal design of the same size for comparison
    let d_design = OptimalDesign::new(candidates, model, 16)
        .with_repeats(10)
        .solve()?;

    if let (Some(i_eff), Some(d_eff)) = (i_design.efficiencies(), d_design.efficiencies()) {
        println!("              D-efficiency  A-value");
        println!("I-optimal     {:>12.4}  {:>7.4}", i_eff.d, i_eff.a);
        println!("D-optimal     {:>12.4}  {:>7.4}", d_eff.d, d_eff.a);
    }

    Ok(())
}
