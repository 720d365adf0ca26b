use exdesign::{BlockStructure, CandidateSet, Factor, ModelSpec, OptimalDesign, Result};

// f(x): 1 + T + P + S + T:P + T:S + P:S
fn main() -> Result<()> {
    // the oven temperature T is hard to change, pressure P and speed S are easy to change
    let candidates = CandidateSet::full_factorial(vec![
        Factor::two_level("T").with_range(180., 220.),
        Factor::two_level("P").with_range(1., 3.),
        Factor::three_level("S").with_range(100., 300.),
    ])?;
    let model = ModelSpec::interactions(3);

    // four whole plots of four runs, each whole plot fixes the oven temperature
    let blocks = BlockStructure::split_plot(vec![4, 4, 4, 4], 0, vec![-1., 1., 1., -1.])?;

    let design = OptimalDesign::new(candidates, model, 16)
        .with_blocks(blocks)
        .with_repeats(20)
        .solve()?;

    println!("{design}");

    // settings in natural units, one run per line
    for (run, x) in design.decoded().column_iter().enumerate() {
        println!(
            "run {run:>2} in whole plot {}: T = {:.0}, P = {:.1}, S = {:.0}",
            design.blocks()[run],
            x[0],
            x[1],
            x[2]
        );
    }

    Ok(())
}
