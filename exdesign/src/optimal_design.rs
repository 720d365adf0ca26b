use crate::{
    BlockStructure, CandidateSet, Convergence, Criterion, CriterionEvaluator, Efficiencies, Error,
    ExchangeCriteria, ExchangeOptimizer, ExchangeOutcome, ModelSpec, MomentEstimate, Result,
};
use faer_ext::IntoNalgebra;
use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use std::fmt::Display;

/// Outcome of a single repeat of the exchange search.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatSummary {
    /// Index of the repeat.
    pub repeat: usize,
    /// Seed of the random generator of the repeat.
    pub seed: u64,
    /// Final criterion value.
    pub value: f64,
    /// Log-determinant of the information matrix.
    pub log_det: f64,
    /// Returns true if all model parameters are estimable.
    pub estimable: bool,
    /// Numerical rank of the information matrix.
    pub rank: usize,
    /// Number of passes performed.
    pub passes: usize,
    /// Final state of the search.
    pub convergence: Convergence,
}

/// Exact design selected by [OptimalDesign::solve].
///
/// Settings are stored column-orientated like the candidate points: column `i` holds the
/// coded factor levels of run `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct Design {
    rows: Vec<usize>,
    blocks: Vec<usize>,
    n_blocks: usize,
    settings: DMatrix<f64>,
    decoded: DMatrix<f64>,
    factor_names: Vec<String>,
    criterion: Criterion,
    value: f64,
    log_det: f64,
    rank: usize,
    parameters: usize,
    convergence: Convergence,
    passes: usize,
    trajectory: Vec<f64>,
    best_repeat: usize,
    repeats: Vec<RepeatSummary>,
    fim: Option<DMatrix<f64>>,
    efficiencies: Option<Efficiencies>,
}

impl Display for Design {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = (30 + self.factor_names.len() * 9).max(28);
        let header = format!("Run\tBlock\tCandidate\t[ {} ]", self.factor_names.join(", "));
        let rows: String = self
            .settings
            .column_iter()
            .enumerate()
            .map(|(run, x)| {
                let values = x
                    .iter()
                    .map(|v| format!("{:>+.4}", v))
                    .collect::<Vec<String>>()
                    .join(", ");
                format!("{run}\t{}\t{}\t[ {values} ]", self.blocks[run], self.rows[run])
            })
            .collect::<Vec<String>>()
            .join("\n");
        let stats_title = format!("{:-^1$}", " Statistics ".to_string(), width);
        let footer = format!("{:-^1$}", String::new(), width);
        let criterion = format!("Criterion: {}", self.criterion);
        let value = format!("Criterion value: {:.6}", self.value);
        let estimable = format!(
            "Estimable: {} (rank {} of {})",
            self.is_estimable(),
            self.rank,
            self.parameters
        );
        let d_eff = match &self.efficiencies {
            Some(eff) => format!("D-efficiency: {:.6}", eff.d),
            None => "D-efficiency: -".to_string(),
        };
        let passes = format!("Passes: {} ({:?})", self.passes, self.convergence);
        let repeat = format!("Best repeat: {} of {}", self.best_repeat, self.repeats.len());
        write!(
            f,
            "{:-^1$}\n{header}\n{rows}\n{stats_title}\n{criterion}\n{value}\n{estimable}\n{d_eff}\n{passes}\n{repeat}\n{footer}",
            " Design ".to_string(),
            width
        )
    }
}

impl Design {
    /// Candidate index of every run.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Block index of every run.
    pub fn blocks(&self) -> &[usize] {
        &self.blocks
    }

    /// Number of blocks.
    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    /// Number of runs.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the design has no run.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Coded factor settings, one column per run.
    pub fn settings(&self) -> &DMatrix<f64> {
        &self.settings
    }

    /// Factor settings in natural units, one column per run.
    pub fn decoded(&self) -> &DMatrix<f64> {
        &self.decoded
    }

    /// Criterion the design was optimized for.
    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    /// Criterion value. The determinant of the D-criterion overflows to infinity for very large
    /// information matrices; repeats are ranked by [Design::log_det] then.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Log-determinant of the information matrix.
    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    /// Numerical rank of the information matrix.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns true if all model parameters are estimable.
    pub fn is_estimable(&self) -> bool {
        self.rank == self.parameters && self.fim.is_some()
    }

    /// Final state of the winning search.
    pub fn convergence(&self) -> Convergence {
        self.convergence
    }

    /// Number of passes of the winning search.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Criterion values of the winning search after its initial design and every exchange.
    pub fn trajectory(&self) -> &[f64] {
        &self.trajectory
    }

    /// Index of the winning repeat.
    pub fn best_repeat(&self) -> usize {
        self.best_repeat
    }

    /// Summaries of all repeats in repeat order.
    pub fn repeats(&self) -> &[RepeatSummary] {
        &self.repeats
    }

    /// Information matrix of an estimable design.
    pub fn information_matrix(&self) -> Option<&DMatrix<f64>> {
        self.fim.as_ref()
    }

    /// Efficiency diagnostics of an estimable design.
    pub fn efficiencies(&self) -> Option<&Efficiencies> {
        self.efficiencies.as_ref()
    }

    /// Returns the design if all parameters are estimable, [Error::NonEstimableModel]
    /// otherwise.
    pub fn into_estimable(self) -> Result<Self> {
        if self.is_estimable() {
            Ok(self)
        } else {
            Err(Error::NonEstimableModel {
                rank: self.rank,
                parameters: self.parameters,
            })
        }
    }
}

/// Exact Optimal Design Solver
///
/// Selects `n_trials` runs out of a candidate set by the row exchange search of
/// [ExchangeOptimizer], restarted from several seeded random initial designs. The best design
/// over all repeats is returned.
///
/// ```
/// use exdesign::{CandidateSet, ModelSpec, OptimalDesign, Result};
///
/// fn main() -> Result<()> {
///     let candidates = CandidateSet::from_levels(2, 3)?;
///     let design = OptimalDesign::new(candidates, ModelSpec::linear(3), 4)
///         .with_repeats(10)
///         .with_seed(1)
///         .solve()?;
///     assert!(design.is_estimable());
///     assert!((design.value() - 256.).abs() < 1e-6);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct OptimalDesign {
    candidates: CandidateSet,
    model: ModelSpec,
    n_trials: usize,
    criterion: Criterion,
    moments: MomentEstimate,
    n_repeats: usize,
    seed: u64,
    blocks: Option<BlockStructure>,
    fixed_rows: Vec<(usize, usize)>,
    allow_repeats: bool,
    criteria: ExchangeCriteria,
    parallel: bool,
}

impl OptimalDesign {
    /// Returns the solver of a design with `n_trials` runs of `model` out of `candidates`.
    pub fn new(candidates: CandidateSet, model: ModelSpec, n_trials: usize) -> Self {
        Self {
            candidates,
            model,
            n_trials,
            criterion: Criterion::default(),
            moments: MomentEstimate::default(),
            n_repeats: 5,
            seed: 0,
            blocks: None,
            fixed_rows: vec![],
            allow_repeats: true,
            criteria: ExchangeCriteria::default(),
            parallel: true,
        }
    }

    /// Returns the solver with given [Criterion].
    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criterion = criterion;
        self
    }

    /// Returns the solver with given estimation of the I-criterion moment matrix.
    pub fn with_moments(mut self, moments: MomentEstimate) -> Self {
        self.moments = moments;
        self
    }

    /// Returns the solver with given number of random restarts.
    pub fn with_repeats(mut self, n_repeats: usize) -> Self {
        self.n_repeats = n_repeats;
        self
    }

    /// Returns the solver with given master seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Returns the solver with given [BlockStructure]. Its run count has to match `n_trials`.
    pub fn with_blocks(mut self, blocks: BlockStructure) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Returns the solver pinning candidates to run positions, given as `(position, candidate)`
    /// pairs.
    pub fn with_fixed_rows(mut self, rows: Vec<(usize, usize)>) -> Self {
        self.fixed_rows.extend(rows);
        self
    }

    /// Returns the solver pinning all candidates of a prior experiment (see
    /// [CandidateSet::augment]) to the first run positions.
    pub fn with_augmented_rows(mut self) -> Self {
        let prior = self.candidates.fixed_indices();
        self.fixed_rows.extend(prior.into_iter().enumerate());
        self
    }

    /// Returns the solver drawing every candidate at most once.
    pub fn without_repeated_points(mut self) -> Self {
        self.allow_repeats = false;
        self
    }

    /// Returns the solver with given [ExchangeCriteria].
    pub fn with_criteria(mut self, criteria: ExchangeCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Returns the solver running its repeats one after another on the calling thread.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    fn block_structure(&self) -> Result<BlockStructure> {
        match &self.blocks {
            Some(blocks) => Ok(blocks.clone()),
            None => BlockStructure::new(vec![self.n_trials]),
        }
    }

    /// Checks the configuration before any search starts.
    pub fn validate(&self) -> Result<()> {
        if self.candidates.is_empty() {
            return Err(Error::EmptyCandidateSet);
        }
        if self.n_trials == 0 {
            return Err(Error::invalid("n_trials", "at least one run is required"));
        }
        if self.n_repeats == 0 {
            return Err(Error::invalid("n_repeats", "at least one repeat is required"));
        }
        if !self.allow_repeats && self.n_trials > self.candidates.len() {
            return Err(Error::invalid(
                "n_trials",
                format!(
                    "{} runs without repeated points exceed {} candidates",
                    self.n_trials,
                    self.candidates.len()
                ),
            ));
        }
        if !(self.criteria.tolerance >= 0. && self.criteria.tolerance.is_finite()) {
            return Err(Error::invalid(
                "criteria",
                format!("tolerance {} is not a finite non-negative number", self.criteria.tolerance),
            ));
        }
        if self.criteria.refresh_interval == 0 {
            return Err(Error::invalid("criteria", "refresh interval has to be positive"));
        }
        let blocks = self.block_structure()?;
        if blocks.n_trials() != self.n_trials {
            return Err(Error::invalid(
                "blocks",
                format!(
                    "block sizes sum to {} but the design has {} runs",
                    blocks.n_trials(),
                    self.n_trials
                ),
            ));
        }
        blocks.validate(&self.candidates)?;
        self.model
            .validate(self.candidates.n_factors(), blocks.n_blocks())?;

        let position_blocks = blocks.position_blocks();
        for (idx, &(pos, cand)) in self.fixed_rows.iter().enumerate() {
            if pos >= self.n_trials {
                return Err(Error::invalid(
                    "fixed_rows",
                    format!("position {pos} is out of range for {} runs", self.n_trials),
                ));
            }
            if cand >= self.candidates.len() {
                return Err(Error::invalid(
                    "fixed_rows",
                    format!(
                        "candidate {cand} is out of range for {} candidates",
                        self.candidates.len()
                    ),
                ));
            }
            if self.fixed_rows[..idx].iter().any(|(p, _)| *p == pos) {
                return Err(Error::invalid(
                    "fixed_rows",
                    format!("position {pos} is fixed twice"),
                ));
            }
            let x: Vec<f64> = self.candidates.point(cand).iter().copied().collect();
            if !blocks.admits(position_blocks[pos], &x) {
                return Err(Error::invalid(
                    "fixed_rows",
                    format!(
                        "candidate {cand} violates the whole-plot settings of block {}",
                        position_blocks[pos]
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Returns the best design over all repeats. Configuration errors are reported before any
    /// search starts, a design without full rank is returned flagged not estimable.
    pub fn solve(&self) -> Result<Design> {
        self.validate()?;
        let blocks = self.block_structure()?;
        let mut master = StdRng::seed_from_u64(self.seed);
        let evaluator = CriterionEvaluator::new(
            self.criterion,
            &self.moments,
            &self.candidates,
            &self.model,
            &mut master,
        )?;
        let seeds: Vec<u64> = (0..self.n_repeats).map(|_| master.next_u64()).collect();
        let optimizer = ExchangeOptimizer::new(
            &self.candidates,
            &self.model,
            &blocks,
            &self.fixed_rows,
            self.allow_repeats,
            evaluator.clone(),
            self.criteria.clone(),
        )?;
        info!(
            "searching {}-optimal design with {} runs and {} parameters over {} candidates, {} repeats",
            self.criterion,
            self.n_trials,
            self.model.len(),
            self.candidates.len(),
            self.n_repeats
        );

        let run = |seed: &u64| -> Result<ExchangeOutcome> {
            let mut rng = StdRng::seed_from_u64(*seed);
            optimizer.run(&mut rng)
        };
        let outcomes: Vec<ExchangeOutcome> = if self.parallel {
            seeds.par_iter().map(run).collect::<Result<Vec<_>>>()?
        } else {
            seeds.iter().map(run).collect::<Result<Vec<_>>>()?
        };

        let repeats: Vec<RepeatSummary> = outcomes
            .iter()
            .zip(&seeds)
            .enumerate()
            .map(|(repeat, (outcome, seed))| {
                debug!(
                    "repeat {repeat}: {} = {:.6e}, rank {}, {} passes, {:?}",
                    self.criterion,
                    outcome.value,
                    outcome.rank,
                    outcome.passes,
                    outcome.convergence
                );
                RepeatSummary {
                    repeat,
                    seed: *seed,
                    value: outcome.value,
                    log_det: outcome.log_det,
                    estimable: outcome.estimable,
                    rank: outcome.rank,
                    passes: outcome.passes,
                    convergence: outcome.convergence,
                }
            })
            .collect();

        let mut best_repeat = 0;
        for (repeat, outcome) in outcomes.iter().enumerate().skip(1) {
            if Self::is_better_outcome(&evaluator, outcome, &outcomes[best_repeat]) {
                best_repeat = repeat;
            }
        }
        let Some(best) = outcomes.into_iter().nth(best_repeat) else {
            return Err(Error::invalid("n_repeats", "no repeat was run"));
        };
        if best.estimable {
            info!(
                "best design from repeat {best_repeat}: {} = {:.6e}",
                self.criterion, best.value
            );
        } else {
            warn!(
                "no estimable design found, best rank is {} of {}",
                best.rank,
                self.model.len()
            );
        }
        Ok(self.design(best, &blocks, &evaluator, best_repeat, repeats))
    }

    /// Estimable beats non-estimable, then the criterion score decides, then the rank.
    fn is_better_outcome(
        evaluator: &CriterionEvaluator,
        a: &ExchangeOutcome,
        b: &ExchangeOutcome,
    ) -> bool {
        match (a.estimable, b.estimable) {
            (true, false) => true,
            (false, true) => false,
            (true, true) => evaluator.is_better(a.score, b.score),
            (false, false) => a.rank > b.rank,
        }
    }

    fn design(
        &self,
        outcome: ExchangeOutcome,
        blocks: &BlockStructure,
        evaluator: &CriterionEvaluator,
        best_repeat: usize,
        repeats: Vec<RepeatSummary>,
    ) -> Design {
        let n_factors = self.candidates.n_factors();
        let rows = outcome.rows;
        let settings = DMatrix::from_fn(n_factors, rows.len(), |f, i| {
            self.candidates.points()[(f, rows[i])]
        });
        let decoded =
            DMatrix::from_fn(n_factors, rows.len(), |f, i| self.candidates.decode(rows[i])[f]);
        let factor_names = self
            .candidates
            .factors()
            .iter()
            .map(|f| f.name.clone())
            .collect();
        let efficiencies = outcome
            .info
            .as_ref()
            .map(|info| Efficiencies::new(info, rows.len(), evaluator.moments()));
        let fim = outcome
            .info
            .as_ref()
            .map(|info| info.fim().as_ref().into_nalgebra().clone_owned());
        Design {
            blocks: blocks.position_blocks(),
            n_blocks: blocks.n_blocks(),
            rows,
            settings,
            decoded,
            factor_names,
            criterion: self.criterion,
            value: outcome.value,
            log_det: outcome.log_det,
            rank: outcome.rank,
            parameters: self.model.len(),
            convergence: outcome.convergence,
            passes: outcome.passes,
            trajectory: outcome.trajectory,
            best_repeat,
            repeats,
            fim,
            efficiencies,
        }
    }
}
