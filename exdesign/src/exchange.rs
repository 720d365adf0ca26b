use crate::{
    BlockStructure, CandidateSet, CriterionEvaluator, Error, InformationMatrix, ModelSpec, Result,
    information::col_dot,
    optimality::SwapMoments,
};
use faer::Mat;
use log::{debug, trace, warn};
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use std::time::{Duration, Instant};

/// Residual norm ratio above which a row raises the rank of the design.
const RANK_TOL: f64 = 1e-10;
/// A later exchange replaces the best one of a pass only if it gains more than this.
const TIE_TOL: f64 = 1e-12;

/// Final state of an exchange search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// No exchange improves the design by more than the tolerance.
    Converged,
    /// The pass cap or the time limit was reached first.
    Capped,
}

/// Stop criteria of the exchange search.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeCriteria {
    /// Maximal number of passes over all design positions. The cap is checked before a pass
    /// starts, so a search whose last allowed pass still committed an exchange is reported
    /// [Convergence::Capped] even if the following pass would not have found an improvement.
    pub max_passes: usize,
    /// Minimal gain of an exchange to be committed.
    pub tolerance: f64,
    /// Wall-clock limit of a single search.
    pub time_limit: Option<Duration>,
    /// Number of committed exchanges after which the information matrix is recomputed from
    /// scratch.
    pub refresh_interval: usize,
}

impl Default for ExchangeCriteria {
    fn default() -> Self {
        Self {
            max_passes: 100,
            tolerance: 1e-9,
            time_limit: None,
            refresh_interval: 25,
        }
    }
}

/// Candidates admitted to one block with their transposed model rows.
#[derive(Debug, Clone)]
struct Pool {
    candidates: Vec<usize>,
    basis: Mat<f64>,
}

/// Result of a single exchange search.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    /// Candidate index of every run position.
    pub rows: Vec<usize>,
    /// Criterion value, `0` (D) or infinity (I, A) for a singular design.
    pub value: f64,
    /// Log-determinant of the information matrix, negative infinity for a singular design.
    pub log_det: f64,
    /// Score ranking designs of the same criterion, see [CriterionEvaluator::score].
    pub score: f64,
    /// Numerical rank of the information matrix.
    pub rank: usize,
    /// Returns true if all model parameters are estimable.
    pub estimable: bool,
    /// Number of passes performed.
    pub passes: usize,
    /// Final state of the search.
    pub convergence: Convergence,
    /// Criterion value of the initial design and after every committed exchange.
    pub trajectory: Vec<f64>,
    /// Information matrix of an estimable design.
    pub info: Option<InformationMatrix>,
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Row exchange search of an exact design of fixed size.
///
/// Every pass scores all exchanges of a free run position against the candidates admitted to
/// its block and commits the single best one.
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> INIT
///     INIT --> IMPROVING: design regular
///     INIT --> [*]: design singular
///     IMPROVING --> IMPROVING: best gain > tolerance
///     IMPROVING --> CONVERGED: best gain <= tolerance
///     IMPROVING --> CAPPED: pass cap or time limit
///     CONVERGED --> [*]
///     CAPPED --> [*]
/// ```
///
/// The optimizer holds read-only state only, so one instance serves any number of concurrent
/// searches with their own random generators.
#[derive(Debug, Clone)]
pub struct ExchangeOptimizer {
    evaluator: CriterionEvaluator,
    criteria: ExchangeCriteria,
    pools: Vec<Pool>,
    position_blocks: Vec<usize>,
    fixed: Vec<Option<usize>>,
    fixed_design_t: Mat<f64>,
    n_candidates: usize,
    allow_repeats: bool,
    parameters: usize,
}

impl ExchangeOptimizer {
    /// Creates the optimizer of a design with the run positions of `blocks`. `fixed_rows` pins
    /// candidates to positions as `(position, candidate)` pairs.
    pub fn new(
        candidates: &CandidateSet,
        model: &ModelSpec,
        blocks: &BlockStructure,
        fixed_rows: &[(usize, usize)],
        allow_repeats: bool,
        evaluator: CriterionEvaluator,
        criteria: ExchangeCriteria,
    ) -> Result<Self> {
        let position_blocks = blocks.position_blocks();
        let n_trials = position_blocks.len();
        let block_of = |b: usize| model.has_blocks().then_some(b);

        let mut fixed = vec![None; n_trials];
        let mut fixed_design_t = Mat::<f64>::zeros(model.len(), n_trials);
        for &(pos, cand) in fixed_rows {
            if pos >= n_trials || cand >= candidates.len() {
                return Err(Error::invalid(
                    "fixed_rows",
                    format!("row ({pos}, {cand}) is out of range"),
                ));
            }
            if fixed[pos].is_some() {
                return Err(Error::invalid(
                    "fixed_rows",
                    format!("position {pos} is fixed twice"),
                ));
            }
            let column = model.design_t_of(candidates, &[cand], block_of(position_blocks[pos]));
            for r in 0..model.len() {
                fixed_design_t[(r, pos)] = column[(r, 0)];
            }
            fixed[pos] = Some(cand);
        }

        let pools = (0..blocks.n_blocks())
            .map(|b| {
                let admitted: Vec<usize> = (0..candidates.len())
                    .filter(|j| !candidates.is_fixed(*j))
                    .filter(|j| {
                        let x: Vec<f64> = candidates.points().column(*j).iter().copied().collect();
                        blocks.admits(b, &x)
                    })
                    .collect();
                let free = (0..n_trials)
                    .filter(|pos| position_blocks[*pos] == b && fixed[*pos].is_none())
                    .count();
                if free > 0 && admitted.is_empty() {
                    return Err(Error::invalid(
                        "blocks",
                        format!("no candidate is admitted to block {b}"),
                    ));
                }
                if !allow_repeats && admitted.len() < free {
                    return Err(Error::invalid(
                        "n_trials",
                        format!(
                            "block {b} has {free} free runs but only {} distinct candidates",
                            admitted.len()
                        ),
                    ));
                }
                let basis = model.design_t_of(candidates, &admitted, block_of(b));
                Ok(Pool {
                    candidates: admitted,
                    basis,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            evaluator,
            criteria,
            pools,
            position_blocks,
            fixed,
            fixed_design_t,
            n_candidates: candidates.len(),
            allow_repeats,
            parameters: model.len(),
        })
    }

    /// Criterion of the search.
    pub fn evaluator(&self) -> &CriterionEvaluator {
        &self.evaluator
    }

    /// Number of run positions.
    pub fn n_trials(&self) -> usize {
        self.position_blocks.len()
    }

    /// Runs a single search from a random initial design.
    pub fn run(&self, rng: &mut StdRng) -> Result<ExchangeOutcome> {
        let start = Instant::now();
        let (mut rows, mut design_t) = self.initial_design(rng)?;
        let mut rank = InformationMatrix::rank_of(&design_t);
        debug!("initial design has rank {rank} of {}", self.parameters);
        if rank < self.parameters {
            rank = self.repair(&mut rows, &mut design_t);
            debug!("repaired design has rank {rank} of {}", self.parameters);
        }
        if rank < self.parameters {
            return Ok(self.singular_outcome(rows, rank));
        }

        let mut info = InformationMatrix::from_rows(&design_t)?;
        let mut value = self.evaluator.value(&info);
        let mut trajectory = vec![value];
        let mut passes = 0;
        let mut commits = 0;
        let convergence = loop {
            let timed_out = self
                .criteria
                .time_limit
                .is_some_and(|limit| start.elapsed() >= limit);
            if passes >= self.criteria.max_passes || timed_out {
                break Convergence::Capped;
            }
            passes += 1;

            let Some((pos, k, delta)) = self.best_exchange(&info, &rows, &design_t) else {
                break Convergence::Converged;
            };
            if !self.evaluator.improves(delta, self.criteria.tolerance) {
                break Convergence::Converged;
            }

            let pool = &self.pools[self.position_blocks[pos]];
            let v_out = Mat::from_fn(self.parameters, 1, |r, _| design_t[(r, pos)]);
            let v_in = Mat::from_fn(self.parameters, 1, |r, _| pool.basis[(r, k)]);
            if let Err(err) = info.swap(&v_out, &v_in) {
                warn!("rejected exchange at position {pos}: {err}");
                break Convergence::Converged;
            }
            rows[pos] = pool.candidates[k];
            for r in 0..self.parameters {
                design_t[(r, pos)] = v_in[(r, 0)];
            }
            commits += 1;
            if commits % self.criteria.refresh_interval.max(1) == 0 {
                info.refresh(&design_t)?;
            }
            value = self.evaluator.value(&info);
            trace!(
                "pass {passes}: position {pos} takes candidate {}, {} = {value:.6e}",
                rows[pos],
                self.evaluator.criterion()
            );
            trajectory.push(value);
        };
        if convergence == Convergence::Capped {
            warn!(
                "exchange search capped after {passes} passes and {:?}",
                start.elapsed()
            );
        }

        Ok(ExchangeOutcome {
            rows,
            value,
            log_det: info.log_det(),
            score: self.evaluator.score(&info),
            rank,
            estimable: true,
            passes,
            convergence,
            trajectory,
            info: Some(info),
        })
    }

    fn singular_outcome(&self, rows: Vec<usize>, rank: usize) -> ExchangeOutcome {
        ExchangeOutcome {
            rows,
            value: self.evaluator.singular_value(),
            log_det: f64::NEG_INFINITY,
            score: self.evaluator.singular_score(),
            rank,
            estimable: false,
            passes: 0,
            convergence: Convergence::Converged,
            trajectory: vec![],
            info: None,
        }
    }

    /// Fills fixed positions with their candidates and free positions in random order with
    /// random admitted candidates, preferring those raising the rank of the design.
    fn initial_design(&self, rng: &mut StdRng) -> Result<(Vec<usize>, Mat<f64>)> {
        let n_trials = self.n_trials();
        let mut rows = vec![0; n_trials];
        let mut design_t = self.fixed_design_t.clone();
        let mut counts = vec![0usize; self.n_candidates];
        let mut span = Span::default();

        let mut free = vec![];
        for (pos, fixed) in self.fixed.iter().enumerate() {
            match fixed {
                Some(cand) => {
                    rows[pos] = *cand;
                    counts[*cand] += 1;
                    span.push(&column_of(&design_t, pos));
                }
                None => free.push(pos),
            }
        }
        free.shuffle(rng);

        for pos in free {
            let pool = &self.pools[self.position_blocks[pos]];
            let mut order: Vec<usize> = (0..pool.candidates.len())
                .filter(|k| self.allow_repeats || counts[pool.candidates[*k]] == 0)
                .collect();
            if order.is_empty() {
                return Err(Error::invalid(
                    "n_trials",
                    format!("no unused candidate left for position {pos}"),
                ));
            }
            let k = if span.rank() < self.parameters {
                order.shuffle(rng);
                order
                    .iter()
                    .copied()
                    .find(|k| span.raises(&column_of(&pool.basis, *k)))
                    .unwrap_or(order[0])
            } else {
                order[rng.random_range(0..order.len())]
            };
            let v = column_of(&pool.basis, k);
            span.push(&v);
            for (r, x) in v.iter().enumerate() {
                design_t[(r, pos)] = *x;
            }
            rows[pos] = pool.candidates[k];
            counts[rows[pos]] += 1;
        }
        Ok((rows, design_t))
    }

    /// Exchanges redundant free rows of a singular design for admitted candidates raising the
    /// rank. Returns the rank of the design once it is regular or no single exchange raises
    /// the rank any more.
    fn repair(&self, rows: &mut [usize], design_t: &mut Mat<f64>) -> usize {
        let mut counts = vec![0usize; self.n_candidates];
        rows.iter().for_each(|j| counts[*j] += 1);
        for _ in 0..self.parameters {
            if InformationMatrix::rank_of(design_t) >= self.parameters {
                break;
            }
            let Some((pos, k)) = self.rank_raising_exchange(rows, design_t, &counts) else {
                break;
            };
            let pool = &self.pools[self.position_blocks[pos]];
            counts[rows[pos]] -= 1;
            rows[pos] = pool.candidates[k];
            counts[rows[pos]] += 1;
            for r in 0..self.parameters {
                design_t[(r, pos)] = pool.basis[(r, k)];
            }
            trace!("repair: position {pos} takes candidate {}", rows[pos]);
        }
        InformationMatrix::rank_of(design_t)
    }

    /// Returns the first `(position, pool index)` whose row lies in the span of the other rows
    /// and whose pool holds a candidate outside that span.
    fn rank_raising_exchange(
        &self,
        rows: &[usize],
        design_t: &Mat<f64>,
        counts: &[usize],
    ) -> Option<(usize, usize)> {
        let n_trials = self.n_trials();
        for pos in (0..n_trials).filter(|pos| self.fixed[*pos].is_none()) {
            let mut span = Span::default();
            (0..n_trials)
                .filter(|i| *i != pos)
                .for_each(|i| span.push(&column_of(design_t, i)));
            if span.raises(&column_of(design_t, pos)) {
                continue;
            }
            let pool = &self.pools[self.position_blocks[pos]];
            let found = (0..pool.candidates.len()).find(|k| {
                let cand = pool.candidates[*k];
                cand != rows[pos]
                    && (self.allow_repeats || counts[cand] == 0)
                    && span.raises(&column_of(&pool.basis, *k))
            });
            if let Some(k) = found {
                return Some((pos, k));
            }
        }
        None
    }

    /// Returns the best exchange `(position, pool index, delta)` of a pass.
    fn best_exchange(
        &self,
        info: &InformationMatrix,
        rows: &[usize],
        design_t: &Mat<f64>,
    ) -> Option<(usize, usize, f64)> {
        let inv = info.inverse();
        let weight = self.evaluator.weight_matrix(inv);
        let u_design = inv * design_t;
        let w_design = weight.as_ref().map(|w| w * design_t);

        let projections: Vec<PoolProjection> = self
            .pools
            .iter()
            .map(|pool| PoolProjection::new(pool, inv, weight.as_ref()))
            .collect();

        let mut counts = vec![0usize; self.n_candidates];
        rows.iter().for_each(|j| counts[*j] += 1);

        let mut best: Option<(usize, usize, f64, f64)> = None;
        for pos in (0..self.n_trials()).filter(|pos| self.fixed[*pos].is_none()) {
            let b = self.position_blocks[pos];
            let (pool, proj) = (&self.pools[b], &projections[b]);
            let d_out = col_dot(design_t, pos, &u_design, pos);
            let g_out = w_design
                .as_ref()
                .map_or(0., |wd| col_dot(design_t, pos, wd, pos));
            for (k, cand) in pool.candidates.iter().enumerate() {
                if *cand == rows[pos] || (!self.allow_repeats && counts[*cand] > 0) {
                    continue;
                }
                let moments = SwapMoments {
                    d_in: proj.d_in[k],
                    d_out,
                    d_io: col_dot(&pool.basis, k, &u_design, pos),
                    g_in: proj.g_in[k],
                    g_out,
                    g_io: w_design
                        .as_ref()
                        .map_or(0., |wd| col_dot(&pool.basis, k, wd, pos)),
                };
                let Some(delta) = self.evaluator.swap_delta(&moments) else {
                    continue;
                };
                let gain = self.evaluator.gain(delta);
                if best.is_none_or(|(.., best_gain)| gain > best_gain + TIE_TOL) {
                    best = Some((pos, k, delta, gain));
                }
            }
        }
        best.map(|(pos, k, delta, _)| (pos, k, delta))
    }
}

/// Variance functions of all candidates of a pool under the current inverse.
struct PoolProjection {
    d_in: Vec<f64>,
    g_in: Vec<f64>,
}

impl PoolProjection {
    fn new(pool: &Pool, inv: &Mat<f64>, weight: Option<&Mat<f64>>) -> Self {
        let u = inv * &pool.basis;
        let m = pool.candidates.len();
        let d_in = (0..m).map(|k| col_dot(&pool.basis, k, &u, k)).collect();
        let g_in = match weight {
            Some(w) => {
                let wu = w * &pool.basis;
                (0..m).map(|k| col_dot(&pool.basis, k, &wu, k)).collect()
            }
            None => vec![0.; m],
        };
        Self { d_in, g_in }
    }
}

fn column_of(mat: &Mat<f64>, col: usize) -> Vec<f64> {
    (0..mat.nrows()).map(|r| mat[(r, col)]).collect()
}

/// Orthonormal basis of the span of the rows placed so far.
#[derive(Default)]
struct Span {
    basis: Vec<Vec<f64>>,
}

impl Span {
    fn rank(&self) -> usize {
        self.basis.len()
    }

    fn residual(&self, v: &[f64]) -> Vec<f64> {
        let mut residual = v.to_vec();
        for q in &self.basis {
            let proj: f64 = q.iter().zip(&residual).map(|(a, b)| a * b).sum();
            residual.iter_mut().zip(q).for_each(|(r, a)| *r -= proj * a);
        }
        residual
    }

    fn raises(&self, v: &[f64]) -> bool {
        let norm: f64 = v.iter().map(|x| x * x).sum();
        let residual: f64 = self.residual(v).iter().map(|x| x * x).sum();
        norm > 0. && residual > RANK_TOL * norm
    }

    fn push(&mut self, v: &[f64]) {
        if self.raises(v) {
            let residual = self.residual(v);
            let norm = residual.iter().map(|x| x * x).sum::<f64>().sqrt();
            self.basis.push(residual.iter().map(|x| x / norm).collect());
        }
    }
}
