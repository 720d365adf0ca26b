mod d_opt;
mod i_opt;
use crate::{CandidateSet, InformationMatrix, ModelSpec, Result};
pub use d_opt::DOptimality;
pub use i_opt::{IOptimality, MomentEstimate};
use faer::Mat;
use rand::rngs::StdRng;
use std::{fmt::Display, sync::Arc};

/// Optimality criterion of the exchange search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Criterion {
    /// Maximize the determinant of the information matrix.
    #[default]
    D,
    /// Minimize the average prediction variance over the design region.
    I,
    /// Minimize the trace of the inverse information matrix.
    A,
}

impl Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Criterion::D => "D",
            Criterion::I => "I",
            Criterion::A => "A",
        };
        write!(f, "{name}")
    }
}

#[cfg_attr(doc, katexit::katexit)]
/// Quadratic forms of a row exchange $v_{out} \to v_{in}$ with respect to the current inverse
/// information matrix and, for trace criteria, its weight matrix $W = \mathcal{M}^{-1} B
/// \mathcal{M}^{-1}$.
///
/// $$ d_{in} = v_{in}^T \mathcal{M}^{-1} v_{in}, \quad d_{out} = v_{out}^T \mathcal{M}^{-1}
/// v_{out}, \quad d_{io} = v_{in}^T \mathcal{M}^{-1} v_{out} $$
///
/// and $g_{in}, g_{out}, g_{io}$ analogously with $W$.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SwapMoments {
    /// Variance function of the incoming row.
    pub d_in: f64,
    /// Variance function of the outgoing row.
    pub d_out: f64,
    /// Cross term of both rows.
    pub d_io: f64,
    /// Weighted variance of the incoming row.
    pub g_in: f64,
    /// Weighted variance of the outgoing row.
    pub g_out: f64,
    /// Weighted cross term of both rows.
    pub g_io: f64,
}

impl SwapMoments {
    /// Ratio of the determinants after and before the exchange.
    pub fn det_ratio(&self) -> f64 {
        (1. + self.d_in) * (1. - self.d_out) + self.d_io * self.d_io
    }
}

/// Defines an optimality criterion of exact designs, evaluated on an [InformationMatrix].
pub trait Optimality {
    /// Criterion value of the current design.
    fn value(&self, info: &InformationMatrix) -> f64;
    /// Change of the criterion value of a row exchange, `None` if the exchange leaves the
    /// information matrix (near) singular.
    fn swap_delta(&self, moments: &SwapMoments) -> Option<f64>;
    /// Weight matrix $W$ of the trace criteria, `None` if the criterion does not need one.
    fn weight_matrix(&self, inv: &Mat<f64>) -> Option<Mat<f64>>;
    /// Returns true if larger values are better.
    fn maximize(&self) -> bool;
    /// Strictly monotone transform of [Optimality::value] ranking designs, finite for every
    /// regular design.
    fn score(&self, info: &InformationMatrix) -> f64 {
        self.value(info)
    }
}

/// Criterion of an exchange search together with its precomputed moment matrix.
#[derive(Clone)]
pub struct CriterionEvaluator {
    criterion: Criterion,
    optimality: Arc<dyn Optimality + Send + Sync>,
    moments: Option<Mat<f64>>,
}

impl std::fmt::Debug for CriterionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriterionEvaluator")
            .field("criterion", &self.criterion)
            .field("moments", &self.moments)
            .finish()
    }
}

impl CriterionEvaluator {
    /// D-criterion.
    pub fn d() -> Self {
        Self {
            criterion: Criterion::D,
            optimality: Arc::new(DOptimality),
            moments: None,
        }
    }

    /// I-criterion with the given moment matrix.
    pub fn i(moments: Mat<f64>) -> Result<Self> {
        let optimality = IOptimality::new(moments.clone())?;
        Ok(Self {
            criterion: Criterion::I,
            optimality: Arc::new(optimality),
            moments: Some(moments),
        })
    }

    /// A-criterion of a model with `parameters` columns.
    pub fn a(parameters: usize) -> Self {
        let moments = Mat::<f64>::identity(parameters, parameters);
        Self {
            criterion: Criterion::A,
            optimality: Arc::new(IOptimality::identity(parameters)),
            moments: Some(moments),
        }
    }

    /// Creates the evaluator of `criterion`. The moment matrix of the I-criterion is estimated
    /// once from the candidate set.
    pub fn new(
        criterion: Criterion,
        estimate: &MomentEstimate,
        candidates: &CandidateSet,
        model: &ModelSpec,
        rng: &mut StdRng,
    ) -> Result<Self> {
        match criterion {
            Criterion::D => Ok(Self::d()),
            Criterion::I => Self::i(estimate.estimate(candidates, model, rng)?),
            Criterion::A => Ok(Self::a(model.len())),
        }
    }

    /// Criterion.
    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    /// Moment matrix B of the trace criteria.
    pub fn moments(&self) -> Option<&Mat<f64>> {
        self.moments.as_ref()
    }

    /// Criterion value of the current design.
    pub fn value(&self, info: &InformationMatrix) -> f64 {
        self.optimality.value(info)
    }

    /// Change of the criterion value of a row exchange, see [Optimality::swap_delta].
    pub fn swap_delta(&self, moments: &SwapMoments) -> Option<f64> {
        self.optimality.swap_delta(moments)
    }

    pub(crate) fn weight_matrix(&self, inv: &Mat<f64>) -> Option<Mat<f64>> {
        self.optimality.weight_matrix(inv)
    }

    /// Improvement of a swap delta, positive if the exchange is better for the criterion.
    pub fn gain(&self, delta: f64) -> f64 {
        if self.optimality.maximize() {
            delta
        } else {
            -delta
        }
    }

    /// Returns true if the swap delta improves the criterion by more than `tolerance`.
    pub fn improves(&self, delta: f64, tolerance: f64) -> bool {
        self.gain(delta) > tolerance
    }

    /// Criterion value of a singular design.
    pub fn singular_value(&self) -> f64 {
        if self.optimality.maximize() {
            0.
        } else {
            f64::INFINITY
        }
    }

    /// Score of the current design, the log-determinant for D and the criterion value for the
    /// trace criteria. Compare scores with [CriterionEvaluator::is_better].
    pub fn score(&self, info: &InformationMatrix) -> f64 {
        self.optimality.score(info)
    }

    /// Score of a singular design.
    pub fn singular_score(&self) -> f64 {
        if self.optimality.maximize() {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        }
    }

    /// Returns true if criterion value or score `a` is strictly better than `b`.
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        if self.optimality.maximize() {
            a > b
        } else {
            a < b
        }
    }
}

#[cfg_attr(doc, katexit::katexit)]
/// Efficiency diagnostics of an exact design.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Efficiencies {
    /// Normalized D-efficiency $\det(\mathcal M)^{1/p} / n$.
    pub d: f64,
    /// Average variance of the estimates $\text{tr}(\mathcal M^{-1}) / p$.
    pub a: f64,
    /// Average prediction variance $\text{tr}(\mathcal M^{-1} B)$, if a moment matrix is known.
    pub i: Option<f64>,
}

impl Efficiencies {
    /// Computes the diagnostics of a design with `n_trials` runs.
    pub fn new(info: &InformationMatrix, n_trials: usize, moments: Option<&Mat<f64>>) -> Self {
        let p = info.parameters() as f64;
        let inv = info.inverse();
        Self {
            d: (info.log_det() / p).exp() / n_trials as f64,
            a: inv.diagonal().column_vector().sum() / p,
            i: moments.map(|b| (inv * b).diagonal().column_vector().sum()),
        }
    }
}
