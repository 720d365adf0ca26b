use super::{Optimality, SwapMoments};
use crate::{CandidateSet, Error, InformationMatrix, ModelSpec, Result, information::SINGULARITY_TOL};
use faer::Mat;
use faer_ext::IntoFaer;
use nalgebra::DMatrix;
use rand::{Rng, rngs::StdRng};

#[cfg_attr(doc, katexit::katexit)]
/// I-Optimality is defined as the average prediction variance over the design region,
///
/// $$ I_{opt} := \int f(x)^T \mathcal{M}^{-1} f(x) \, dx = \text{tr}(\mathcal{M}^{-1} B),
/// \quad B = \int f(x) f(x)^T dx, $$
///
/// with moment matrix $B$ of the region. A-Optimality is the special case $B = I$.
///
/// With the Woodbury core $K$ and the projections $G$ on $W = \mathcal{M}^{-1} B
/// \mathcal{M}^{-1}$,
///
/// $$ K = \begin{pmatrix} 1 + d_{in} & d_{io} \\ d_{io} & d_{out} - 1 \end{pmatrix}, \quad
/// G = \begin{pmatrix} g_{in} & g_{io} \\ g_{io} & g_{out} \end{pmatrix}, $$
///
/// a row exchange changes the criterion by $-\text{tr}(K^{-1} G)$.
#[derive(Debug, Clone)]
pub struct IOptimality {
    moments: Mat<f64>,
}

impl IOptimality {
    /// Instantizes [IOptimality] with a square and symmetric moment matrix.
    pub fn new(moments: Mat<f64>) -> Result<Self> {
        let (nrows, ncols) = (moments.nrows(), moments.ncols());
        if nrows != ncols {
            return Err(Error::ShapeMismatch {
                mat1: "moments",
                mat2: "moments",
                dim1: 0,
                dim2: 1,
                shape1: (nrows, ncols),
                shape2: (nrows, ncols),
            });
        }
        for i in 0..nrows {
            for j in 0..i {
                let (a, b) = (moments[(i, j)], moments[(j, i)]);
                if (a - b).abs() > 1e-10 * (1. + a.abs().max(b.abs())) {
                    return Err(Error::invalid("moments", "moment matrix is not symmetric"));
                }
            }
        }
        Ok(Self { moments })
    }

    /// Instantizes the A-criterion.
    pub fn identity(parameters: usize) -> Self {
        Self {
            moments: Mat::<f64>::identity(parameters, parameters),
        }
    }

    /// Moment matrix B.
    pub fn moments(&self) -> &Mat<f64> {
        &self.moments
    }
}

impl Optimality for IOptimality {
    fn value(&self, info: &InformationMatrix) -> f64 {
        (info.inverse() * &self.moments)
            .diagonal()
            .column_vector()
            .sum()
    }

    fn swap_delta(&self, m: &SwapMoments) -> Option<f64> {
        let ratio = m.det_ratio();
        if ratio <= SINGULARITY_TOL {
            return None;
        }
        // det K = -ratio
        let trace = (m.d_out - 1.) * m.g_in - 2. * m.d_io * m.g_io + (1. + m.d_in) * m.g_out;
        Some(trace / ratio)
    }

    fn weight_matrix(&self, inv: &Mat<f64>) -> Option<Mat<f64>> {
        Some(inv * &self.moments * inv)
    }

    fn maximize(&self) -> bool {
        false
    }
}

/// Estimation of the moment matrix B of the I-criterion.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MomentEstimate {
    /// Average of $f(x) f(x)^T$ over all candidates not taken over from a prior experiment.
    #[default]
    Enumerate,
    /// Monte Carlo average over the given number of candidates drawn with replacement.
    Sample(usize),
    /// User supplied moment matrix.
    Custom(DMatrix<f64>),
}

impl MomentEstimate {
    /// Returns the moment matrix of `model` over the region spanned by `candidates`. Block
    /// contrasts do not contribute to predictions and get zero moments.
    pub fn estimate(
        &self,
        candidates: &CandidateSet,
        model: &ModelSpec,
        rng: &mut StdRng,
    ) -> Result<Mat<f64>> {
        let region: Vec<usize> = (0..candidates.len())
            .filter(|j| !candidates.is_fixed(*j))
            .collect();
        if region.is_empty() {
            return Err(Error::EmptyCandidateSet);
        }
        let points: Vec<usize> = match self {
            MomentEstimate::Enumerate => region,
            MomentEstimate::Sample(0) => {
                return Err(Error::invalid(
                    "moments",
                    "monte carlo estimate needs at least one sample",
                ));
            }
            MomentEstimate::Sample(m) => (0..*m)
                .map(|_| region[rng.random_range(0..region.len())])
                .collect(),
            MomentEstimate::Custom(moments) => {
                let p = model.len();
                if moments.shape() != (p, p) {
                    return Err(Error::ShapeMismatch {
                        mat1: "moments",
                        mat2: "model",
                        dim1: 0,
                        dim2: 0,
                        shape1: moments.shape(),
                        shape2: (p, p),
                    });
                }
                return Ok(moments.view_range(.., ..).into_faer().to_owned());
            }
        };
        let mut moments = Mat::<f64>::zeros(model.len(), model.len());
        for j in &points {
            let x: Vec<f64> = candidates.points().column(*j).iter().copied().collect();
            let f = model.feature_vec(&x, None);
            moments += &f * f.transpose();
        }
        Ok((1. / points.len() as f64) * &moments)
    }
}
