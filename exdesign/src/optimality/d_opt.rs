use super::{Optimality, SwapMoments};
use crate::{InformationMatrix, information::SINGULARITY_TOL};
use faer::Mat;

#[cfg_attr(doc, katexit::katexit)]
/// D-Optimality is defined as the determinant of the information matrix of an exact design.
///
/// $$ D_{opt} := \det \mathcal{M} $$
///
/// Exchanging row $v_{out}$ for $v_{in}$ scales the determinant by
///
/// $$ \frac{\det \mathcal{M}'}{\det \mathcal{M}} = (1 + d_{in})(1 - d_{out}) + d_{io}^2, $$
///
/// so the swap delta is the relative change of the determinant. Designs are ranked by
/// $\log\det \mathcal M$, which stays finite where the determinant overflows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DOptimality;

impl Optimality for DOptimality {
    fn value(&self, info: &InformationMatrix) -> f64 {
        info.det()
    }

    fn swap_delta(&self, moments: &SwapMoments) -> Option<f64> {
        let ratio = moments.det_ratio();
        (ratio > SINGULARITY_TOL).then(|| ratio - 1.)
    }

    fn weight_matrix(&self, _inv: &Mat<f64>) -> Option<Mat<f64>> {
        None
    }

    fn maximize(&self) -> bool {
        true
    }

    fn score(&self, info: &InformationMatrix) -> f64 {
        info.log_det()
    }
}
