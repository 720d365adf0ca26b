use crate::{CriterionEvaluator, Error, Result, optimality::SwapMoments};
use faer::{Mat, Side, linalg::solvers::DenseSolveCore};

/// Relative pivot size below which the information matrix is treated as singular.
pub(crate) const SINGULARITY_TOL: f64 = 1e-10;

#[cfg_attr(doc, katexit::katexit)]
/// Information matrix $\mathcal{M} = X^T X$ of an exact design together with its inverse and
/// log-determinant.
///
/// Rows enter as transposed model rows (p × 1 columns). Adding or removing a single row is an
/// $O(p^2)$ Sherman-Morrison update of the inverse,
///
/// $$ (\mathcal{M} \pm v v^T)^{-1} = \mathcal{M}^{-1} \mp \frac{\mathcal{M}^{-1} v v^T
/// \mathcal{M}^{-1}}{1 \pm v^T \mathcal{M}^{-1} v}, $$
///
/// and an exchange of two rows is scored through the rank-2 Woodbury identity without touching
/// the state. Rounding errors accumulate over many updates, so the exchange search calls
/// [InformationMatrix::refresh] periodically.
#[derive(Debug, Clone)]
pub struct InformationMatrix {
    fim: Mat<f64>,
    inv: Mat<f64>,
    log_det: f64,
}

impl InformationMatrix {
    /// Builds the information matrix of the columns of `design_t` from scratch.
    ///
    /// Fails with [Error::NonEstimableModel] if the rows do not span all p parameters.
    pub fn from_rows(design_t: &Mat<f64>) -> Result<Self> {
        let parameters = design_t.nrows();
        let fim = design_t * design_t.transpose();
        let reduction = GivensReduction::of(design_t);
        let rank = reduction.rank(&fim);
        if rank < parameters {
            return Err(Error::NonEstimableModel { rank, parameters });
        }
        let inv = fim.lblt(Side::Lower).inverse();
        Ok(Self {
            fim,
            inv,
            log_det: reduction.log_det(),
        })
    }

    /// Numerical rank of the information matrix of the columns of `design_t`.
    pub fn rank_of(design_t: &Mat<f64>) -> usize {
        let fim = design_t * design_t.transpose();
        GivensReduction::of(design_t).rank(&fim)
    }

    /// Adds row `v` to the design.
    pub fn add_row(&mut self, v: &Mat<f64>) {
        let u = &self.inv * v;
        let d = col_dot(v, 0, &u, 0);
        self.inv -= (1. / (1. + d)) * &u * u.transpose();
        self.fim += v * v.transpose();
        self.log_det += (1. + d).ln();
    }

    /// Removes row `v` from the design. The state is left untouched if the downdate would make
    /// the information matrix (near) singular.
    pub fn remove_row(&mut self, v: &Mat<f64>) -> Result<()> {
        let u = &self.inv * v;
        let pivot = 1. - col_dot(v, 0, &u, 0);
        if pivot < SINGULARITY_TOL {
            return Err(Error::NearSingular {
                pivot,
                tolerance: SINGULARITY_TOL,
            });
        }
        self.inv += (1. / pivot) * &u * u.transpose();
        self.fim -= v * v.transpose();
        self.log_det += pivot.ln();
        Ok(())
    }

    /// Returns the change of the criterion value if row `v_out` was exchanged for `v_in`, or
    /// `None` if the exchange makes the information matrix (near) singular.
    pub fn evaluate_swap_delta(
        &self,
        v_out: &Mat<f64>,
        v_in: &Mat<f64>,
        evaluator: &CriterionEvaluator,
    ) -> Option<f64> {
        let u_in = &self.inv * v_in;
        let u_out = &self.inv * v_out;
        let mut moments = SwapMoments {
            d_in: col_dot(v_in, 0, &u_in, 0),
            d_out: col_dot(v_out, 0, &u_out, 0),
            d_io: col_dot(v_in, 0, &u_out, 0),
            ..Default::default()
        };
        if let Some(w) = evaluator.weight_matrix(&self.inv) {
            let w_in = &w * v_in;
            let w_out = &w * v_out;
            moments.g_in = col_dot(v_in, 0, &w_in, 0);
            moments.g_out = col_dot(v_out, 0, &w_out, 0);
            moments.g_io = col_dot(v_in, 0, &w_out, 0);
        }
        evaluator.swap_delta(&moments)
    }

    /// Exchanges row `v_out` for `v_in`. Either all of the matrix, its inverse and the
    /// log-determinant are updated or none of them.
    pub fn swap(&mut self, v_out: &Mat<f64>, v_in: &Mat<f64>) -> Result<()> {
        let mut next = self.clone();
        next.add_row(v_in);
        next.remove_row(v_out)?;
        *self = next;
        Ok(())
    }

    /// Recomputes the state from the columns of `design_t`.
    pub fn refresh(&mut self, design_t: &Mat<f64>) -> Result<()> {
        *self = Self::from_rows(design_t)?;
        Ok(())
    }

    /// Information matrix.
    pub fn fim(&self) -> &Mat<f64> {
        &self.fim
    }

    /// Inverse of the information matrix.
    pub fn inverse(&self) -> &Mat<f64> {
        &self.inv
    }

    /// Natural logarithm of the determinant.
    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    /// Determinant.
    pub fn det(&self) -> f64 {
        self.log_det.exp()
    }

    /// Number of model parameters p.
    pub fn parameters(&self) -> usize {
        self.fim.nrows()
    }
}

/// Dot product of column `ca` of `a` and column `cb` of `b`.
#[inline(always)]
pub(crate) fn col_dot(a: &Mat<f64>, ca: usize, b: &Mat<f64>, cb: usize) -> f64 {
    let mut sum = 0.;
    for r in 0..a.nrows() {
        sum += a[(r, ca)] * b[(r, cb)];
    }
    sum
}

/// Square-root free Givens reduction $X^T X = R^T D R$ with unit upper triangular R, built row
/// by row.
struct GivensReduction {
    d: Vec<f64>,
}

impl GivensReduction {
    fn of(design_t: &Mat<f64>) -> Self {
        let p = design_t.nrows();
        let mut d = vec![0.; p];
        let mut r = Mat::<f64>::zeros(p, p);
        for col in 0..design_t.ncols() {
            let mut x: Vec<f64> = (0..p).map(|i| design_t[(i, col)]).collect();
            let mut weight = 1.;
            for i in 0..p {
                if weight == 0. {
                    break;
                }
                let xi = x[i];
                if xi == 0. {
                    continue;
                }
                let di = d[i];
                let dp = di + weight * xi * xi;
                let c = di / dp;
                let s = weight * xi / dp;
                weight *= c;
                d[i] = dp;
                for j in (i + 1)..p {
                    let (xj, rij) = (x[j], r[(i, j)]);
                    x[j] = xj - xi * rij;
                    r[(i, j)] = c * rij + s * xj;
                }
            }
        }
        Self { d }
    }

    /// Number of pivots that are not negligible relative to the diagonal of `fim`.
    fn rank(&self, fim: &Mat<f64>) -> usize {
        self.d
            .iter()
            .enumerate()
            .filter(|(i, di)| **di > SINGULARITY_TOL * fim[(*i, *i)] && fim[(*i, *i)] > 0.)
            .count()
    }

    fn log_det(&self) -> f64 {
        self.d.iter().map(|di| di.ln()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    const EQ_EPS: f64 = 1e-9;

    fn max_abs_diff(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
        let mut max = 0f64;
        for j in 0..a.ncols() {
            for i in 0..a.nrows() {
                max = max.max((a[(i, j)] - b[(i, j)]).abs());
            }
        }
        max
    }

    fn rows() -> Mat<f64> {
        // intercept + one factor at -1, 0, 1, 1
        mat![[1., 1., 1., 1.], [-1., 0., 1., 1.]]
    }

    fn column(x: f64) -> Mat<f64> {
        mat![[1.], [x]]
    }

    #[test]
    fn from_rows() -> Result<()> {
        let info = InformationMatrix::from_rows(&rows())?;
        assert_eq!(info.fim(), &mat![[4., 1.], [1., 3.]]);
        assert!((info.det() - 11.).abs() < EQ_EPS);
        assert!((info.log_det() - 11f64.ln()).abs() < EQ_EPS);
        let inv = mat![[3. / 11., -1. / 11.], [-1. / 11., 4. / 11.]];
        assert!(max_abs_diff(info.inverse(), &inv) < EQ_EPS);
        assert_eq!(info.parameters(), 2);
        Ok(())
    }

    #[test]
    fn singular_rows() -> Result<()> {
        let rows = mat![[1., 1., 1.], [1., 1., 1.], [-1., 0., 1.]];
        assert_eq!(InformationMatrix::rank_of(&rows), 2);
        assert_eq!(
            InformationMatrix::from_rows(&rows).map(|_| ()),
            Err(Error::NonEstimableModel {
                rank: 2,
                parameters: 3
            })
        );
        assert_eq!(InformationMatrix::rank_of(&Mat::<f64>::zeros(2, 3)), 0);
        Ok(())
    }

    #[test]
    fn add_and_remove_row() -> Result<()> {
        let mut info = InformationMatrix::from_rows(&rows())?;
        info.add_row(&column(-1.));
        let expected = InformationMatrix::from_rows(&mat![
            [1., 1., 1., 1., 1.],
            [-1., 0., 1., 1., -1.]
        ])?;
        assert!(max_abs_diff(info.fim(), expected.fim()) < EQ_EPS);
        assert!(max_abs_diff(info.inverse(), expected.inverse()) < EQ_EPS);
        assert!((info.log_det() - expected.log_det()).abs() < EQ_EPS);

        info.remove_row(&column(-1.))?;
        let initial = InformationMatrix::from_rows(&rows())?;
        assert!(max_abs_diff(info.inverse(), initial.inverse()) < EQ_EPS);
        assert!((info.log_det() - initial.log_det()).abs() < EQ_EPS);
        Ok(())
    }

    #[test]
    fn remove_row_near_singular() -> Result<()> {
        let mut info = InformationMatrix::from_rows(&mat![[1., 1.], [-1., 1.]])?;
        let before = info.clone();
        assert!(matches!(
            info.remove_row(&column(1.)),
            Err(Error::NearSingular { .. })
        ));
        assert_eq!(info.fim(), before.fim());
        assert_eq!(info.log_det(), before.log_det());
        Ok(())
    }

    #[test]
    fn swap_delta_matches_recomputation() -> Result<()> {
        let info = InformationMatrix::from_rows(&rows())?;
        let after = InformationMatrix::from_rows(&mat![[1., 1., 1., 1.], [-1., -1., 1., 1.]])?;
        let (v_out, v_in) = (column(0.), column(-1.));

        let d_opt = CriterionEvaluator::d();
        let delta = info.evaluate_swap_delta(&v_out, &v_in, &d_opt);
        assert!(delta.is_some_and(|d| (d - (after.det() / info.det() - 1.)).abs() < EQ_EPS));

        let b = mat![[1., 0.], [0., 2. / 3.]];
        let i_opt = CriterionEvaluator::i(b)?;
        let delta = info.evaluate_swap_delta(&v_out, &v_in, &i_opt);
        let expected = i_opt.value(&after) - i_opt.value(&info);
        assert!(delta.is_some_and(|d| (d - expected).abs() < EQ_EPS));
        Ok(())
    }

    #[test]
    fn swap_into_singular_design() -> Result<()> {
        let info = InformationMatrix::from_rows(&mat![[1., 1.], [-1., 1.]])?;
        let delta = info.evaluate_swap_delta(&column(-1.), &column(1.), &CriterionEvaluator::d());
        assert_eq!(delta, None);
        Ok(())
    }

    #[test]
    fn swap_is_atomic() -> Result<()> {
        let mut info = InformationMatrix::from_rows(&mat![[1., 1.], [-1., 1.]])?;
        info.swap(&column(-1.), &column(0.))?;
        let expected = InformationMatrix::from_rows(&mat![[1., 1.], [0., 1.]])?;
        assert!(max_abs_diff(info.inverse(), expected.inverse()) < EQ_EPS);
        assert!((info.log_det() - expected.log_det()).abs() < EQ_EPS);

        let before = info.clone();
        assert!(info.swap(&column(0.), &column(1.)).is_err());
        assert_eq!(info.inverse(), before.inverse());

        info.refresh(&mat![[1., 1.], [1., -1.]])?;
        assert!((info.det() - 4.).abs() < EQ_EPS);
        Ok(())
    }
}
