use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};

pub(crate) const LEVEL_EPS: f64 = 1e-12;

/// Experimental factor with its discrete set of coded levels.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    /// Name used in design tables and model column names.
    pub name: String,
    /// Coded levels, e.g. `[-1, 1]` or `[-1, 0, 1]`.
    pub levels: Vec<f64>,
    range: Option<(f64, f64)>,
}

impl Factor {
    /// Creates a factor with explicit coded levels.
    pub fn new(name: impl Into<String>, levels: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            levels,
            range: None,
        }
    }

    /// Creates a factor with levels `{-1, +1}`.
    pub fn two_level(name: impl Into<String>) -> Self {
        Self::new(name, vec![-1., 1.])
    }

    /// Creates a factor with levels `{-1, 0, +1}`.
    pub fn three_level(name: impl Into<String>) -> Self {
        Self::new(name, vec![-1., 0., 1.])
    }

    /// Creates a factor with `n` evenly spaced coded levels in `[-1, 1]`. A single level is
    /// placed at the center.
    pub fn coded(name: impl Into<String>, n: usize) -> Self {
        let levels = match n {
            0 => vec![],
            1 => vec![0.],
            _ => (0..n)
                .map(|i| -1. + 2. * i as f64 / (n as f64 - 1.))
                .collect(),
        };
        Self::new(name, levels)
    }

    /// Returns the factor with a natural-unit range, where coded `-1` maps to `low` and coded
    /// `+1` maps to `high`.
    pub fn with_range(mut self, low: f64, high: f64) -> Self {
        self.range = Some((low, high));
        self
    }

    /// Decodes a coded value into natural units. Without a range the coded value is returned.
    pub fn decode(&self, coded: f64) -> f64 {
        match self.range {
            Some((low, high)) => 0.5 * (high + low) + coded * 0.5 * (high - low),
            None => coded,
        }
    }

    pub(crate) fn has_level(&self, value: f64) -> bool {
        self.levels.iter().any(|l| (l - value).abs() <= LEVEL_EPS)
    }
}

/// Pool of feasible treatment combinations the exchange search draws design rows from.
///
/// Points are stored column-orientated: column `j` holds the coded factor levels of candidate
/// `j`. Candidates taken over from a prior experiment are flagged fixed; they are never drawn
/// into free design positions.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    factors: Vec<Factor>,
    points: DMatrix<f64>,
    fixed: Vec<bool>,
    weights: DVector<f64>,
}

impl CandidateSet {
    /// Creates the full factorial, i.e. the cartesian product of all factor level sets. The
    /// first factor varies slowest.
    pub fn full_factorial(factors: Vec<Factor>) -> Result<Self> {
        if factors.is_empty() {
            return Err(Error::invalid("factors", "at least one factor is required"));
        }
        if let Some(factor) = factors.iter().position(|f| f.levels.is_empty()) {
            return Err(Error::EmptyLevelSet { factor });
        }
        let x = vec![0.; factors.len()];
        let points_vec = Self::build_points(&factors, x, 0);
        let points = DMatrix::from_fn(factors.len(), points_vec.len(), |f, j| points_vec[j][f]);
        let size = points.ncols();
        Ok(Self {
            factors,
            points,
            fixed: vec![false; size],
            weights: DVector::from_element(size, 1.),
        })
    }

    /// Creates the full factorial of `n_factors` factors named `A`, `B`, ... with `n_levels`
    /// evenly spaced coded levels each.
    pub fn from_levels(n_levels: usize, n_factors: usize) -> Result<Self> {
        let factors = (0..n_factors)
            .map(|f| Factor::coded(factor_name(f), n_levels))
            .collect();
        Self::full_factorial(factors)
    }

    /// Creates a candidate set from an explicit list of feasible points (one column per point).
    /// Every value has to be a level of its factor.
    pub fn from_points(factors: Vec<Factor>, points: DMatrix<f64>) -> Result<Self> {
        if let Some(factor) = factors.iter().position(|f| f.levels.is_empty()) {
            return Err(Error::EmptyLevelSet { factor });
        }
        if points.nrows() != factors.len() {
            return Err(Error::ShapeMismatch {
                mat1: "points",
                mat2: "factors",
                dim1: 0,
                dim2: 0,
                shape1: points.shape(),
                shape2: (factors.len(), 1),
            });
        }
        if points.ncols() == 0 {
            return Err(Error::EmptyCandidateSet);
        }
        for (j, point) in points.column_iter().enumerate() {
            for (f, value) in point.iter().enumerate() {
                if !factors[f].has_level(*value) {
                    return Err(Error::invalid(
                        "points",
                        format!(
                            "candidate {j} sets factor {} to {value}, which is not one of its levels",
                            factors[f].name
                        ),
                    ));
                }
            }
        }
        let size = points.ncols();
        Ok(Self {
            factors,
            points,
            fixed: vec![false; size],
            weights: DVector::from_element(size, 1.),
        })
    }

    fn build_points(factors: &[Factor], mut x: Vec<f64>, d: usize) -> Vec<Vec<f64>> {
        if d < factors.len() {
            let mut vec: Vec<Vec<f64>> = vec![];
            for level in &factors[d].levels {
                x[d] = *level;
                vec.extend(Self::build_points(factors, x.clone(), d + 1));
            }
            vec
        } else {
            vec![x]
        }
    }

    /// Returns a candidate set with the runs of a prior experiment prepended and flagged fixed.
    ///
    /// Prior run `i` becomes candidate `i`, former candidate `j` becomes candidate
    /// `j + prior.ncols()`. Prior runs may lie off the level grid but have to be finite.
    pub fn augment(&self, prior: &DMatrix<f64>) -> Result<Self> {
        if let Some((idx, x)) = prior.iter().enumerate().find(|(_, x)| !x.is_finite()) {
            return Err(Error::invalid(
                "prior",
                format!(
                    "run {} of the prior experiment holds the non-finite value {x}",
                    idx / prior.nrows().max(1)
                ),
            ));
        }
        let prior_weights = DVector::from_element(prior.ncols(), 1.);
        self.prepend(prior, &prior_weights)
    }

    /// Same as [CandidateSet::augment] where the prior experiment is given by row indices into
    /// this candidate set.
    pub fn augment_with_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(row) = rows.iter().find(|r| **r >= self.len()) {
            return Err(Error::invalid(
                "rows",
                format!("row {row} is out of range for {} candidates", self.len()),
            ));
        }
        let prior = DMatrix::from_fn(self.n_factors(), rows.len(), |f, i| {
            self.points[(f, rows[i])]
        });
        let prior_weights = DVector::from_iterator(rows.len(), rows.iter().map(|r| self.weights[*r]));
        self.prepend(&prior, &prior_weights)
    }

    fn prepend(&self, prior: &DMatrix<f64>, prior_weights: &DVector<f64>) -> Result<Self> {
        if prior.nrows() != self.n_factors() {
            return Err(Error::ShapeMismatch {
                mat1: "prior",
                mat2: "points",
                dim1: 0,
                dim2: 0,
                shape1: prior.shape(),
                shape2: self.points.shape(),
            });
        }
        let m = prior.ncols();
        let points = DMatrix::from_fn(self.n_factors(), m + self.len(), |f, j| {
            if j < m {
                prior[(f, j)]
            } else {
                self.points[(f, j - m)]
            }
        });
        let mut fixed = vec![true; m];
        fixed.extend_from_slice(&self.fixed);
        let weights = DVector::from_iterator(
            m + self.len(),
            prior_weights.iter().chain(self.weights.iter()).copied(),
        );
        Ok(Self {
            factors: self.factors.clone(),
            points,
            fixed,
            weights,
        })
    }

    /// Returns the candidate set with per-candidate weights scaling each candidate's
    /// contribution to the information matrix.
    pub fn with_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.len() {
            return Err(Error::ShapeMismatch {
                mat1: "weights",
                mat2: "points",
                dim1: 0,
                dim2: 1,
                shape1: (weights.len(), 1),
                shape2: self.points.shape(),
            });
        }
        if let Some(j) = weights.iter().position(|w| !w.is_finite() || *w <= 0.) {
            return Err(Error::invalid(
                "weights",
                format!("weight of candidate {j} is {}, but has to be positive", weights[j]),
            ));
        }
        self.weights = DVector::from_vec(weights);
        Ok(self)
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.points.ncols()
    }

    /// Returns true if the set holds no candidate.
    pub fn is_empty(&self) -> bool {
        self.points.ncols() == 0
    }

    /// Number of factors.
    pub fn n_factors(&self) -> usize {
        self.factors.len()
    }

    /// Factors of the candidate set.
    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Column-orientated matrix of coded candidate points.
    pub fn points(&self) -> &DMatrix<f64> {
        &self.points
    }

    /// Coded factor levels of candidate `j`.
    pub fn point(&self, j: usize) -> DVector<f64> {
        self.points.column(j).into_owned()
    }

    /// Returns true if candidate `j` stems from a prior experiment.
    pub fn is_fixed(&self, j: usize) -> bool {
        self.fixed[j]
    }

    /// Indices of all candidates stemming from a prior experiment.
    pub fn fixed_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|j| self.fixed[*j]).collect()
    }

    /// Weight of candidate `j`.
    pub fn weight(&self, j: usize) -> f64 {
        self.weights[j]
    }

    /// Factor settings of candidate `j` in natural units.
    pub fn decode(&self, j: usize) -> DVector<f64> {
        DVector::from_iterator(
            self.n_factors(),
            self.factors
                .iter()
                .enumerate()
                .map(|(f, factor)| factor.decode(self.points[(f, j)])),
        )
    }
}

/// Spreadsheet style factor name: `A`..`Z`, `AA`, `AB`, ...
pub(crate) fn factor_name(mut idx: usize) -> String {
    let mut name = vec![];
    loop {
        name.push((b'A' + (idx % 26) as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    name.iter().rev().collect()
}
