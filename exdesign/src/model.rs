use crate::{CandidateSet, Error, Factor, Result, candidate::factor_name};
use faer::Mat;

/// Single term of a [ModelSpec].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Term {
    /// Constant column.
    Intercept,
    /// Coded value of a factor.
    Main(usize),
    /// Product of two distinct factors.
    Interaction(usize, usize),
    /// Squared coded value of a factor.
    Quadratic(usize),
    /// Fixed block effect of a block factor with the given number of levels, expanded into
    /// `levels - 1` sum-to-zero contrast columns.
    Block(usize),
}

impl Term {
    fn kind_rank(&self) -> u8 {
        match self {
            Term::Intercept => 0,
            Term::Main(_) => 1,
            Term::Interaction(..) => 2,
            Term::Quadratic(_) => 3,
            Term::Block(_) => 4,
        }
    }

    /// Number of model matrix columns of this term.
    pub fn columns(&self) -> usize {
        match self {
            Term::Block(levels) => levels.saturating_sub(1),
            _ => 1,
        }
    }

    fn normalized(&self) -> Term {
        match *self {
            Term::Interaction(a, b) if a > b => Term::Interaction(b, a),
            t => t,
        }
    }
}

#[cfg_attr(doc, katexit::katexit)]
/// Model specification defining the feature map $f:\mathbb R^k \to\mathbb R^p$ of a linear model
/// $y = f(x)^T \beta$.
///
/// The specification is a plain list of tagged terms, built once before the search. Terms are
/// kept in canonical column order: intercept, main effects, interactions, quadratic terms and
/// block contrasts, each kind in declaration order.
///
/// ```
/// use exdesign::{ModelSpec, Term};
///
/// // 1 + A + B + A:B + A^2
/// let model = ModelSpec::linear(2)
///     .with_quadratic(0)
///     .with_interaction(0, 1);
///
/// assert_eq!(model.len(), 5);
/// assert_eq!(model.terms()[3], Term::Interaction(0, 1));
/// assert_eq!(model.feature_vec(&[2., 3.], None)[(3, 0)], 6.);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSpec {
    terms: Vec<Term>,
}

impl ModelSpec {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intercept and all main effects of `k` factors.
    pub fn linear(k: usize) -> Self {
        (0..k).fold(Self::new().with_intercept(), |m, f| m.with_main(f))
    }

    /// Linear model extended by all two-factor interactions.
    pub fn interactions(k: usize) -> Self {
        let mut model = Self::linear(k);
        for a in 0..k {
            for b in (a + 1)..k {
                model.push(Term::Interaction(a, b));
            }
        }
        model
    }

    /// Full second order model: interactions model extended by all quadratic terms.
    pub fn quadratic(k: usize) -> Self {
        (0..k).fold(Self::interactions(k), |m, f| m.with_quadratic(f))
    }

    /// Adds a term at its canonical position.
    pub fn push(&mut self, term: Term) {
        let term = term.normalized();
        let pos = self
            .terms
            .iter()
            .rposition(|t| t.kind_rank() <= term.kind_rank())
            .map_or(0, |p| p + 1);
        self.terms.insert(pos, term);
    }

    /// Returns model with intercept.
    pub fn with_intercept(mut self) -> Self {
        self.push(Term::Intercept);
        self
    }

    /// Returns model with main effect of factor `f`.
    pub fn with_main(mut self, f: usize) -> Self {
        self.push(Term::Main(f));
        self
    }

    /// Returns model with interaction of factors `a` and `b`.
    pub fn with_interaction(mut self, a: usize, b: usize) -> Self {
        self.push(Term::Interaction(a, b));
        self
    }

    /// Returns model with quadratic term of factor `f`.
    pub fn with_quadratic(mut self, f: usize) -> Self {
        self.push(Term::Quadratic(f));
        self
    }

    /// Returns model with a block effect over `levels` blocks.
    pub fn with_blocks(mut self, levels: usize) -> Self {
        self.push(Term::Block(levels));
        self
    }

    /// Terms in canonical column order.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Number of model matrix columns p.
    pub fn len(&self) -> usize {
        self.terms.iter().map(Term::columns).sum()
    }

    /// Returns true if the model has no column.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the model declares a block effect.
    pub fn has_blocks(&self) -> bool {
        self.terms.iter().any(|t| matches!(t, Term::Block(_)))
    }

    /// Checks the model against the number of factors and blocks of a search.
    pub fn validate(&self, n_factors: usize, n_blocks: usize) -> Result<()> {
        if self.is_empty() {
            return Err(Error::invalid("model", "the model has no column"));
        }
        for (idx, term) in self.terms.iter().enumerate() {
            if self.terms[..idx].contains(term) {
                return Err(Error::invalid("model", format!("term {term:?} is declared twice")));
            }
            let factors: Vec<usize> = match term {
                Term::Main(f) | Term::Quadratic(f) => vec![*f],
                Term::Interaction(a, b) => {
                    if a == b {
                        return Err(Error::invalid(
                            "model",
                            format!("interaction of factor {a} with itself, use a quadratic term"),
                        ));
                    }
                    vec![*a, *b]
                }
                Term::Block(levels) => {
                    if *levels < 2 || *levels != n_blocks {
                        return Err(Error::invalid(
                            "model",
                            format!(
                                "block term with {levels} levels does not match a structure of {n_blocks} blocks"
                            ),
                        ));
                    }
                    vec![]
                }
                Term::Intercept => vec![],
            };
            if let Some(f) = factors.iter().find(|f| **f >= n_factors) {
                return Err(Error::invalid(
                    "model",
                    format!("term {term:?} references factor {f} of {n_factors}"),
                ));
            }
        }
        if self.terms.iter().filter(|t| matches!(t, Term::Block(_))).count() > 1 {
            return Err(Error::invalid("model", "at most one block term is supported"));
        }
        Ok(())
    }

    /// Column names, e.g. `(Intercept)`, `A`, `A:B`, `A^2`, `Block1`.
    pub fn column_names(&self, factors: &[Factor]) -> Vec<String> {
        let name = |f: usize| {
            factors
                .get(f)
                .map_or_else(|| factor_name(f), |factor| factor.name.clone())
        };
        self.terms
            .iter()
            .flat_map(|term| match *term {
                Term::Intercept => vec!["(Intercept)".to_string()],
                Term::Main(f) => vec![name(f)],
                Term::Interaction(a, b) => vec![format!("{}:{}", name(a), name(b))],
                Term::Quadratic(f) => vec![format!("{}^2", name(f))],
                Term::Block(levels) => (1..levels).map(|b| format!("Block{b}")).collect(),
            })
            .collect()
    }

    /// Returns the feature map $f(x)$ as a column matrix. `block` is the block index of the run
    /// position; without block the block contrast columns are zero.
    pub fn feature_vec(&self, x: &[f64], block: Option<usize>) -> Mat<f64> {
        let mut feature_vec = Mat::<f64>::zeros(self.len(), 1);
        let mut row = 0;
        for term in &self.terms {
            match *term {
                Term::Intercept => feature_vec[(row, 0)] = 1.,
                Term::Main(f) => feature_vec[(row, 0)] = x[f],
                Term::Interaction(a, b) => feature_vec[(row, 0)] = x[a] * x[b],
                Term::Quadratic(f) => feature_vec[(row, 0)] = x[f] * x[f],
                Term::Block(levels) => {
                    if let Some(b) = block {
                        for c in 0..levels.saturating_sub(1) {
                            feature_vec[(row + c, 0)] = block_contrast(b, c, levels);
                        }
                    }
                }
            }
            row += term.columns();
        }
        feature_vec
    }

    /// Returns the transposed model matrix $X^T$ (p × |indices|) of the given candidates,
    /// where column i holds $\sqrt{w_j} f(x^{(j)})$ for candidate `j = indices[i]`.
    pub fn design_t_of(
        &self,
        candidates: &CandidateSet,
        indices: &[usize],
        block: Option<usize>,
    ) -> Mat<f64> {
        let mut design_t = Mat::<f64>::zeros(self.len(), indices.len());
        design_t
            .col_iter_mut()
            .enumerate()
            .for_each(|(i, mut col)| {
                let j = indices[i];
                let x: Vec<f64> = candidates.points().column(j).iter().copied().collect();
                let scale = candidates.weight(j).sqrt();
                let f = self.feature_vec(&x, block);
                for r in 0..col.nrows() {
                    col[r] = scale * f[(r, 0)];
                }
            });
        design_t
    }

    /// Returns the transposed model matrix $X^T$ of all candidates without block effects.
    pub fn design_t(&self, candidates: &CandidateSet) -> Mat<f64> {
        let indices: Vec<usize> = (0..candidates.len()).collect();
        self.design_t_of(candidates, &indices, None)
    }

    #[cfg_attr(doc, katexit::katexit)]
    /// Returns the information matrix $\mathcal{M} = X^T X = \sum_i f(x^{(i)}) f(x^{(i)})^T$ of
    /// a transposed model matrix.
    pub fn fim_from_design_t(&self, design_t: &Mat<f64>) -> Mat<f64> {
        design_t * design_t.transpose()
    }

    /// Returns the information matrix of a design given by candidate indices, without block
    /// effects.
    pub fn fim(&self, candidates: &CandidateSet, rows: &[usize]) -> Mat<f64> {
        self.fim_from_design_t(&self.design_t_of(candidates, rows, None))
    }
}

/// Sum-to-zero contrast: block `b < levels - 1` is the unit vector `e_b`, the last block is
/// `-1` in every column.
fn block_contrast(b: usize, column: usize, levels: usize) -> f64 {
    if b == levels - 1 {
        -1.
    } else if b == column {
        1.
    } else {
        0.
    }
}
