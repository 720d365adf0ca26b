use crate::{CandidateSet, Error, Result, candidate::LEVEL_EPS};

/// Single block of run positions.
#[derive(Debug, Clone, PartialEq)]
struct Block {
    size: usize,
    whole_plot: Vec<(usize, f64)>,
}

/// Partition of the run positions of a design into consecutive blocks.
///
/// A block may be bound to whole-plot settings `(factor, level)`: every run of the block then
/// shares these coordinates, which models hard-to-change factors of a split-plot experiment.
///
/// ```
/// use exdesign::BlockStructure;
///
/// let blocks = BlockStructure::split_plot(vec![2, 3], 0, vec![-1., 1.]).unwrap();
/// assert_eq!(blocks.n_trials(), 5);
/// assert_eq!(blocks.position_blocks(), vec![0, 0, 1, 1, 1]);
/// assert!(blocks.admits(1, &[1., -1.]));
/// assert!(!blocks.admits(1, &[-1., -1.]));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStructure {
    blocks: Vec<Block>,
}

impl BlockStructure {
    /// Creates blocks of the given sizes without whole-plot settings.
    pub fn new(sizes: Vec<usize>) -> Result<Self> {
        if sizes.is_empty() {
            return Err(Error::invalid("blocks", "at least one block is required"));
        }
        if let Some(b) = sizes.iter().position(|s| *s == 0) {
            return Err(Error::invalid("blocks", format!("block {b} has size zero")));
        }
        let blocks = sizes
            .into_iter()
            .map(|size| Block {
                size,
                whole_plot: vec![],
            })
            .collect();
        Ok(Self { blocks })
    }

    /// Returns the structure with all runs of `block` fixing `factor` to `level`.
    pub fn with_whole_plot(mut self, block: usize, factor: usize, level: f64) -> Result<Self> {
        let n_blocks = self.n_blocks();
        let Some(b) = self.blocks.get_mut(block) else {
            return Err(Error::invalid(
                "blocks",
                format!("block {block} is out of range for {n_blocks} blocks"),
            ));
        };
        if b.whole_plot.iter().any(|(f, _)| *f == factor) {
            return Err(Error::invalid(
                "blocks",
                format!("block {block} already fixes factor {factor}"),
            ));
        }
        b.whole_plot.push((factor, level));
        Ok(self)
    }

    /// Creates a split-plot structure where block `b` fixes the hard-to-change `factor` to
    /// `levels[b]`.
    pub fn split_plot(sizes: Vec<usize>, factor: usize, levels: Vec<f64>) -> Result<Self> {
        if sizes.len() != levels.len() {
            return Err(Error::ShapeMismatch {
                mat1: "sizes",
                mat2: "levels",
                dim1: 0,
                dim2: 0,
                shape1: (sizes.len(), 1),
                shape2: (levels.len(), 1),
            });
        }
        levels
            .into_iter()
            .enumerate()
            .try_fold(Self::new(sizes)?, |blocks, (b, level)| {
                blocks.with_whole_plot(b, factor, level)
            })
    }

    /// Number of blocks.
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Total number of runs over all blocks.
    pub fn n_trials(&self) -> usize {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// Number of runs of `block`.
    pub fn size(&self, block: usize) -> usize {
        self.blocks[block].size
    }

    /// Whole-plot settings `(factor, level)` of `block`.
    pub fn whole_plot(&self, block: usize) -> &[(usize, f64)] {
        &self.blocks[block].whole_plot
    }

    /// Block index of every run position, blocks laid out consecutively.
    pub fn position_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(b, block)| std::iter::repeat_n(b, block.size))
            .collect()
    }

    /// Returns true if a point with coded settings `point` may be placed into `block`.
    pub fn admits(&self, block: usize, point: &[f64]) -> bool {
        self.blocks[block]
            .whole_plot
            .iter()
            .all(|(f, level)| point.get(*f).is_some_and(|x| (x - level).abs() <= LEVEL_EPS))
    }

    /// Checks the whole-plot settings against the factors of a candidate set.
    pub(crate) fn validate(&self, candidates: &CandidateSet) -> Result<()> {
        for (b, block) in self.blocks.iter().enumerate() {
            for (f, level) in &block.whole_plot {
                let Some(factor) = candidates.factors().get(*f) else {
                    return Err(Error::invalid(
                        "blocks",
                        format!(
                            "block {b} references factor {f} of {}",
                            candidates.n_factors()
                        ),
                    ));
                };
                if !factor.has_level(*level) {
                    return Err(Error::invalid(
                        "blocks",
                        format!(
                            "block {b} fixes factor {} to {level}, which is not one of its levels",
                            factor.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_blocks() -> Result<()> {
        let blocks = BlockStructure::new(vec![3, 1, 2])?;
        assert_eq!(blocks.n_blocks(), 3);
        assert_eq!(blocks.n_trials(), 6);
        assert_eq!(blocks.size(2), 2);
        assert_eq!(blocks.position_blocks(), vec![0, 0, 0, 1, 2, 2]);
        assert!(blocks.admits(1, &[0.3, 7.]));
        Ok(())
    }

    #[test]
    fn malformed_sizes() -> Result<()> {
        assert!(matches!(
            BlockStructure::new(vec![]),
            Err(Error::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            BlockStructure::new(vec![2, 0]),
            Err(Error::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            BlockStructure::split_plot(vec![2, 2], 0, vec![1.]),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn whole_plot() -> Result<()> {
        let blocks = BlockStructure::new(vec![2, 2])?
            .with_whole_plot(0, 1, -1.)?
            .with_whole_plot(0, 0, 1.)?;
        assert_eq!(blocks.whole_plot(0), &[(1, -1.), (0, 1.)]);
        assert!(blocks.whole_plot(1).is_empty());
        assert!(blocks.admits(0, &[1., -1.]));
        assert!(!blocks.admits(0, &[1., 1.]));
        assert!(blocks.clone().with_whole_plot(0, 1, 1.).is_err());
        assert!(blocks.with_whole_plot(2, 0, 1.).is_err());
        Ok(())
    }

    #[test]
    fn validate_against_candidates() -> Result<()> {
        let cs = CandidateSet::from_levels(2, 2)?;
        assert!(BlockStructure::split_plot(vec![1, 1], 1, vec![-1., 1.])?.validate(&cs).is_ok());
        assert!(BlockStructure::split_plot(vec![1, 1], 2, vec![-1., 1.])?.validate(&cs).is_err());
        assert!(BlockStructure::split_plot(vec![1, 1], 0, vec![0., 1.])?.validate(&cs).is_err());
        Ok(())
    }
}
