#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
mod blocks;
mod candidate;
mod error;
mod exchange;
mod information;
mod model;
mod optimal_design;
mod optimality;

pub use blocks::BlockStructure;
pub use candidate::{CandidateSet, Factor};
pub use error::{Error, Result};
pub use exchange::{Convergence, ExchangeCriteria, ExchangeOptimizer, ExchangeOutcome};
pub use information::InformationMatrix;
pub use model::{ModelSpec, Term};
pub use optimal_design::{Design, OptimalDesign, RepeatSummary};
pub use optimality::{
    Criterion, CriterionEvaluator, DOptimality, Efficiencies, IOptimality, MomentEstimate,
    Optimality, SwapMoments,
};
