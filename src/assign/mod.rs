pub mod consensus;
pub mod driver;
pub mod filter;
pub mod resolve;

pub use consensus::{assign, ConsensusState};
pub use driver::{Assigner, CancelFlag, RunSummary};
pub use filter::filter_hits;
pub use resolve::LineageResolver;
