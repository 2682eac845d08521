pub mod eval;
pub mod store;

pub use eval::{eval_scalar, eval_values};
pub use store::{DispatchMode, ExecutionResult, RowOwnership, ShardStore};
