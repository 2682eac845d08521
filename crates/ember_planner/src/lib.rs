pub mod plan;
pub mod planner;

pub use plan::*;
pub use planner::Planner;
