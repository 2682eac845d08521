pub mod analyzer;
pub mod param_env;
pub mod parser;
pub mod types;

pub use analyzer::{analyze, classify};
pub use param_env::ParamEnv;
pub use parser::parse_sql;
pub use types::*;
