pub mod catalog;
pub mod config;
pub mod datum;
pub mod error;
pub mod interrupt;
pub mod schema;
pub mod types;
