pub mod codec;
pub mod handler;
mod handler_batch;
mod handler_extended;
pub mod interrupts;
pub mod light_proxy;
pub mod param;
pub mod portal;
mod recovery;
pub mod resource_owner;
pub mod server;
pub mod session;
pub mod statement_cache;
pub mod txn_bracket;

#[cfg(test)]
mod tests;

pub use codec::{BackendMessage, BatchBindMessage, BindMessage, FrontendMessage};
pub use handler::{Backend, Flow};
pub use server::PgServer;
pub use session::Session;
