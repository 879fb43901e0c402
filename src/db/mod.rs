//! Persistence for principals and sessions.
//!
//! [`store`] defines the contracts the auth layer depends on; [`operations`]
//! implements them over PostgreSQL and [`memory`] in process.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::MemoryStore;
pub use models::{ClientMeta, NewPrincipal, Session, SessionReplacement};
pub use operations::PgStore;
pub use store::{PrincipalStore, SessionStore};
