// ABOUTME: Session registry and its durable key-value store
// ABOUTME: Re-exports the registry, the store trait and the SQLite store

mod registry;
mod store;

pub use registry::{NewSession, SessionRegistry};
pub use store::{SessionStore, SqliteSessionStore, StoreError, StoreResult};
