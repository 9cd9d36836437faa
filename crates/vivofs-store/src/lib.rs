#![warn(missing_docs)]

//! VivoFS durable store subsystem: the key-value boundary backing each
//! mounted namespace.
//!
//! The backend crate treats durable storage as an opaque collaborator: object
//! records are written and read by persistent handle token, and a flush drains
//! whatever the backend buffered to stable media. This crate defines that
//! boundary (`DurableStore`) and ships an in-memory reference implementation
//! (`MemoryStore`) for tests and volatile mounts.

pub mod error;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::{DurableStore, MemoryStore};
