//! Core library for Razeedash resource storage.
//!
//! Contains the payload cipher, the storage handler variants and the factory
//! that builds and reconstructs them, the bucket provisioner, the
//! organization key registry, and the document store seams. This crate
//! depends on `razeedash-storage` for the object store trait and knows
//! nothing about the API server or the cron jobs that call it.

pub mod cipher;
pub mod config;
pub mod connector;
pub mod error;
pub mod factory;
pub mod handler;
pub mod lock;
pub mod models;
pub mod org_keys;
#[cfg(feature = "postgres")]
pub mod postgres_store;
pub mod provisioner;
pub mod store;

pub use config::{ConfigHandle, StorageConfig};
pub use error::{ConfigError, CryptoError, DbError, HandlerError, KeyError, LockError, ProvisionError};
pub use factory::StorageFactory;
pub use handler::{HandlerKind, ResourceHandler, StorageHandler};
