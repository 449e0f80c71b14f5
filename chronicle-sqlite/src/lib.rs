//! SQLite recorders for the `chronicle` crate: file-backed
//! single-writer storage with WAL reads and busy-timeout locking.
//!
//! This backend does not support live subscriptions; event stores built
//! over it with [`EventStore::subscribing`][chronicle::store::EventStore::subscribing]
//! refuse at construction with
//! [`CapabilityError::NoSubscribe`][chronicle::recorder::CapabilityError].

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod application;
pub mod datastore;
pub mod process;
pub mod tracking;

pub use datastore::{Datastore, Settings, MEMORY_DB, SQLITE_DBNAME, SQLITE_LOCK_TIMEOUT};
