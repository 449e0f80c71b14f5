//! `chronicle` is the persistence core of an event-sourcing library:
//! it records and retrieves domain events with strong ordering,
//! uniqueness and atomicity guarantees, sufficient to implement
//! event-sourced aggregates, event-driven process managers and
//! eventually-consistent read-model projections.
//!
//! The building blocks, leaves first:
//!
//! - [`transcoder`]: codec between structured event payloads and bytes,
//!   extensible through registered type adapters.
//! - [`compressor`] and [`cipher`]: the optional stages of the state
//!   pipeline (serialize, then compress, then encrypt).
//! - [`mapper`]: converts between domain events and stored events.
//! - [`recorder`]: the storage contracts -- aggregate, application,
//!   tracking and process recorders -- with their invariants.
//! - [`inmemory`]: process-local recorder implementations.
//! - [`store`]: the typed waist binding a mapper to a recorder.
//! - [`subscription`]: ordered, blocking live iteration over the
//!   application sequence.
//! - [`projection`]: drives user projections over subscriptions with a
//!   durable cursor.
//!
//! Database-backed recorders live in the companion crates
//! `chronicle-postgres` and `chronicle-sqlite`.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

pub mod cipher;
pub mod compressor;
pub mod env;
pub mod event;
pub mod inmemory;
pub mod mapper;
pub mod projection;
pub mod recorder;
pub mod store;
pub mod subscription;
pub mod transcoder;
pub mod version;
