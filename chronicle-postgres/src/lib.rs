//! PostgreSQL recorders for the `chronicle` crate: pooled server-based
//! storage with exclusive-lock writer serialization and
//! `LISTEN`/`NOTIFY` subscriptions.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod application;
pub mod datastore;
pub mod process;
pub mod tracking;

pub use datastore::{
    Datastore, Settings, POSTGRES_CONNECT_TIMEOUT, POSTGRES_CONN_MAX_AGE, POSTGRES_DBNAME,
    POSTGRES_HOST, POSTGRES_IDLE_IN_TRANSACTION_TIMEOUT, POSTGRES_LOCK_TIMEOUT,
    POSTGRES_MAX_OVERFLOW, POSTGRES_MAX_WAITING, POSTGRES_PASSWORD, POSTGRES_POOL_SIZE,
    POSTGRES_PORT, POSTGRES_PRE_PING, POSTGRES_SCHEMA, POSTGRES_USER,
};
