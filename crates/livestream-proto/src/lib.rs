//! Shared model for the livestream daemon: stream records, the SII list
//! codec, the record store, configuration and the wire types exchanged with
//! front ends.

pub mod config;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod record;
pub mod sii;
pub mod state;
pub mod store;
