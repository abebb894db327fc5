//! Shared foundation for the miniscan pipeline: configuration, the durable
//! checkpoint store, and input-row normalisation.

pub mod checkpoint;
pub mod config;
pub mod input;
