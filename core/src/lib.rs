//! utxodex Core Library
//! 
//! Core types, traits, and abstractions for the utxodex UTXO index.
//! This crate provides the data model, the error type, the configuration
//! and the collaborator interfaces every other crate builds on.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
