//! Core contracts for the colloquy conversation engine: the transcript
//! model and store trait, the provider adapter contract, the error
//! taxonomy, configuration, and the text utilities shared by every layer.

pub mod config;
pub mod error;
pub mod message;
pub mod provider;
pub mod sanitize;
pub mod signals;
pub mod similarity;
pub mod transcript;
