//! capgate Crypto - seal material for capability authorities
//!
//! This crate provides:
//! - CSPRNG-backed per-authority seals
//! - Constant-time seal comparison
//! - Log-safe seal fingerprints

pub mod seal;

pub use seal::{Seal, SealError, SEAL_SIZE};
