//! Proof-of-work target arithmetic and verification.

pub mod difficulty;
pub mod validation;

pub use validation::{check_proof_of_work, PowError};
