//! Residual bundles, reproducibility hashing and verification.

mod bundle;

pub use bundle::normalize_for_hash;
pub use bundle::{reproducibility_hash, verify_bundle_hash, ResidualBundle, VerificationResult, VerifyError};
