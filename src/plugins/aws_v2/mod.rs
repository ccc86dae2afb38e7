//! AWS SDK v2 plugin implementations
//!
//! These implementations are conditionally compiled using the `aws-v2-kms` feature flag.

#[cfg(feature = "aws-v2-kms")]
pub mod kms;
