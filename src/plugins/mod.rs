//! Plugin architecture for remote KMS backends
//!
//! Each plugin implements [`KeyManagementService`](crate::KeyManagementService) for one vendor
//! SDK and is compiled in only when its feature flag is enabled.
//!
//! ## Available Plugins
//!
//! - `aws_v2::kms`: AWS KMS over the AWS SDK v2, reachable through `awskms://<region>/<key-id>`
//!   endpoints
//!
//! ## Feature Flags
//!
//! ```toml
//! [dependencies]
//! kmsenvelope = { version = "0.1.0", features = ["aws-v2-kms"] }
//! ```

pub mod aws_v2;
