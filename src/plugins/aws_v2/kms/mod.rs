//! AWS KMS backend using AWS SDK v2
//!
//! DEKs are wrapped with the KMS `Encrypt` API under a single customer managed key, unwrapped
//! with `Decrypt`, and `DescribeKey` serves as the status probe. The key ID reported for every
//! wrapped DEK is the key ARN returned by AWS.
//!
//! # Examples
//!
//! ```no_run
//! use kmsenvelope::plugins::aws_v2::kms::AwsKmsService;
//! use kmsenvelope::KeyManagementService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let kms = AwsKmsService::from_target("us-west-2/alias/etcd-encryption").await?;
//!     let status = kms.status().await?;
//!     println!("active key: {}", status.key_id);
//!     Ok(())
//! }
//! ```

mod client;


pub use client::{classify_error_code, AwsKmsClient, AwsKmsService, EncryptOutput, KeyDescription, StandardAwsKmsClient};
