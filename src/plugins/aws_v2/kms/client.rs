use crate::error::{Error, Result};
use crate::kms::{DecryptRequest, EncryptResponse, StatusResponse};
use crate::KeyManagementService;
use async_trait::async_trait;
use aws_sdk_kms::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kms::types::{EncryptionAlgorithmSpec, KeyState};
use aws_sdk_kms::Client as AwsSdkKmsClient;
use metrics::histogram;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Result of the Encrypt operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptOutput {
    /// ARN of the key that encrypted the plaintext
    pub key_id: String,

    /// The wrapped plaintext
    pub ciphertext_blob: Vec<u8>,
}

/// Result of the DescribeKey operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDescription {
    /// ARN of the key
    pub arn: String,

    /// Whether the key can be used for cryptographic operations
    pub enabled: bool,

    /// AWS key state, e.g. `Enabled` or `PendingDeletion`
    pub state: String,
}

/// AWS KMS client trait
#[async_trait]
pub trait AwsKmsClient: Send + Sync + fmt::Debug {
    /// Encrypts data using a KMS key
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<EncryptOutput>;

    /// Decrypts data that was encrypted with a KMS key
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Describes a KMS key
    async fn describe_key(&self, key_id: &str) -> Result<KeyDescription>;

    /// Returns the region for this client
    fn region(&self) -> &str;
}

/// Maps an AWS KMS error code onto the crate's error kinds
pub fn classify_error_code(code: Option<&str>, message: String) -> Error {
    match code {
        Some("DisabledException" | "KMSInvalidStateException" | "AccessDeniedException") => {
            Error::Precondition(message)
        },
        Some("NotFoundException" | "InvalidCiphertextException" | "IncorrectKeyException") => {
            Error::NotFound(message)
        },
        Some(
            "DependencyTimeoutException"
            | "KMSInternalException"
            | "KeyUnavailableException"
            | "ThrottlingException"
            | "LimitExceededException",
        ) => Error::Unavailable(message),
        _ => Error::Internal(message),
    }
}

fn map_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    let message = format!("KMS {} error: {}", operation, err);
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => Error::Unavailable(message),
        SdkError::ServiceError(context) => classify_error_code(context.err().code(), message),
        _ => Error::Internal(message),
    }
}

/// Standard implementation of AwsKmsClient using AWS SDK v2
#[derive(Debug, Clone)]
pub struct StandardAwsKmsClient {
    /// AWS SDK KMS client
    client: AwsSdkKmsClient,

    /// AWS region for this client
    region: String,
}

impl StandardAwsKmsClient {
    /// Creates a new StandardAwsKmsClient
    pub fn new(client: AwsSdkKmsClient, region: String) -> Self {
        Self { client, region }
    }

    /// Creates a client for `region` from the default credential chain
    pub async fn from_env(region: &str) -> Self {
        let config = aws_config::from_env()
            .region(aws_types::region::Region::new(region.to_string()))
            .load()
            .await;

        Self::new(AwsSdkKmsClient::new(&config), region.to_string())
    }
}

#[async_trait]
impl AwsKmsClient for StandardAwsKmsClient {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<EncryptOutput> {
        let result = self
            .client
            .encrypt()
            .key_id(key_id)
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .plaintext(aws_sdk_kms::primitives::Blob::new(plaintext.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error("encrypt", e))?;

        let ciphertext_blob = result
            .ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| Error::Internal("No ciphertext blob returned from KMS".into()))?;

        Ok(EncryptOutput {
            key_id: result.key_id().unwrap_or(key_id).to_string(),
            ciphertext_blob,
        })
    }

    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let result = self
            .client
            .decrypt()
            .key_id(key_id)
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error("decrypt", e))?;

        result
            .plaintext()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| Error::Internal("No plaintext returned from KMS".into()))
    }

    async fn describe_key(&self, key_id: &str) -> Result<KeyDescription> {
        let result = self
            .client
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("describe key", e))?;

        let metadata = result
            .key_metadata()
            .ok_or_else(|| Error::Internal("No key metadata returned from KMS".into()))?;

        Ok(KeyDescription {
            arn: metadata.arn().unwrap_or(key_id).to_string(),
            enabled: metadata.enabled(),
            state: metadata
                .key_state()
                .map(KeyState::as_str)
                .unwrap_or("Unknown")
                .to_string(),
        })
    }

    fn region(&self) -> &str {
        &self.region
    }
}

/// AWS KMS implementation of the KeyManagementService trait
#[derive(Debug, Clone)]
pub struct AwsKmsService {
    client: Arc<dyn AwsKmsClient>,

    /// Key ID, ARN or alias of the customer managed key
    key_id: String,
}

impl AwsKmsService {
    pub fn new(client: Arc<dyn AwsKmsClient>, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
        }
    }

    /// Connects to the key named by an endpoint target of the form `<region>/<key-id>`
    pub async fn from_target(target: &str) -> Result<Self> {
        let (region, key_id) = target
            .split_once('/')
            .filter(|(region, key_id)| !region.is_empty() && !key_id.is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "AWS KMS endpoint target {:?} is not of the form <region>/<key-id>",
                    target
                ))
            })?;

        let client = StandardAwsKmsClient::from_env(region).await;
        log::debug!("using AWS KMS key {} in region {}", key_id, region);
        Ok(Self::new(Arc::new(client), key_id))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn region(&self) -> &str {
        self.client.region()
    }
}

#[async_trait]
impl KeyManagementService for AwsKmsService {
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<EncryptResponse> {
        let start = Instant::now();
        let output = self.client.encrypt(&self.key_id, plaintext_dek).await;
        histogram!("kms.envelope.aws.encrypt.time", start.elapsed(), "region" => self.region().to_string());
        let output = output?;

        Ok(EncryptResponse {
            ciphertext: output.ciphertext_blob,
            key_id: output.key_id,
            annotations: BTreeMap::new(),
        })
    }

    async fn decrypt_dek(&self, request: &DecryptRequest) -> Result<Vec<u8>> {
        let start = Instant::now();
        let plaintext = self.client.decrypt(&request.key_id, &request.ciphertext).await;
        histogram!("kms.envelope.aws.decrypt.time", start.elapsed(), "region" => self.region().to_string());
        plaintext
    }

    async fn status(&self) -> Result<StatusResponse> {
        let description = self.client.describe_key(&self.key_id).await?;
        if !description.enabled {
            return Err(Error::Precondition(format!(
                "key {} is {}",
                description.arn, description.state
            )));
        }

        Ok(StatusResponse::healthy(description.arn))
    }
}
