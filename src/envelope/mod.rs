//! Encrypted-object envelope and its wire codec
//!
//! A stored value is the textual prefix `k8s:enc:kms:v2:<provider>:` followed by a JSON encoded
//! [`EncryptedObject`]. The prefix is never encrypted; it selects the provider on read.

pub mod chain;
pub mod transformer;

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scheme part of the storage prefix
pub const SCHEME: &str = "k8s:enc:kms";

/// Version part of the storage prefix
pub const VERSION: &str = "v2";

/// Maximum size of a key ID
pub const KEY_ID_MAX_SIZE: usize = 1024;

/// Maximum size of an encrypted DEK
pub const ENCRYPTED_DEK_MAX_SIZE: usize = 1024;

/// Maximum combined size of all annotation keys and values
pub const ANNOTATIONS_MAX_SIZE: usize = 32 * 1024;

const ANNOTATION_KEY_MAX_LEN: usize = 253;

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("annotation key pattern is valid")
});

/// The persisted form of one encrypted value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedObject {
    /// `nonce || sealed payload`
    #[serde(rename = "encryptedData", with = "base64_bytes")]
    pub encrypted_data: Vec<u8>,

    /// ID of the KEK that wrapped the DEK
    #[serde(rename = "keyID")]
    pub key_id: String,

    /// The DEK, wrapped by the KMS
    #[serde(rename = "encryptedDEK", with = "base64_bytes")]
    pub encrypted_dek: Vec<u8>,

    /// Opaque metadata returned by the KMS on encryption
    #[serde(
        rename = "annotations",
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "base64_map"
    )]
    pub annotations: BTreeMap<String, Vec<u8>>,
}

impl EncryptedObject {
    /// Checks the structural constraints of an encrypted object
    pub fn validate(&self) -> Result<()> {
        if self.encrypted_data.is_empty() {
            return Err(Error::MalformedEnvelope("encrypted data is empty".into()));
        }
        validate_key_id(&self.key_id)?;
        validate_encrypted_dek(&self.encrypted_dek)?;
        validate_annotations(&self.annotations)
    }
}

/// Returns the storage prefix for a provider
pub fn prefix(provider_name: &str) -> String {
    format!("{}:{}:{}:", SCHEME, VERSION, provider_name)
}

/// Serializes an encrypted object behind the provider's prefix
pub fn encode(object: &EncryptedObject, provider_name: &str) -> Result<Vec<u8>> {
    object.validate()?;

    let prefix = prefix(provider_name);
    let body = serde_json::to_vec(object)
        .map_err(|e| Error::Internal(format!("failed to marshal encrypted object: {}", e)))?;

    let mut out = Vec::with_capacity(prefix.len() + body.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses the encrypted object that follows the first `prefix_len` bytes of `data`
pub fn decode(data: &[u8], prefix_len: usize) -> Result<EncryptedObject> {
    let body = data.get(prefix_len..).ok_or_else(|| {
        Error::MalformedEnvelope(format!(
            "value of {} bytes is shorter than its {} byte prefix",
            data.len(),
            prefix_len
        ))
    })?;

    let object: EncryptedObject = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedEnvelope(format!("failed to unmarshal encrypted object: {}", e)))?;
    object.validate()?;
    Ok(object)
}

/// Validates a key ID reported by the KMS
pub fn validate_key_id(key_id: &str) -> Result<()> {
    if key_id.is_empty() {
        return Err(Error::MalformedEnvelope("keyID is empty".into()));
    }
    if key_id.len() > KEY_ID_MAX_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "keyID is {} bytes, which exceeds the max size of {}",
            key_id.len(),
            KEY_ID_MAX_SIZE
        )));
    }
    Ok(())
}

/// Validates a wrapped DEK returned by the KMS
pub fn validate_encrypted_dek(encrypted_dek: &[u8]) -> Result<()> {
    if encrypted_dek.is_empty() {
        return Err(Error::MalformedEnvelope("encrypted DEK is empty".into()));
    }
    if encrypted_dek.len() > ENCRYPTED_DEK_MAX_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "encrypted DEK is {} bytes, which exceeds the max size of {}",
            encrypted_dek.len(),
            ENCRYPTED_DEK_MAX_SIZE
        )));
    }
    Ok(())
}

/// Validates KMS annotations: keys are fully qualified domain names and the total size is bounded
pub fn validate_annotations(annotations: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let mut total = 0;
    for (key, value) in annotations {
        if key.len() > ANNOTATION_KEY_MAX_LEN || !key.contains('.') || !DNS_SUBDOMAIN.is_match(key) {
            return Err(Error::MalformedEnvelope(format!(
                "annotation key {:?} must be a fully qualified domain name",
                key
            )));
        }
        total += key.len() + value.len();
    }

    if total > ANNOTATIONS_MAX_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "annotations are {} bytes, which exceeds the max size of {}",
            total, ANNOTATIONS_MAX_SIZE
        )));
    }
    Ok(())
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_map {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub(super) fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(map.iter().map(|(k, v)| (k, STANDARD.encode(v))))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v)
                    .map(|v| (k, v))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
