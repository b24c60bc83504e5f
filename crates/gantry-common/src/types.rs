use std::collections::BTreeMap;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{GantryError, Result};

/// Object bytes as they travel between the API layer, the pipelines and a backend.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Inclusive `[start, end]` byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(GantryError::InvalidArgument(format!(
                "invalid byte range: {start}-{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Clamps the range to an object of `size` bytes. `None` when the range
    /// starts past the end of the object.
    pub fn clamp_to(&self, size: u64) -> Option<Self> {
        if size == 0 || self.start >= size {
            return None;
        }
        Some(Self {
            start: self.start,
            end: self.end.min(size - 1),
        })
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Where a put is headed: used by drivers to namespace keys and by the
/// multi-backend gateway to route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContext {
    pub bucket_name: String,
    pub owner: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
}

impl KeyContext {
    pub fn new(
        bucket_name: impl Into<String>,
        owner: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            owner: owner.into(),
            namespace: namespace.into(),
            object_key: None,
        }
    }

    pub fn with_object_key(mut self, object_key: impl Into<String>) -> Self {
        self.object_key = Some(object_key.into());
        self
    }
}

/// Backend selection hints for the multi-backend gateway, in priority order:
/// object constraint, bucket constraint, then the endpoint the request hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub object_location_constraint: Option<String>,
    pub bucket_location_constraint: Option<String>,
    pub request_endpoint: String,
}

impl BackendInfo {
    pub fn new(request_endpoint: impl Into<String>) -> Self {
        Self {
            request_endpoint: request_endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_object_location(mut self, location: impl Into<String>) -> Self {
        self.object_location_constraint = Some(location.into());
        self
    }

    pub fn with_bucket_location(mut self, location: impl Into<String>) -> Self {
        self.bucket_location_constraint = Some(location.into());
        self
    }
}

/// Server-side encryption metadata persisted with a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionInfo {
    pub crypto_scheme: u8,
    pub master_key_id: String,
    /// Base64 of the data key sealed under the master key.
    pub ciphered_data_key: String,
    /// Absent on metadata written before blob versioning.
    #[serde(default = "first_blob_version")]
    pub blob_version: u8,
}

fn first_blob_version() -> u8 {
    1
}

/// Pointer to one stored byte range, owned by the metadata engine once `put`
/// returns it.
///
/// Field names follow the stored object metadata, with the encryption
/// fields inlined next to the location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationDescriptor {
    pub key: String,
    pub data_store_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_type: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(
        rename = "dataStoreETag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_store_etag: Option<String>,
    #[serde(rename = "contentMD5", default, skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,
    #[serde(flatten)]
    pub encryption: Option<EncryptionInfo>,
}

impl LocationDescriptor {
    pub fn new(key: impl Into<String>, data_store_name: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            data_store_name: data_store_name.into(),
            data_store_type: None,
            size,
            start: None,
            data_store_etag: None,
            content_md5: None,
            encryption: None,
        }
    }
}

/// A stored location as read back from object metadata.
///
/// Metadata written before descriptors existed holds the bare backend key;
/// both shapes deserialize into this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectLocator {
    Key(String),
    Descriptor(LocationDescriptor),
}

impl ObjectLocator {
    pub fn key(&self) -> &str {
        match self {
            Self::Key(key) => key,
            Self::Descriptor(desc) => &desc.key,
        }
    }

    pub fn descriptor(&self) -> Option<&LocationDescriptor> {
        match self {
            Self::Key(_) => None,
            Self::Descriptor(desc) => Some(desc),
        }
    }

    pub fn data_store_name(&self) -> Option<&str> {
        self.descriptor()
            .map(|desc| desc.data_store_name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn data_store_type(&self) -> Option<&str> {
        self.descriptor().and_then(|desc| desc.data_store_type.as_deref())
    }

    pub fn encryption(&self) -> Option<&EncryptionInfo> {
        self.descriptor().and_then(|desc| desc.encryption.as_ref())
    }
}

impl From<LocationDescriptor> for ObjectLocator {
    fn from(desc: LocationDescriptor) -> Self {
        Self::Descriptor(desc)
    }
}

impl From<String> for ObjectLocator {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<&str> for ObjectLocator {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    pub available: u64,
}

/// Result of one backend healthcheck. A degraded backend reports `Error`
/// instead of failing the check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthStatus {
    Ok { code: u16, message: String },
    Error { error: String },
}

impl HealthStatus {
    pub fn ok() -> Self {
        Self::Ok {
            code: 200,
            message: "OK".to_string(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::Error {
            error: detail.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Backend name to status, rebuilt on every health check.
pub type BackendHealth = BTreeMap<String, HealthStatus>;

#[cfg(test)]
mod tests {
    use super::{ByteRange, LocationDescriptor, ObjectLocator};

    #[test]
    fn legacy_key_and_descriptor_both_deserialize() {
        let legacy: ObjectLocator = serde_json::from_str("\"4b2e9f\"").unwrap();
        assert_eq!(legacy.key(), "4b2e9f");
        assert!(legacy.descriptor().is_none());

        let desc: ObjectLocator = serde_json::from_str(
            r#"{"key":"k1","dataStoreName":"mem","dataStoreType":"mem","size":11,"start":0}"#,
        )
        .unwrap();
        assert_eq!(desc.key(), "k1");
        assert_eq!(desc.data_store_name(), Some("mem"));
        assert_eq!(desc.data_store_type(), Some("mem"));
        assert!(desc.encryption().is_none());
    }

    #[test]
    fn stored_encryption_fields_sit_beside_the_location() {
        let stored = r#"{
            "key": "k2",
            "dataStoreName": "aws-1",
            "size": 4,
            "dataStoreETag": "1:abc",
            "cryptoScheme": 1,
            "masterKeyId": "mk",
            "cipheredDataKey": "c2VhbGVk"
        }"#;
        let desc: LocationDescriptor = serde_json::from_str(stored).unwrap();
        assert_eq!(desc.data_store_etag.as_deref(), Some("1:abc"));
        let encryption = desc.encryption.as_ref().unwrap();
        assert_eq!(encryption.master_key_id, "mk");
        assert_eq!(encryption.blob_version, 1);

        let mut plain = LocationDescriptor::new("k", "mem", 1);
        plain.content_md5 = Some("d41d".to_string());
        assert_eq!(
            serde_json::to_value(&plain).unwrap(),
            serde_json::json!({"key": "k", "dataStoreName": "mem", "size": 1, "contentMD5": "d41d"})
        );

        let written = serde_json::to_value(&desc).unwrap();
        assert_eq!(written["cipheredDataKey"], "c2VhbGVk");
        assert!(written.get("encryption").is_none());
    }

    #[test]
    fn range_is_inclusive_and_clamps() {
        let range = ByteRange::new(2, 5).unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!(range.header_value(), "bytes=2-5");
        assert_eq!(range.clamp_to(4), Some(ByteRange { start: 2, end: 3 }));
        assert_eq!(range.clamp_to(2), None);
        assert!(ByteRange::new(5, 2).is_err());
    }
}
