use futures::channel::mpsc;
use futures::{StreamExt, TryStreamExt, stream};
use gantry_common::error::{GantryError, Result};
use gantry_common::types::{
    BackendInfo, ByteStream, KeyContext, LocationDescriptor, ObjectLocator,
};
use gantry_crypto::EncryptionConfig;
use tracing::{debug, error};

use crate::backend::DataBackend;
use crate::location::{LocationRegistry, LocationType};
use crate::system::DataSys;
use crate::traits::NativeCopyRequest;

/// Chunks buffered between the read and write halves of a pass-through copy.
const PASS_THROUGH_CAPACITY: usize = 16;

/// The parts of a bucket that decide how its objects may be copied.
#[derive(Debug, Clone, Copy)]
pub struct BucketView<'a> {
    pub name: &'a str,
    pub server_side_encryption: Option<&'a EncryptionConfig>,
}

impl<'a> BucketView<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            server_side_encryption: None,
        }
    }

    pub fn with_encryption(mut self, config: &'a EncryptionConfig) -> Self {
        self.server_side_encryption = Some(config);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CopyObjectRequest<'a> {
    /// Location constraint holding the source object.
    pub source_location: &'a str,
    /// Location requested for the new object, when the request named one.
    pub dest_location: Option<&'a str>,
    pub source_bucket: BucketView<'a>,
    pub dest_bucket: BucketView<'a>,
    pub source_size: u64,
    /// Stored parts of the source object, in order.
    pub data_locator: &'a [LocationDescriptor],
    pub dest_key_context: &'a KeyContext,
    pub dest_backend_info: Option<&'a BackendInfo>,
}

/// Whether a copy may use the destination driver's native copy.
pub fn native_copy_eligible(registry: &LocationRegistry, request: &CopyObjectRequest<'_>) -> bool {
    let source_type = registry.location_type(request.source_location);
    let types_match = match request.dest_location {
        Some(dest) => source_type.is_some() && source_type == registry.location_type(dest),
        None => true,
    };

    let same_bucket = request.source_bucket.name == request.dest_bucket.name;
    let no_encryption = request.source_bucket.server_side_encryption.is_none()
        && request.dest_bucket.server_side_encryption.is_none();

    let dest_location = request.dest_location.unwrap_or(request.source_location);
    let native_capable = match source_type {
        Some(LocationType::AwsS3) => true,
        Some(LocationType::Azure) => {
            registry.is_same_azure_account(request.source_location, dest_location)
        }
        _ => false,
    };

    types_match && (same_bucket || no_encryption) && native_capable
}

impl DataSys {
    /// Copies an object's data and returns the new descriptors, one per
    /// source part. A failed part aborts the copy; parts already written are
    /// left for the caller to clean up.
    pub async fn copy_object(
        &self,
        request: &CopyObjectRequest<'_>,
        request_id: &str,
    ) -> Result<Vec<LocationDescriptor>> {
        let backend = self.active_backend().await;
        if let DataBackend::Multiple(gateway) = &backend {
            if native_copy_eligible(self.locations(), request) {
                let source = request.data_locator.first().ok_or_else(|| {
                    GantryError::InvalidArgument("copy source has no stored data".to_string())
                })?;
                let native = NativeCopyRequest {
                    source_key: source.key.clone(),
                    source_location: request.source_location.to_string(),
                    dest_location: request
                        .dest_location
                        .unwrap_or(request.source_location)
                        .to_string(),
                    dest_bucket: request.dest_bucket.name.to_string(),
                    dest_object_key: request.dest_key_context.object_key.clone(),
                    size: request.source_size,
                };
                debug!(request_id, source = %native.source_location, dest = %native.dest_location, "copying object natively");

                let copied = gateway.copy_object(&native, request_id).await.map_err(|err| {
                    error!(request_id, error = %err, "native copy error from datastore");
                    GantryError::InternalError
                })?;

                let mut location = LocationDescriptor::new(
                    copied.key,
                    copied.data_store_name,
                    request.source_size,
                );
                location.data_store_type = copied.data_store_type;
                location.data_store_etag = source.data_store_etag.clone();
                location.start = source.start;
                return Ok(vec![location]);
            }
        }

        let sse = request.dest_bucket.server_side_encryption;
        stream::iter(request.data_locator)
            .map(|part| self.copy_part(part, sse, request, request_id))
            .buffered(self.copy_part_concurrency())
            .try_collect()
            .await
            .inspect_err(|err| {
                debug!(request_id, error = %err, "error transferring data from source");
            })
    }

    async fn copy_part(
        &self,
        part: &LocationDescriptor,
        sse: Option<&EncryptionConfig>,
        request: &CopyObjectRequest<'_>,
        request_id: &str,
    ) -> Result<LocationDescriptor> {
        let locator = ObjectLocator::from(part.clone());
        let pushes_to_sink = part
            .data_store_type
            .as_deref()
            .and_then(LocationType::parse)
            .is_some_and(|location_type| location_type.pushes_to_sink());

        if pushes_to_sink {
            let (tx, rx) = mpsc::channel(PASS_THROUGH_CAPACITY);
            let (_, copied) = futures::try_join!(
                self.get_into(&locator, None, tx, request_id),
                self.data_copy_put(sse, rx.boxed(), part, request, request_id),
            )?;
            return Ok(copied);
        }

        let stream = self.get(&locator, None, request_id).await?;
        self.data_copy_put(sse, stream, part, request, request_id).await
    }

    /// Writes one copied part, encrypting it under a fresh data key when the
    /// destination bucket requires encryption.
    async fn data_copy_put(
        &self,
        sse: Option<&EncryptionConfig>,
        stream: ByteStream,
        part: &LocationDescriptor,
        request: &CopyObjectRequest<'_>,
        request_id: &str,
    ) -> Result<LocationDescriptor> {
        let cipher = match sse {
            Some(config) => Some(
                self.kms()
                    .create_cipher_bundle(config, request_id)
                    .await
                    .map_err(|err| {
                        debug!(request_id, error = %err, "error getting cipher bundle");
                        GantryError::InternalError
                    })?,
            ),
            None => None,
        };

        let outcome = self
            .put(
                cipher,
                stream,
                part.size,
                request.dest_key_context,
                request.dest_backend_info,
                request_id,
            )
            .await?;

        let mut copied = outcome.location;
        copied.start = part.start;
        copied.size = part.size;
        if copied.encryption.is_none() {
            copied.data_store_etag = part.data_store_etag.clone();
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gantry_common::types::{KeyContext, LocationDescriptor};
    use gantry_crypto::{EncryptionConfig, SseAlgorithm};

    use super::{BucketView, CopyObjectRequest, native_copy_eligible};
    use crate::location::{LocationConstraint, LocationRegistry, LocationType};

    fn registry() -> LocationRegistry {
        let mut azure_a = LocationConstraint::new(LocationType::Azure);
        azure_a.details.azure_storage_account = Some("acct".to_string());
        let azure_b = azure_a.clone();
        let mut azure_other = LocationConstraint::new(LocationType::Azure);
        azure_other.details.azure_storage_account = Some("other".to_string());

        let locations = BTreeMap::from([
            ("aws-1".to_string(), LocationConstraint::new(LocationType::AwsS3)),
            ("aws-2".to_string(), LocationConstraint::new(LocationType::AwsS3)),
            ("azure-a".to_string(), azure_a),
            ("azure-b".to_string(), azure_b),
            ("azure-other".to_string(), azure_other),
            ("local".to_string(), LocationConstraint::new(LocationType::Mem)),
        ]);
        LocationRegistry::new(locations, BTreeMap::new()).unwrap()
    }

    fn request<'a>(
        source: &'a str,
        dest: Option<&'a str>,
        source_bucket: BucketView<'a>,
        dest_bucket: BucketView<'a>,
        ctx: &'a KeyContext,
        parts: &'a [LocationDescriptor],
    ) -> CopyObjectRequest<'a> {
        CopyObjectRequest {
            source_location: source,
            dest_location: dest,
            source_bucket,
            dest_bucket,
            source_size: 10,
            data_locator: parts,
            dest_key_context: ctx,
            dest_backend_info: None,
        }
    }

    #[test]
    fn eligibility_rules() {
        let registry = registry();
        let ctx = KeyContext::new("dst", "owner", "ns");
        let parts = [LocationDescriptor::new("k", "aws-1", 10)];
        let sse = EncryptionConfig {
            algorithm: SseAlgorithm::Aes256,
            master_key_id: "key".to_string(),
        };
        let plain_src = BucketView::new("src");
        let plain_dst = BucketView::new("dst");
        let encrypted_dst = BucketView::new("dst").with_encryption(&sse);
        let encrypted_src = BucketView::new("src").with_encryption(&sse);

        let eligible = |source, dest, src, dst| {
            native_copy_eligible(&registry, &request(source, dest, src, dst, &ctx, &parts))
        };

        assert!(eligible("aws-1", Some("aws-2"), plain_src, plain_dst));
        assert!(eligible("aws-1", None, plain_src, plain_dst));
        assert!(!eligible("aws-1", Some("azure-a"), plain_src, plain_dst));
        assert!(!eligible("aws-1", Some("aws-2"), plain_src, encrypted_dst));
        assert!(eligible("aws-1", Some("aws-2"), encrypted_src, encrypted_src));
        assert!(eligible("azure-a", Some("azure-b"), plain_src, plain_dst));
        assert!(!eligible("azure-a", Some("azure-other"), plain_src, plain_dst));
        assert!(!eligible("local", Some("local"), plain_src, plain_dst));
    }
}
