use std::collections::HashMap;
use std::sync::Arc;

use futures::{StreamExt, stream};
use gantry_common::error::{GantryError, Result};
use gantry_common::hash::{ContentHash, HashedStream};
use gantry_common::types::{
    BackendHealth, BackendInfo, ByteRange, ByteStream, DiskUsage, HealthStatus, KeyContext,
    LocationDescriptor, ObjectLocator,
};
use gantry_crypto::{CipherBundle, KeyManager};
use tokio::sync::RwLock;
use tracing::{debug, error, trace, warn};

use crate::backend::DataBackend;
use crate::config::{DEFAULT_COPY_PART_CONCURRENCY, DataConfig};
use crate::error::DriverResult;
use crate::location::{LocationRegistry, LocationType};
use crate::retrieve::{ResponseSink, retrieve_data};
use crate::traits::{ByteSink, DataDriver, pump};

/// Delete attempts after the first one.
pub const MAX_DELETE_RETRIES: u32 = 2;
pub const BATCH_DELETE_CONCURRENCY: usize = 5;

/// What triggered a batch delete of replaced data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Put,
    Post,
    Delete,
    Copy,
}

#[derive(Debug)]
pub struct PutOutcome {
    pub location: LocationDescriptor,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDeleteReport {
    /// The locations were left alone: the overwrite landed in the same
    /// external location and the cloud store replaced the data itself.
    pub skipped: bool,
    pub attempted: usize,
    pub deleted: usize,
    pub not_found: usize,
    /// Keys whose delete still failed after retries.
    pub failed: Vec<String>,
}

impl BatchDeleteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the active backend and the key manager. Driver failures are logged
/// here and reach callers as [`GantryError::InternalError`]; key management
/// failures keep their detail.
#[derive(Debug)]
pub struct DataSys {
    active: RwLock<DataBackend>,
    kms: Arc<dyn KeyManager>,
    locations: Arc<LocationRegistry>,
    copy_part_concurrency: usize,
}

impl DataSys {
    pub fn new(backend: DataBackend, kms: Arc<dyn KeyManager>) -> Self {
        let locations = match &backend {
            DataBackend::Multiple(gateway) => Arc::new(gateway.registry().clone()),
            _ => Arc::new(LocationRegistry::default()),
        };
        Self {
            active: RwLock::new(backend),
            kms,
            locations,
            copy_part_concurrency: DEFAULT_COPY_PART_CONCURRENCY,
        }
    }

    pub fn with_locations(mut self, locations: LocationRegistry) -> Self {
        self.locations = Arc::new(locations);
        self
    }

    pub fn with_copy_part_concurrency(mut self, concurrency: usize) -> Self {
        self.copy_part_concurrency = concurrency.max(1);
        self
    }

    /// Builds the backend, key manager and location registry described by
    /// `config`, failing on the first inconsistency.
    pub async fn from_config(
        config: &DataConfig,
        external: HashMap<String, Arc<dyn DataDriver>>,
    ) -> Result<Self> {
        config.validate()?;
        let kms: Arc<dyn KeyManager> = Arc::new(config.local_kms()?);
        let backend = DataBackend::from_config(config, external).await?;
        Ok(Self::new(backend, kms)
            .with_locations(config.location_registry()?)
            .with_copy_part_concurrency(config.copy_part_concurrency))
    }

    pub async fn active_backend(&self) -> DataBackend {
        self.active.read().await.clone()
    }

    /// Replaces the active backend and returns the previous one. Requests
    /// already running keep the backend they started with.
    pub async fn switch_active_driver(&self, backend: DataBackend) -> DataBackend {
        let mut active = self.active.write().await;
        debug!(from = active.impl_name(), to = backend.impl_name(), "switching active data backend");
        std::mem::replace(&mut *active, backend)
    }

    pub fn kms(&self) -> &Arc<dyn KeyManager> {
        &self.kms
    }

    pub fn locations(&self) -> &LocationRegistry {
        &self.locations
    }

    pub(crate) fn copy_part_concurrency(&self) -> usize {
        self.copy_part_concurrency
    }

    /// Stores `size` bytes from `stream`, encrypting them when `cipher` is
    /// given. The returned descriptor carries the MD5 of the plaintext.
    pub async fn put(
        &self,
        cipher: Option<CipherBundle>,
        stream: ByteStream,
        size: u64,
        ctx: &KeyContext,
        backend_info: Option<&BackendInfo>,
        request_id: &str,
    ) -> Result<PutOutcome> {
        let backend = self.active_backend().await;
        let impl_name = backend.impl_name();
        debug!(request_id, impl_name, bucket = %ctx.bucket_name, size, "sending put to datastore");

        // hash sits before the cipher so the digest is over the plaintext
        let (hashed, hash) = HashedStream::new(stream);
        let hashed = hashed.boxed();

        let stored = match &backend {
            DataBackend::Multiple(gateway) => {
                gateway
                    .put(hashed, size, ctx, backend_info, cipher, request_id)
                    .await
            }
            single => match single.driver() {
                Some(driver) => put_single(driver, cipher, hashed, size, ctx, request_id).await,
                None => return Err(GantryError::InternalError),
            },
        };

        let mut location = stored.map_err(|err| {
            error!(request_id, impl_name, error = %err, "put error from datastore");
            GantryError::InternalError
        })?;

        let digest = hash.wait().await.inspect_err(|_| {
            error!(request_id, impl_name, key = %location.key, "content hash unavailable after put");
        })?;
        location.content_md5 = Some(digest);
        Ok(PutOutcome { location, hash })
    }

    /// Returns the bytes of `locator`, decrypted when it was stored
    /// encrypted. `range` is applied by the driver.
    pub async fn get(
        &self,
        locator: &ObjectLocator,
        range: Option<ByteRange>,
        request_id: &str,
    ) -> Result<ByteStream> {
        let backend = self.active_backend().await;
        let driver = backend.resolve(locator)?;
        debug!(request_id, impl_name = backend.impl_name(), key = %locator.key(), "sending get to datastore");

        let stream = driver
            .get(locator.key(), range, request_id)
            .await
            .map_err(|err| {
                error!(request_id, key = %locator.key(), error = %err, "get error from datastore");
                GantryError::InternalError
            })?;

        let Some(encryption) = locator.encryption() else {
            return Ok(stream);
        };
        let offset = range.map_or(0, |range| range.start);
        let decipher = self
            .kms
            .create_decipher_bundle(encryption, offset, request_id)
            .await
            .inspect_err(|err| {
                error!(request_id, key = %locator.key(), error = %err, "cannot get decipher bundle from kms");
            })?;
        Ok(decipher.decrypt(stream).boxed())
    }

    /// Writes the bytes of `locator` into `sink`. Unencrypted data is pushed
    /// by the driver itself, which is how sink-writing clients are read.
    pub async fn get_into(
        &self,
        locator: &ObjectLocator,
        range: Option<ByteRange>,
        sink: ByteSink,
        request_id: &str,
    ) -> Result<()> {
        if locator.encryption().is_some() {
            let stream = self.get(locator, range, request_id).await?;
            return pump(stream, sink).await.map_err(|err| {
                error!(request_id, key = %locator.key(), error = %err, "get error from datastore");
                GantryError::InternalError
            });
        }

        let backend = self.active_backend().await;
        let driver = backend.resolve(locator)?;
        driver
            .get_into(locator.key(), range, sink, request_id)
            .await
            .map_err(|err| {
                error!(request_id, key = %locator.key(), error = %err, "get error from datastore");
                GantryError::InternalError
            })
    }

    /// Streams every part of an object into `sink`, strictly in order.
    pub async fn retrieve<S>(
        &self,
        parts: &[ObjectLocator],
        sink: &mut S,
        request_id: &str,
    ) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        retrieve_data(parts, |part| self.get(part, None, request_id), sink).await
    }

    /// Removes one location, retrying transient failures.
    ///
    /// A missing key is reported as [`GantryError::NotFound`] without retry.
    pub async fn delete(&self, locator: &ObjectLocator, request_id: &str) -> Result<()> {
        let backend = self.active_backend().await;
        let driver = backend.resolve(locator)?;
        trace!(request_id, impl_name = backend.impl_name(), key = %locator.key(), "sending delete to datastore");

        let mut attempt = 0;
        loop {
            match driver.delete(locator.key(), request_id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_not_found() => {
                    debug!(request_id, key = %locator.key(), "delete target already gone");
                    return Err(GantryError::NotFound(locator.key().to_string()));
                }
                Err(err) => {
                    let more_retries = attempt < MAX_DELETE_RETRIES;
                    error!(
                        request_id,
                        key = %locator.key(),
                        attempt,
                        more_retries = if more_retries { "yes" } else { "no" },
                        error = %err,
                        "delete error from datastore"
                    );
                    if !more_retries {
                        return Err(GantryError::InternalError);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Deletes `locations` with bounded concurrency. Every location is
    /// attempted even after failures; the report lists what remains.
    ///
    /// Nothing is deleted when a put overwrites data kept in the same
    /// external location.
    pub async fn batch_delete(
        &self,
        locations: &[ObjectLocator],
        method: RequestMethod,
        new_data_store_name: Option<&str>,
        request_id: &str,
    ) -> BatchDeleteReport {
        if should_skip_batch_delete(locations, method, new_data_store_name) {
            debug!(request_id, count = locations.len(), "skipping batch delete of overwritten external data");
            return BatchDeleteReport {
                skipped: true,
                ..BatchDeleteReport::default()
            };
        }

        trace!(request_id, count = locations.len(), "initiating batch delete");
        let outcomes: Vec<(&ObjectLocator, Result<()>)> = stream::iter(locations)
            .map(|locator| async move { (locator, self.delete(locator, request_id).await) })
            .buffer_unordered(BATCH_DELETE_CONCURRENCY)
            .collect()
            .await;

        let mut report = BatchDeleteReport {
            attempted: outcomes.len(),
            ..BatchDeleteReport::default()
        };
        for (locator, outcome) in outcomes {
            match outcome {
                Ok(()) => report.deleted += 1,
                Err(err) if err.is_not_found() => report.not_found += 1,
                Err(_) => report.failed.push(locator.key().to_string()),
            }
        }

        if report.is_complete() {
            trace!(request_id, deleted = report.deleted, "batch delete successfully completed");
        } else {
            error!(
                request_id,
                attempted = report.attempted,
                failed = ?report.failed,
                "batch delete failed"
            );
        }
        report
    }

    /// Health of the active backend. Degraded backends are reported, never
    /// raised.
    pub async fn check_health(&self, request_id: &str) -> BackendHealth {
        let backend = self.active_backend().await;
        let health = match &backend {
            DataBackend::Multiple(gateway) => gateway.healthcheck(request_id).await,
            single => {
                let status = match single.driver() {
                    Some(driver) => driver.healthcheck(request_id).await,
                    None => HealthStatus::error("no data driver"),
                };
                BackendHealth::from([(single.impl_name().to_string(), status)])
            }
        };

        for (name, status) in &health {
            if let HealthStatus::Error { error } = status {
                warn!(request_id, backend = %name, error = %error, "data backend unhealthy");
            }
        }
        health
    }

    /// Disk usage of the active backend, `None` when it cannot tell.
    pub async fn disk_usage(&self, request_id: &str) -> Result<Option<DiskUsage>> {
        let backend = self.active_backend().await;
        let usage: DriverResult<Option<DiskUsage>> = match &backend {
            DataBackend::Multiple(gateway) => gateway.disk_usage(request_id).await,
            single => match single.driver() {
                Some(driver) => driver.disk_usage(request_id).await,
                None => Ok(None),
            },
        };

        let usage = usage.map_err(|err| {
            error!(request_id, impl_name = backend.impl_name(), error = %err, "disk usage error from datastore");
            GantryError::InternalError
        })?;
        if usage.is_none() {
            debug!(request_id, impl_name = backend.impl_name(), "returning empty disk usage as fallback");
        }
        Ok(usage)
    }
}

async fn put_single(
    driver: &dyn DataDriver,
    cipher: Option<CipherBundle>,
    stream: ByteStream,
    size: u64,
    ctx: &KeyContext,
    request_id: &str,
) -> DriverResult<LocationDescriptor> {
    let encryption = cipher.as_ref().map(CipherBundle::encryption_info);
    let stream = match cipher {
        Some(cipher) => cipher.encrypt(stream).boxed(),
        None => stream,
    };
    let key = driver.put(stream, size, ctx, request_id).await?;

    let mut location = LocationDescriptor::new(key, driver.name(), size);
    location.encryption = encryption;
    Ok(location)
}

/// A put that overwrites an object kept in an external location, landing in
/// that same location, has already replaced the old data.
pub fn should_skip_batch_delete(
    locations: &[ObjectLocator],
    method: RequestMethod,
    new_data_store_name: Option<&str>,
) -> bool {
    let Some(first) = locations.first() else {
        return false;
    };
    let external = first
        .data_store_type()
        .and_then(LocationType::parse)
        .is_some_and(|location_type| location_type.is_external());

    method == RequestMethod::Put
        && external
        && new_data_store_name.is_some()
        && first.data_store_name() == new_data_store_name
}

#[cfg(test)]
mod tests {
    use gantry_common::types::{LocationDescriptor, ObjectLocator};

    use super::{RequestMethod, should_skip_batch_delete};

    fn external(name: &str) -> ObjectLocator {
        let mut desc = LocationDescriptor::new("k", name, 1);
        desc.data_store_type = Some("aws_s3".to_string());
        desc.into()
    }

    #[test]
    fn overwrite_into_same_external_location_is_skipped() {
        let locations = vec![external("aws-1")];
        assert!(should_skip_batch_delete(&locations, RequestMethod::Put, Some("aws-1")));
        assert!(!should_skip_batch_delete(&locations, RequestMethod::Put, Some("aws-2")));
        assert!(!should_skip_batch_delete(&locations, RequestMethod::Delete, Some("aws-1")));
        assert!(!should_skip_batch_delete(&locations, RequestMethod::Put, None));
        assert!(!should_skip_batch_delete(&[], RequestMethod::Put, Some("aws-1")));

        let local = vec![ObjectLocator::from(LocationDescriptor::new("k", "mem", 1))];
        assert!(!should_skip_batch_delete(&local, RequestMethod::Put, Some("mem")));
    }
}
