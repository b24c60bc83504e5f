use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use gantry_common::error::{GantryError, Result};
use gantry_common::types::{
    BackendHealth, BackendInfo, ByteRange, ByteStream, DiskUsage, KeyContext, LocationDescriptor,
};
use gantry_crypto::CipherBundle;
use tracing::{debug, info};

use crate::chunk::ChunkStoreBackend;
use crate::error::{DriverError, DriverResult};
use crate::file::FileBackend;
use crate::location::{LocationRegistry, LocationType};
use crate::mem::MemoryBackend;
use crate::traits::{ByteSink, CopiedObject, DataDriver, NativeCopyRequest};

pub const MULTIPLE_BACKENDS_NAME: &str = "multipleBackends";

/// Routes each request to the driver of one configured location.
///
/// Locations recorded on stored descriptors are the location names, so a
/// get or delete goes back to the client that performed the put.
#[derive(Debug)]
pub struct MultipleBackendGateway {
    registry: Arc<LocationRegistry>,
    clients: BTreeMap<String, Arc<dyn DataDriver>>,
}

impl MultipleBackendGateway {
    /// Builds one client per location. Cloud locations have no built-in
    /// driver and must be present in `external`.
    pub async fn from_registry(
        registry: Arc<LocationRegistry>,
        mut external: HashMap<String, Arc<dyn DataDriver>>,
    ) -> Result<Self> {
        let mut clients: BTreeMap<String, Arc<dyn DataDriver>> = BTreeMap::new();
        for (name, constraint) in registry.iter() {
            let client: Arc<dyn DataDriver> = match constraint.location_type {
                LocationType::Mem => Arc::new(MemoryBackend::new()),
                LocationType::File => {
                    let data_path = constraint.details.data_path.clone().ok_or_else(|| {
                        GantryError::Configuration(format!("file location {name} has no data_path"))
                    })?;
                    Arc::new(FileBackend::new(data_path).await.map_err(|err| {
                        GantryError::Configuration(format!("file location {name}: {err}"))
                    })?)
                }
                LocationType::Chunkstore => {
                    let config = constraint.details.chunk_store.as_ref().ok_or_else(|| {
                        GantryError::Configuration(format!(
                            "chunkstore location {name} has no chunk_store settings"
                        ))
                    })?;
                    Arc::new(ChunkStoreBackend::new(config).map_err(|err| {
                        GantryError::Configuration(format!("chunkstore location {name}: {err}"))
                    })?)
                }
                external_type => external.remove(name).ok_or_else(|| {
                    GantryError::Configuration(format!(
                        "no driver supplied for {} location {name}",
                        external_type.as_str()
                    ))
                })?,
            };
            info!(location = %name, location_type = constraint.location_type.as_str(), "registered data location");
            clients.insert(name.clone(), client);
        }

        Ok(Self { registry, clients })
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    pub fn client(&self, location: &str) -> DriverResult<&Arc<dyn DataDriver>> {
        self.clients
            .get(location)
            .ok_or_else(|| DriverError::UnknownLocation(location.to_string()))
    }

    /// Stores the object in the location chosen from `info` and returns a
    /// descriptor naming that location.
    pub async fn put(
        &self,
        stream: ByteStream,
        size: u64,
        ctx: &KeyContext,
        info: Option<&BackendInfo>,
        cipher: Option<CipherBundle>,
        request_id: &str,
    ) -> DriverResult<LocationDescriptor> {
        let info = info.ok_or_else(|| {
            DriverError::UnknownLocation("put carries no backend routing information".to_string())
        })?;
        let location = self.registry.resolve(info)?;
        let client = self.client(location)?;

        let encryption = cipher.as_ref().map(CipherBundle::encryption_info);
        let stream = match cipher {
            Some(cipher) => cipher.encrypt(stream).boxed(),
            None => stream,
        };
        let key = client.put(stream, size, ctx, request_id).await?;
        debug!(request_id, location = %location, key = %key, "put routed to location");

        let mut descriptor = LocationDescriptor::new(key, location, size);
        descriptor.data_store_type = self
            .registry
            .location_type(location)
            .map(|t| t.as_str().to_string());
        descriptor.encryption = encryption;
        Ok(descriptor)
    }

    pub async fn get(
        &self,
        location: &str,
        key: &str,
        range: Option<ByteRange>,
        request_id: &str,
    ) -> DriverResult<ByteStream> {
        self.client(location)?.get(key, range, request_id).await
    }

    pub async fn get_into(
        &self,
        location: &str,
        key: &str,
        range: Option<ByteRange>,
        sink: ByteSink,
        request_id: &str,
    ) -> DriverResult<()> {
        self.client(location)?
            .get_into(key, range, sink, request_id)
            .await
    }

    pub async fn delete(&self, location: &str, key: &str, request_id: &str) -> DriverResult<()> {
        self.client(location)?.delete(key, request_id).await
    }

    /// Status of every location keyed by location name.
    pub async fn healthcheck(&self, request_id: &str) -> BackendHealth {
        let checks = self.clients.iter().map(|(name, client)| async move {
            (name.clone(), client.healthcheck(request_id).await)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Sum over the locations able to report usage; `None` when none can.
    pub async fn disk_usage(&self, request_id: &str) -> DriverResult<Option<DiskUsage>> {
        let mut total: Option<DiskUsage> = None;
        for client in self.clients.values() {
            if let Some(usage) = client.disk_usage(request_id).await? {
                let sum = total.get_or_insert_with(DiskUsage::default);
                sum.total += usage.total;
                sum.free += usage.free;
                sum.available += usage.available;
            }
        }
        Ok(total)
    }

    /// Native copy performed by the destination location's client.
    pub async fn copy_object(
        &self,
        request: &NativeCopyRequest,
        request_id: &str,
    ) -> DriverResult<CopiedObject> {
        self.client(&request.dest_location)?
            .copy_object(request, request_id)
            .await
    }
}
