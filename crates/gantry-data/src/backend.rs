use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use gantry_common::error::{GantryError, Result};
use gantry_common::types::ObjectLocator;
use serde::{Deserialize, Serialize};

use crate::chunk::{CHUNK_STORE_BACKEND_NAME, ChunkStoreBackend};
use crate::config::DataConfig;
use crate::file::{FILE_BACKEND_NAME, FileBackend};
use crate::mem::{MEMORY_BACKEND_NAME, MemoryBackend};
use crate::multiple::{MULTIPLE_BACKENDS_NAME, MultipleBackendGateway};
use crate::traits::DataDriver;

/// Backend selected by configuration. Anything else is rejected at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    ChunkStore,
    Multiple,
}

impl BackendKind {
    pub const ALL: [Self; 4] = [Self::Memory, Self::File, Self::ChunkStore, Self::Multiple];

    /// Name used in configuration files and the environment.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "mem",
            Self::File => "file",
            Self::ChunkStore => "chunkstore",
            Self::Multiple => "multiple",
        }
    }

    pub fn impl_name(&self) -> &'static str {
        match self {
            Self::Memory => MEMORY_BACKEND_NAME,
            Self::File => FILE_BACKEND_NAME,
            Self::ChunkStore => CHUNK_STORE_BACKEND_NAME,
            Self::Multiple => MULTIPLE_BACKENDS_NAME,
        }
    }
}

impl FromStr for BackendKind {
    type Err = GantryError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| GantryError::Configuration(format!("unknown data backend: {value}")))
    }
}

impl TryFrom<String> for BackendKind {
    type Error = GantryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BackendKind> for &'static str {
    fn from(kind: BackendKind) -> Self {
        kind.as_str()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The active data backend. Cheap to clone; every variant shares its driver.
#[derive(Debug, Clone)]
pub enum DataBackend {
    Memory(Arc<MemoryBackend>),
    File(Arc<FileBackend>),
    ChunkStore(Arc<ChunkStoreBackend>),
    Multiple(Arc<MultipleBackendGateway>),
    /// A driver supplied by the embedding application.
    External(Arc<dyn DataDriver>),
}

impl DataBackend {
    pub async fn from_config(
        config: &DataConfig,
        external: HashMap<String, Arc<dyn DataDriver>>,
    ) -> Result<Self> {
        let backend = match config.backend {
            BackendKind::Memory => Self::Memory(Arc::new(MemoryBackend::new())),
            BackendKind::File => {
                let backend = FileBackend::new(config.data_path.clone())
                    .await
                    .map_err(|err| GantryError::Configuration(format!("file backend: {err}")))?;
                Self::File(Arc::new(backend))
            }
            BackendKind::ChunkStore => {
                let settings = config.chunk_store.as_ref().ok_or_else(|| {
                    GantryError::Configuration("chunkstore backend needs chunk_store settings".to_string())
                })?;
                let backend = ChunkStoreBackend::new(settings).map_err(|err| {
                    GantryError::Configuration(format!("chunkstore backend: {err}"))
                })?;
                Self::ChunkStore(Arc::new(backend))
            }
            BackendKind::Multiple => {
                let registry = Arc::new(config.location_registry()?);
                let gateway = MultipleBackendGateway::from_registry(registry, external).await?;
                Self::Multiple(Arc::new(gateway))
            }
        };
        Ok(backend)
    }

    pub fn impl_name(&self) -> &str {
        match self {
            Self::Multiple(_) => MULTIPLE_BACKENDS_NAME,
            Self::Memory(driver) => driver.name(),
            Self::File(driver) => driver.name(),
            Self::ChunkStore(driver) => driver.name(),
            Self::External(driver) => driver.name(),
        }
    }

    /// The single driver behind this backend; `None` for the gateway.
    pub fn driver(&self) -> Option<&dyn DataDriver> {
        match self {
            Self::Memory(driver) => Some(driver.as_ref()),
            Self::File(driver) => Some(driver.as_ref()),
            Self::ChunkStore(driver) => Some(driver.as_ref()),
            Self::External(driver) => Some(driver.as_ref()),
            Self::Multiple(_) => None,
        }
    }

    /// The driver that holds the bytes of `locator`.
    ///
    /// A single-driver backend refuses descriptors written by another
    /// backend. The gateway routes on the recorded location name, so bare
    /// legacy keys cannot be routed.
    pub fn resolve(&self, locator: &ObjectLocator) -> Result<&dyn DataDriver> {
        if let Self::Multiple(gateway) = self {
            let location = locator.data_store_name().ok_or_else(|| {
                GantryError::Configuration(format!(
                    "location {} has no data store name to route on",
                    locator.key()
                ))
            })?;
            return gateway
                .client(location)
                .map(|client| client.as_ref())
                .map_err(|err| GantryError::Configuration(err.to_string()));
        }

        let driver = self.driver().ok_or(GantryError::InternalError)?;
        match locator.data_store_name() {
            Some(name) if name != driver.name() => Err(GantryError::Configuration(format!(
                "location {} belongs to data store {name}, active data store is {}",
                locator.key(),
                driver.name()
            ))),
            _ => Ok(driver),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gantry_common::GantryError;
    use gantry_common::types::{LocationDescriptor, ObjectLocator};

    use super::{BackendKind, DataBackend};
    use crate::mem::MemoryBackend;

    #[test]
    fn backend_kind_parsing() {
        assert_eq!("mem".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!("multiple".parse::<BackendKind>().unwrap().impl_name(), "multipleBackends");
        assert!(matches!(
            "tape".parse::<BackendKind>(),
            Err(GantryError::Configuration(_))
        ));
    }

    #[test]
    fn backend_kind_names_agree_across_parse_display_and_serde() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
            assert_eq!(serde_json::from_str::<BackendKind>(&json).unwrap(), kind);
        }
        assert!(serde_json::from_str::<BackendKind>("\"tape\"").is_err());
    }

    #[test]
    fn single_driver_rejects_foreign_descriptors() {
        let backend = DataBackend::Memory(Arc::new(MemoryBackend::new()));
        let own = ObjectLocator::from(LocationDescriptor::new("1", "mem", 3));
        let legacy = ObjectLocator::from("1");
        let foreign = ObjectLocator::from(LocationDescriptor::new("1", "file", 3));

        assert_eq!(backend.resolve(&own).unwrap().name(), "mem");
        assert_eq!(backend.resolve(&legacy).unwrap().name(), "mem");
        assert!(matches!(
            backend.resolve(&foreign),
            Err(GantryError::Configuration(_))
        ));
    }
}
