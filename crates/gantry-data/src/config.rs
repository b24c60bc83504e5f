use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use gantry_common::error::{GantryError, Result};
use gantry_crypto::{LocalKms, MasterKey};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::chunk::ChunkStoreConfig;
use crate::location::{LocationConstraint, LocationRegistry};

pub const DEFAULT_DATA_PATH: &str = "./data";
pub const DEFAULT_COPY_PART_CONCURRENCY: usize = 1;

pub const ENV_DATA_BACKEND: &str = "GANTRY_DATA_BACKEND";
pub const ENV_DATA_PATH: &str = "GANTRY_DATA_PATH";

/// Data layer settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub backend: BackendKind,
    pub data_path: PathBuf,
    pub chunk_store: Option<ChunkStoreConfig>,
    pub locations: BTreeMap<String, LocationConstraint>,
    /// Request endpoint to default location name.
    pub rest_endpoints: BTreeMap<String, String>,
    pub copy_part_concurrency: usize,
    /// Master key id to base64 encoded 32 byte key.
    pub master_keys: BTreeMap<String, String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            chunk_store: None,
            locations: BTreeMap::new(),
            rest_endpoints: BTreeMap::new(),
            copy_part_concurrency: DEFAULT_COPY_PART_CONCURRENCY,
            master_keys: BTreeMap::new(),
        }
    }
}

impl DataConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|err| {
            GantryError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|err| GantryError::Configuration(format!("invalid data config: {err}")))
    }

    /// Applies `GANTRY_DATA_BACKEND` and `GANTRY_DATA_PATH` over the file
    /// settings.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(
            std::env::var(ENV_DATA_BACKEND).ok().as_deref(),
            std::env::var(ENV_DATA_PATH).ok().as_deref(),
        )
    }

    fn apply_overrides(mut self, backend: Option<&str>, data_path: Option<&str>) -> Result<Self> {
        if let Some(backend) = backend.map(str::trim).filter(|value| !value.is_empty()) {
            self.backend = backend.parse()?;
        }
        if let Some(data_path) = data_path.map(str::trim).filter(|value| !value.is_empty()) {
            self.data_path = PathBuf::from(data_path);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.copy_part_concurrency == 0 {
            return Err(GantryError::Configuration(
                "copy_part_concurrency must be at least 1".to_string(),
            ));
        }
        match self.backend {
            BackendKind::ChunkStore if self.chunk_store.is_none() => Err(GantryError::Configuration(
                "chunkstore backend needs chunk_store settings".to_string(),
            )),
            BackendKind::Multiple if self.locations.is_empty() => Err(GantryError::Configuration(
                "multiple backend needs at least one location".to_string(),
            )),
            _ => self.location_registry().map(|_| ()),
        }
    }

    pub fn location_registry(&self) -> Result<LocationRegistry> {
        LocationRegistry::new(self.locations.clone(), self.rest_endpoints.clone())
    }

    pub fn local_kms(&self) -> Result<LocalKms> {
        let mut kms = LocalKms::new();
        for (id, encoded) in &self.master_keys {
            let raw = BASE64_STANDARD.decode(encoded).map_err(|err| {
                GantryError::Configuration(format!("master key {id} is not valid base64: {err}"))
            })?;
            let key = MasterKey::from_bytes(&raw).map_err(|err| {
                GantryError::Configuration(format!("master key {id}: {err}"))
            })?;
            kms = kms.with_master_key(id.clone(), key);
        }
        Ok(kms)
    }
}
