use std::collections::BTreeMap;
use std::path::PathBuf;

use gantry_common::error::{GantryError, Result};
use gantry_common::types::BackendInfo;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkStoreConfig;
use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    Mem,
    File,
    Chunkstore,
    AwsS3,
    Azure,
    Gcp,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mem => "mem",
            Self::File => "file",
            Self::Chunkstore => "chunkstore",
            Self::AwsS3 => "aws_s3",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mem" => Some(Self::Mem),
            "file" => Some(Self::File),
            "chunkstore" => Some(Self::Chunkstore),
            "aws_s3" => Some(Self::AwsS3),
            "azure" => Some(Self::Azure),
            "gcp" => Some(Self::Gcp),
            _ => None,
        }
    }

    /// Cloud stores whose drivers are supplied by the embedding application.
    pub fn is_external(&self) -> bool {
        matches!(self, Self::AwsS3 | Self::Azure | Self::Gcp)
    }

    /// Locations whose client downloads into a writable target rather than
    /// handing back a readable stream.
    pub fn pushes_to_sink(&self) -> bool {
        matches!(self, Self::Azure)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_storage_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_store: Option<ChunkStoreConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationConstraint {
    #[serde(rename = "type")]
    pub location_type: LocationType,
    #[serde(default)]
    pub details: LocationDetails,
}

impl LocationConstraint {
    pub fn new(location_type: LocationType) -> Self {
        Self {
            location_type,
            details: LocationDetails::default(),
        }
    }
}

/// Configured location constraints and the endpoint to location defaults.
#[derive(Debug, Clone, Default)]
pub struct LocationRegistry {
    locations: BTreeMap<String, LocationConstraint>,
    rest_endpoints: BTreeMap<String, String>,
}

impl LocationRegistry {
    pub fn new(
        locations: BTreeMap<String, LocationConstraint>,
        rest_endpoints: BTreeMap<String, String>,
    ) -> Result<Self> {
        for (endpoint, location) in &rest_endpoints {
            if !locations.contains_key(location) {
                return Err(GantryError::Configuration(format!(
                    "rest endpoint {endpoint} points at unknown location {location}"
                )));
            }
        }
        Ok(Self {
            locations,
            rest_endpoints,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LocationConstraint)> {
        self.locations.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn location_type(&self, name: &str) -> Option<LocationType> {
        self.locations.get(name).map(|loc| loc.location_type)
    }

    /// Both locations are azure and live in the same storage account.
    pub fn is_same_azure_account(&self, a: &str, b: &str) -> bool {
        let account = |name: &str| {
            self.locations
                .get(name)
                .filter(|loc| loc.location_type == LocationType::Azure)
                .and_then(|loc| loc.details.azure_storage_account.as_deref())
        };
        matches!((account(a), account(b)), (Some(x), Some(y)) if x == y)
    }

    /// Picks the location a put lands in: object constraint, then bucket
    /// constraint, then the default for the endpoint the request came in on.
    pub fn resolve<'a>(&'a self, info: &'a BackendInfo) -> DriverResult<&'a str> {
        let name = info
            .object_location_constraint
            .as_deref()
            .or(info.bucket_location_constraint.as_deref())
            .or_else(|| {
                self.rest_endpoints
                    .get(&info.request_endpoint)
                    .map(String::as_str)
            })
            .ok_or_else(|| {
                DriverError::UnknownLocation(format!(
                    "no location for endpoint {}",
                    info.request_endpoint
                ))
            })?;

        if !self.locations.contains_key(name) {
            return Err(DriverError::UnknownLocation(name.to_string()));
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gantry_common::types::BackendInfo;

    use super::{LocationConstraint, LocationRegistry, LocationType};

    fn azure(account: &str) -> LocationConstraint {
        let mut loc = LocationConstraint::new(LocationType::Azure);
        loc.details.azure_storage_account = Some(account.to_string());
        loc
    }

    fn registry() -> LocationRegistry {
        let locations = BTreeMap::from([
            ("us-east-1".to_string(), LocationConstraint::new(LocationType::Mem)),
            ("aws-1".to_string(), LocationConstraint::new(LocationType::AwsS3)),
            ("azure-a".to_string(), azure("acct1")),
            ("azure-b".to_string(), azure("acct1")),
            ("azure-c".to_string(), azure("acct2")),
        ]);
        let endpoints = BTreeMap::from([("localhost".to_string(), "us-east-1".to_string())]);
        LocationRegistry::new(locations, endpoints).unwrap()
    }

    #[test]
    fn resolution_prefers_object_then_bucket_then_endpoint() {
        let registry = registry();
        let info = BackendInfo::new("localhost");
        assert_eq!(registry.resolve(&info).unwrap(), "us-east-1");

        let info = info.with_bucket_location("aws-1");
        assert_eq!(registry.resolve(&info).unwrap(), "aws-1");

        let info = info.with_object_location("azure-a");
        assert_eq!(registry.resolve(&info).unwrap(), "azure-a");

        let unknown = BackendInfo::new("localhost").with_object_location("nowhere");
        assert!(registry.resolve(&unknown).is_err());
        assert!(registry.resolve(&BackendInfo::new("other-host")).is_err());
    }

    #[test]
    fn azure_account_comparison() {
        let registry = registry();
        assert!(registry.is_same_azure_account("azure-a", "azure-b"));
        assert!(!registry.is_same_azure_account("azure-a", "azure-c"));
        assert!(!registry.is_same_azure_account("azure-a", "aws-1"));
    }

    #[test]
    fn dangling_rest_endpoint_is_rejected() {
        let endpoints = BTreeMap::from([("localhost".to_string(), "missing".to_string())]);
        assert!(LocationRegistry::new(BTreeMap::new(), endpoints).is_err());
    }

    #[test]
    fn location_types_parse_and_deserialize() {
        assert_eq!(LocationType::parse("aws_s3"), Some(LocationType::AwsS3));
        assert!(LocationType::AwsS3.is_external());
        assert!(!LocationType::Chunkstore.is_external());
        let parsed: LocationConstraint =
            serde_json::from_str(r#"{"type":"azure","details":{"azure_storage_account":"a"}}"#)
                .unwrap();
        assert_eq!(parsed, azure("a"));
    }
}
