//! Fingerprint to map-cell index used to place the current relay on a map

use anonroute_common::Fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoEntry {
    pub hex_id: String,
    pub coordinates: Coordinates,
}

#[derive(Debug, Error)]
pub enum GeoIndexError {
    #[error("Failed to read geo index: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse geo index: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Geo index must be a JSON object keyed by fingerprint")]
    NotAnObject,
}

/// Read-only after load
#[derive(Debug, Clone, Default)]
pub struct FingerprintGeoIndex {
    entries: HashMap<Fingerprint, GeoEntry>,
}

impl FingerprintGeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"<FP>": {"hexId": "...", "coordinates": [lat, lon]}}`
    ///
    /// Entries with a bad fingerprint or without exactly two coordinates
    /// are skipped.
    pub fn from_json(json: &str) -> Result<Self, GeoIndexError> {
        let document: Value = serde_json::from_str(json)?;
        let object = document.as_object().ok_or(GeoIndexError::NotAnObject)?;

        let mut entries = HashMap::with_capacity(object.len());
        for (key, value) in object {
            let Ok(fingerprint) = Fingerprint::from_hex(key) else {
                debug!(key = %key, "Skipping geo entry with bad fingerprint");
                continue;
            };

            let coordinates = match value.get("coordinates").and_then(Value::as_array) {
                Some(pair) if pair.len() == 2 => match (pair[0].as_f64(), pair[1].as_f64()) {
                    (Some(latitude), Some(longitude)) => Coordinates {
                        latitude,
                        longitude,
                    },
                    _ => continue,
                },
                _ => continue,
            };
            let hex_id = value
                .get("hexId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            entries.insert(fingerprint, GeoEntry { hex_id, coordinates });
        }

        Ok(Self { entries })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, GeoIndexError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        let index = Self::from_json(&json)?;
        info!(path = %path.display(), entries = index.len(), "Loaded fingerprint geo index");
        Ok(index)
    }

    pub fn insert(&mut self, fingerprint: Fingerprint, entry: GeoEntry) {
        self.entries.insert(fingerprint, entry);
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&GeoEntry> {
        self.entries.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
