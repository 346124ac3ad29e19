use std::collections::BTreeMap;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::types::{ConfidenceLevel, DeviceProfile, DeviceProfileMap, Identifier, MatchCondition};

/// Profile as published in the DeviceProfiles JSON file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawProfile {
    device_profile_uuid: String,
    #[serde(default)]
    device_profile_version: u32,
    #[serde(default)]
    manufacturer: String,
    #[serde(default)]
    model: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    last_updated: DateTime<Utc>,
    #[serde(default)]
    upload_stats: bool,
    #[serde(default)]
    identifiers: Vec<RawIdentifier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawIdentifier {
    identify_confidence_level: ConfidenceLevel,
    #[serde(default)]
    match_condition: BTreeMap<String, String>,
    #[serde(default)]
    must_contain: BTreeMap<String, Vec<String>>,
}

impl From<RawIdentifier> for Identifier {
    fn from(raw: RawIdentifier) -> Self {
        let string_conditions = raw
            .match_condition
            .into_iter()
            .map(|(key, value)| MatchCondition::new(key, value));
        let subset_conditions = raw.must_contain.into_iter().flat_map(|(key, values)| {
            values
                .into_iter()
                .map(move |value| MatchCondition::subset(key.clone(), value))
        });

        Identifier {
            confidence: raw.identify_confidence_level,
            conditions: string_conditions.chain(subset_conditions).collect(),
        }
    }
}

impl From<RawProfile> for DeviceProfile {
    fn from(raw: RawProfile) -> Self {
        DeviceProfile {
            uuid: raw.device_profile_uuid,
            version: raw.device_profile_version,
            manufacturer: raw.manufacturer,
            model: raw.model,
            last_updated: raw.last_updated,
            upload_stats: raw.upload_stats,
            identifiers: raw.identifiers.into_iter().map(Identifier::from).collect(),
        }
    }
}

/// Parse a DeviceProfiles JSON document into a catalog keyed by profile UUID
pub fn parse_catalog(json: &str) -> Result<DeviceProfileMap> {
    let raw: Vec<RawProfile> = serde_json::from_str(json)
        .context("Failed to parse device profiles")?;

    let mut catalog = DeviceProfileMap::with_capacity(raw.len());
    for profile in raw {
        let profile = DeviceProfile::from(profile);
        if let Some(previous) = catalog.insert(profile.uuid.clone(), profile) {
            tracing::warn!("Duplicate device profile {}, keeping the last one", previous.uuid);
        }
    }

    Ok(catalog)
}

/// Load the device profile catalog from disk
pub fn load_catalog(path: impl AsRef<Path>) -> Result<DeviceProfileMap> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read device profiles: {}", path.display()))?;

    let catalog = parse_catalog(&contents)
        .with_context(|| format!("Invalid device profiles file: {}", path.display()))?;

    tracing::info!("Loaded {} device profiles from {}", catalog.len(), path.display());
    Ok(catalog)
}
