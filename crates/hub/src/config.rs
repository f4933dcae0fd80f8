//! TOML config file loading, validation, and database seeding for sensor
//! type reference data and the session owner.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::Db;
use crate::model::SensorType;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// User that owns locations created by provisioning.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub sensor_types: Vec<SensorTypeEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SensorTypeEntry {
    pub id: i64,
    pub parameter_id: i64,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Some(owner) = &self.owner_id {
            if owner.trim().is_empty() {
                errors.push("owner_id is empty".to_string());
            }
        }
        self.validate_sensor_types(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_sensor_types(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for (i, t) in self.sensor_types.iter().enumerate() {
            let ctx = format!("sensor_types[{i}] (id {})", t.id);

            if t.id <= 0 {
                errors.push(format!("{ctx}: id must be positive"));
            } else if !seen_ids.insert(t.id) {
                errors.push(format!("{ctx}: duplicate id"));
            }

            if t.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            if t.parameter_id < 0 {
                errors.push(format!(
                    "{ctx}: parameter_id must not be negative, got {}",
                    t.parameter_id
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all sensor types and the owner from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for t in &config.sensor_types {
        db.upsert_sensor_type(&SensorType {
            id: t.id,
            parameter_id: t.parameter_id,
            name: t.name.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert sensor type {}", t.id))?;
    }

    if let Some(owner) = &config.owner_id {
        db.set_owner(owner)
            .await
            .with_context(|| format!("failed to store owner '{owner}'"))?;
    }

    tracing::info!(
        sensor_types = config.sensor_types.len(),
        owner = config.owner_id.is_some(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
