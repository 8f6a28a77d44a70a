// ============================================================================
// BULB_STORE.RS - PERSISTED BULB REGISTRY
// bulbs.json maps a bulb MAC to the broker it was paired with
// ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BULBS_FILE: &str = "bulbs.json";

/// One remembered bulb
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulbRecord {
    pub broker: String,
}

/// File backed MAC -> broker mapping
#[derive(Debug, Clone)]
pub struct BulbStore {
    path: PathBuf,
}

impl BulbStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(BULBS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All known bulbs; a missing file is an empty registry
    pub fn load(&self) -> io::Result<BTreeMap<String, BulbRecord>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Remember (or update) the broker a bulb was paired with
    pub fn save(&self, mac: &str, broker: &str) -> io::Result<()> {
        let mut bulbs = self.load()?;
        bulbs.insert(mac.to_string(), BulbRecord { broker: broker.to_string() });

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&bulbs)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, json)?;
        info!("Saved bulb {} (broker {}) to {}", mac, broker, self.path.display());
        Ok(())
    }

    pub fn broker_for(&self, mac: &str) -> Option<String> {
        match self.load() {
            Ok(bulbs) => bulbs.get(mac).map(|record| record.broker.clone()),
            Err(e) => {
                debug!("Could not read {}: {}", self.path.display(), e);
                None
            }
        }
    }
}
