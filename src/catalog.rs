//! Product catalog lookup.
//!
//! The handshake only yields a product id; model name, icon, and the list of
//! supported DPIDs come from a catalog keyed by product id. The core depends
//! on the lookup alone — where the catalog data comes from (vendor API dump,
//! bundled file) is the caller's business.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Catalog entry for one product id.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductMatch {
    /// Device category code ("00" switch, "01" light, "02" energy storage).
    pub type_code: String,
    pub icon: Option<String>,
    pub model_name: String,
    pub dpids: Vec<u32>,
}

/// Read-only product id lookup. "Not found" is a value, not an error.
pub trait ProductCatalog: Send + Sync {
    fn lookup(&self, pid: &str) -> Option<ProductMatch>;
}

/// Catalog that never matches. Devices fall back to their self-reported
/// type code and the built-in model names.
#[derive(Debug, Default)]
pub struct EmptyCatalog;

impl ProductCatalog for EmptyCatalog {
    fn lookup(&self, _pid: &str) -> Option<ProductMatch> {
        None
    }
}

// Vendor catalog dump shape: a list of category groups, each with a type
// code `c` and a list of models `m`.
#[derive(Deserialize)]
struct RawGroup {
    c: String,
    m: Vec<RawModel>,
}

#[derive(Deserialize)]
struct RawModel {
    pid: String,
    n: String,
    #[serde(default)]
    i: Option<String>,
    #[serde(default)]
    dpid: Vec<u32>,
}

/// Catalog loaded from a vendor catalog dump (JSON file), indexed by
/// product id.
pub struct FileCatalog {
    by_pid: HashMap<String, ProductMatch>,
}

impl FileCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        Self::from_json(&content)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let groups: Vec<RawGroup> = serde_json::from_str(content)?;

        let mut by_pid = HashMap::new();
        for group in groups {
            for model in group.m {
                by_pid.insert(
                    model.pid,
                    ProductMatch {
                        type_code: group.c.clone(),
                        icon: model.i,
                        model_name: model.n,
                        dpids: model.dpid,
                    },
                );
            }
        }
        Ok(Self { by_pid })
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }
}

impl ProductCatalog for FileCatalog {
    fn lookup(&self, pid: &str) -> Option<ProductMatch> {
        self.by_pid.get(pid).cloned()
    }
}
