use serde::{Deserialize, Serialize};
use std::fmt;

const REMOTE_CATALOG_NAME: &str = "$remote";

/// Identifies the catalog a split or a partitioning handle belongs to.
///
/// Internal catalogs (remote exchange data, system tables) are never used
/// for node affinity decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogHandle {
    name: String,
    internal: bool,
}

impl CatalogHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal: false,
        }
    }

    /// The catalog used for splits that carry upstream task output.
    pub fn remote() -> Self {
        Self {
            name: REMOTE_CATALOG_NAME.to_string(),
            internal: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }
}

impl fmt::Display for CatalogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_catalog_is_internal() {
        assert!(CatalogHandle::remote().is_internal());
        assert!(!CatalogHandle::new("hive").is_internal());
        assert_eq!(CatalogHandle::new("hive").to_string(), "hive");
    }
}
