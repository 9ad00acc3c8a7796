//! Metadata catalog seam: device path -> storage group resolution

use crate::{Result, TesseraError};
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Resolves paths to storage groups
pub trait MetadataCatalog: Send + Sync {
    /// Storage group owning a device or series path
    fn storage_group_of(&self, path: &str) -> Result<String>;

    /// All registered storage groups
    fn storage_groups(&self) -> Vec<String>;

    fn contains_storage_group(&self, name: &str) -> bool;
}

/// Catalog kept in memory, filled at startup from configuration
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    groups: RwLock<BTreeSet<String>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a list of storage group names
    pub fn with_storage_groups<I, S>(groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let catalog = Self::new();
        for group in groups {
            catalog.set_storage_group(group.as_ref())?;
        }
        Ok(catalog)
    }

    /// Register a storage group. Groups may not nest inside each other.
    pub fn set_storage_group(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') {
            return Err(TesseraError::Config(format!(
                "invalid storage group name: {:?}",
                name
            )));
        }
        let mut groups = self.groups.write();
        if groups.contains(name) {
            return Ok(());
        }
        if let Some(existing) = groups
            .iter()
            .find(|g| is_prefix_of(g, name) || is_prefix_of(name, g))
        {
            return Err(TesseraError::Config(format!(
                "storage group {} overlaps existing group {}",
                name, existing
            )));
        }
        groups.insert(name.to_string());
        Ok(())
    }
}

fn is_prefix_of(group: &str, path: &str) -> bool {
    path == group
        || (path.len() > group.len()
            && path.starts_with(group)
            && path.as_bytes()[group.len()] == b'.')
}

impl MetadataCatalog for InMemoryCatalog {
    fn storage_group_of(&self, path: &str) -> Result<String> {
        self.groups
            .read()
            .iter()
            .filter(|g| is_prefix_of(g, path))
            .max_by_key(|g| g.len())
            .cloned()
            .ok_or_else(|| TesseraError::StorageGroupNotFound(path.to_string()))
    }

    fn storage_groups(&self) -> Vec<String> {
        self.groups.read().iter().cloned().collect()
    }

    fn contains_storage_group(&self, name: &str) -> bool {
        self.groups.read().contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution() {
        let catalog = InMemoryCatalog::with_storage_groups(["root.sg1", "root.sg2"]).unwrap();

        assert_eq!(catalog.storage_group_of("root.sg1.d1").unwrap(), "root.sg1");
        assert_eq!(catalog.storage_group_of("root.sg2.d1.s1").unwrap(), "root.sg2");
        assert_eq!(catalog.storage_group_of("root.sg1").unwrap(), "root.sg1");
        // A shared string prefix is not a path prefix
        assert!(matches!(
            catalog.storage_group_of("root.sg10.d1"),
            Err(TesseraError::StorageGroupNotFound(_))
        ));
        assert!(catalog.contains_storage_group("root.sg2"));
    }

    #[test]
    fn test_nested_groups_rejected() {
        let catalog = InMemoryCatalog::new();
        catalog.set_storage_group("root.sg1").unwrap();
        assert!(catalog.set_storage_group("root.sg1.inner").is_err());
        assert!(catalog.set_storage_group("root").is_err());
        assert!(catalog.set_storage_group("").is_err());
        catalog.set_storage_group("root.sg1").unwrap();
        assert_eq!(catalog.storage_groups(), vec!["root.sg1".to_string()]);
    }
}
