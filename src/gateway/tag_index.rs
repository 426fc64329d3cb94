use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tag index stored as tags.yaml in each repository directory
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TagIndex {
    /// Maps tag names to manifest digests (`sha256:...`)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TagIndex {
    /// Load the index, or an empty one if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tag index from {:?}", path))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse tag index from {:?}", path))
    }

    /// Write the index atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("Tag index path {:?} has no parent", path))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;

        let temp_path = parent.join(".tags.yaml.tmp");
        let yaml = serde_yaml::to_string(self).context("Failed to serialize tag index")?;
        fs::write(&temp_path, yaml)
            .with_context(|| format!("Failed to write tag index to {:?}", temp_path))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to move tag index into place at {:?}", path))?;

        Ok(())
    }

    /// Point a tag at a digest, replacing any previous target
    pub fn set(&mut self, tag: &str, digest: &str) {
        self.tags.insert(tag.to_string(), digest.to_string());
    }

    pub fn get(&self, tag: &str) -> Option<&String> {
        self.tags.get(tag)
    }

    /// Drop every tag pointing at `digest`, returning how many were removed
    pub fn remove_digest(&mut self, digest: &str) -> usize {
        let before = self.tags.len();
        self.tags.retain(|_, target| target != digest);
        before - self.tags.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tags.keys()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo").join("tags.yaml");

        let mut index = TagIndex::default();
        index.set("v1", "sha256:aa");
        index.set("v2", "sha256:bb");
        index.save(&path).unwrap();

        let loaded = TagIndex::load(&path).unwrap();
        assert_eq!(loaded.get("v1"), Some(&"sha256:aa".to_string()));
        assert_eq!(loaded.names().count(), 2);
        assert!(!dir.path().join("repo").join(".tags.yaml.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let loaded = TagIndex::load(&dir.path().join("tags.yaml")).unwrap();
        assert_eq!(loaded.names().count(), 0);
    }

    #[test]
    fn test_remove_digest_drops_all_aliases() {
        let mut index = TagIndex::default();
        index.set("v1", "sha256:aa");
        index.set("stable", "sha256:aa");
        index.set("v2", "sha256:bb");

        assert_eq!(index.remove_digest("sha256:aa"), 2);
        assert_eq!(index.names().collect::<Vec<_>>(), vec!["v2"]);
    }
}
