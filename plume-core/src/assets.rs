use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Resolves collaborator-relative resource names to bytes.
pub trait AssetSource: Send + Sync + fmt::Debug {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Assets under a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for DirAssets {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(path);
        std::fs::read(&full).with_context(|| format!("failed to read asset {}", full.display()))
    }
}

/// Assets held in memory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.insert(path.into(), bytes.into());
        self
    }
}

impl AssetSource for MemoryAssets {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("asset {path} not found"))
    }
}

/// Assets fetched from (and cached by) a Hugging Face Hub model repository.
pub struct HubAssets {
    repo_id: String,
    repo: hf_hub::api::sync::ApiRepo,
}

impl HubAssets {
    pub fn new(repo_id: &str, revision: Option<&str>) -> Result<Self> {
        let api = hf_hub::api::sync::Api::new().context("failed to create hf hub API")?;
        let repo = match revision {
            Some(revision) => api.repo(hf_hub::Repo::with_revision(
                repo_id.to_string(),
                hf_hub::RepoType::Model,
                revision.to_string(),
            )),
            None => api.repo(hf_hub::Repo::model(repo_id.to_string())),
        };
        Ok(Self {
            repo_id: repo_id.to_string(),
            repo,
        })
    }
}

impl fmt::Debug for HubAssets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubAssets")
            .field("repo_id", &self.repo_id)
            .finish()
    }
}

impl AssetSource for HubAssets {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let local = self
            .repo
            .get(path)
            .with_context(|| format!("failed to fetch {path} from {}", self.repo_id))?;
        std::fs::read(&local).with_context(|| format!("failed to read {}", local.display()))
    }
}

/// Where a set of assets lives, parsed from a user-supplied location string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    Dir(PathBuf),
    Hub {
        repo_id: String,
        revision: Option<String>,
    },
}

impl AssetLocation {
    /// `hf://owner/name[@revision]` selects the hub, anything else is a directory.
    pub fn parse(location: &str) -> Result<Self> {
        match location.strip_prefix("hf://") {
            Some(rest) => {
                let (repo_id, revision) = match rest.split_once('@') {
                    Some((repo_id, revision)) => (repo_id, Some(revision.to_string())),
                    None => (rest, None),
                };
                if repo_id.is_empty() || !repo_id.contains('/') {
                    return Err(anyhow!("unsupported hub repository: {location}"));
                }
                Ok(Self::Hub {
                    repo_id: repo_id.to_string(),
                    revision,
                })
            }
            None if location.is_empty() => Err(anyhow!("empty asset location")),
            None => Ok(Self::Dir(PathBuf::from(location))),
        }
    }

    pub fn open(&self) -> Result<Box<dyn AssetSource>> {
        tracing::info!(location = ?self, "opening asset source");
        match self {
            Self::Dir(root) => Ok(Box::new(DirAssets::new(root.clone()))),
            Self::Hub { repo_id, revision } => {
                Ok(Box::new(HubAssets::new(repo_id, revision.as_deref())?))
            }
        }
    }
}
