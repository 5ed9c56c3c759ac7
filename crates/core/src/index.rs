//! Artifact cache index
//!
//! The index remembers, per sidecar, which source URI and content hash the
//! cached archive came from. It is persisted as a YAML list of
//! `{name, uri, sha1, archive_path}` records in `<base>/.sidecars/index.yml`
//! and is always rewritten as a whole.
//!
//! A missing index file means an empty cache. A file that exists but cannot be
//! decoded is a [`CacheError::Corrupt`], fatal at startup.

use crate::config::{check_sidecar_name, SidecarSpec};
use crate::errors::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument};

/// Index file name inside the sidecars directory
pub const INDEX_FILE_NAME: &str = "index.yml";

/// One cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Sidecar name
    pub name: String,
    /// Source URI the archive was fetched from
    pub uri: String,
    /// Declared content hash at fetch time (may be empty)
    #[serde(default)]
    pub sha1: String,
    /// Archive location, relative to the sidecars directory
    pub archive_path: PathBuf,
}

/// Outcome of [`ArtifactIndex::should_download`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadDecision {
    /// Nothing cached for this source, fetch it
    Download,
    /// Cached entry matches the declaration
    UpToDate,
    /// Sidecar declares no artifact
    NoArtifact,
    /// Same URI but a different declared hash
    Mismatch { reason: String },
}

impl DownloadDecision {
    pub fn should_download(&self) -> bool {
        matches!(self, DownloadDecision::Download)
    }

    /// Non-empty only for a hash mismatch
    pub fn reason(&self) -> Option<&str> {
        match self {
            DownloadDecision::Mismatch { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Entries must stay inside the sidecars directory
fn check_entry(entry: &IndexEntry) -> std::result::Result<(), String> {
    check_sidecar_name(&entry.name).map_err(|e| e.to_string())?;
    let escapes = entry.archive_path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(format!(
            "archive path '{}' of '{}' leaves the sidecars directory",
            entry.archive_path.display(),
            entry.name
        ));
    }
    Ok(())
}

/// Persisted name to archive mapping
#[derive(Debug, Clone)]
pub struct ArtifactIndex {
    path: PathBuf,
    entries: BTreeMap<String, IndexEntry>,
}

impl ArtifactIndex {
    /// Load the index stored at `path`
    #[instrument(skip_all, fields(path = tracing::field::Empty))]
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tracing::Span::current().record("path", tracing::field::display(path.display()));
        if !path.exists() {
            debug!("No index file, starting with an empty cache");
            return Ok(Self {
                path,
                entries: BTreeMap::new(),
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| CacheError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let records: Vec<IndexEntry> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_yaml::from_str(&content).map_err(|e| CacheError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        };

        for entry in &records {
            check_entry(entry).map_err(|message| CacheError::Corrupt {
                path: path.display().to_string(),
                message,
            })?;
        }

        let entries = records
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect::<BTreeMap<_, _>>();
        debug!(entries = entries.len(), "Loaded artifact index");
        Ok(Self { path, entries })
    }

    /// Location of the index file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory archive paths are relative to
    pub fn root(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn lookup(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decide whether the artifact of `spec` has to be fetched
    ///
    /// A cached archive is only trusted when the sidecar declares a hash
    /// matching the one recorded with it.
    pub fn should_download(&self, spec: &SidecarSpec) -> DownloadDecision {
        let Some(uri) = spec.artifact_uri() else {
            return DownloadDecision::NoArtifact;
        };
        let Some(entry) = self.entries.get(spec.name()) else {
            return DownloadDecision::Download;
        };
        if entry.uri != uri {
            return DownloadDecision::Download;
        }
        match spec.artifact_sha1() {
            Some(declared) if !declared.eq_ignore_ascii_case(&entry.sha1) => {
                DownloadDecision::Mismatch {
                    reason: format!(
                        "Index sha1 '{}' mismatch with current sha1 '{}'",
                        entry.sha1, declared
                    ),
                }
            }
            Some(_) => DownloadDecision::UpToDate,
            None => DownloadDecision::Download,
        }
    }

    /// Create or replace the entry of `spec`; does not persist
    pub fn record(&mut self, spec: &SidecarSpec, archive_path: impl Into<PathBuf>) {
        let entry = IndexEntry {
            name: spec.name().to_string(),
            uri: spec.artifact_uri().unwrap_or_default().to_string(),
            sha1: spec.artifact_sha1().unwrap_or_default().to_string(),
            archive_path: archive_path.into(),
        };
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<IndexEntry> {
        self.entries.remove(name)
    }

    /// Entries whose sidecar no longer appears in `specs`
    pub fn reconcile(&self, specs: &[SidecarSpec]) -> Vec<IndexEntry> {
        let current: HashSet<&str> = specs.iter().map(SidecarSpec::name).collect();
        self.entries
            .values()
            .filter(|entry| !current.contains(entry.name.as_str()))
            .cloned()
            .collect()
    }

    /// Rewrite the whole index file
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn persist(&self) -> Result<()> {
        let io_err = |source| CacheError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let records: Vec<&IndexEntry> = self.entries.values().collect();
        let yaml = serde_yaml::to_string(&records).map_err(|e| CacheError::Serialize {
            message: e.to_string(),
        })?;

        let file_name = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(INDEX_FILE_NAME);
        let temp_path = self.path.with_file_name(format!(".{}.tmp", file_name));
        fs::write(&temp_path, yaml).map_err(io_err)?;
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(io_err(e).into());
        }

        debug!(entries = records.len(), "Persisted artifact index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SidecarsError;
    use tempfile::TempDir;

    fn spec(name: &str, uri: &str, sha1: Option<&str>) -> SidecarSpec {
        SidecarSpec::new(name, "bin/run")
            .unwrap()
            .with_artifact(uri, None, sha1)
    }

    #[test]
    fn test_missing_file_is_empty_cache() {
        let tmp = TempDir::new().unwrap();
        let index = ArtifactIndex::load(tmp.path().join(INDEX_FILE_NAME)).unwrap();
        assert!(index.is_empty());
        assert_eq!(
            index.should_download(&spec("a", "http://x/a.zip", None)),
            DownloadDecision::Download
        );
    }

    #[test]
    fn test_corrupt_file_is_cache_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(INDEX_FILE_NAME);
        fs::write(&path, "name: [unclosed").unwrap();
        let err = ArtifactIndex::load(&path).unwrap_err();
        assert!(matches!(err, SidecarsError::Cache(CacheError::Corrupt { .. })));
    }

    #[test]
    fn test_should_download_decisions() {
        let tmp = TempDir::new().unwrap();
        let mut index = ArtifactIndex::load(tmp.path().join(INDEX_FILE_NAME)).unwrap();
        let cached = spec("a", "http://x/a.zip", Some("abc"));
        index.record(&cached, ".cache/a.zip");

        let no_artifact = SidecarSpec::new("a", "run").unwrap();
        assert_eq!(
            index.should_download(&no_artifact),
            DownloadDecision::NoArtifact
        );
        assert_eq!(
            index.should_download(&spec("b", "http://x/b.zip", None)),
            DownloadDecision::Download
        );
        assert_eq!(
            index.should_download(&spec("a", "http://x/a2.zip", Some("abc"))),
            DownloadDecision::Download
        );
        assert_eq!(index.should_download(&cached), DownloadDecision::UpToDate);
        assert_eq!(
            index.should_download(&spec("a", "http://x/a.zip", None)),
            DownloadDecision::Download
        );

        let drifted = spec("a", "http://x/a.zip", Some("def"));
        let first = index.should_download(&drifted);
        assert!(!first.should_download());
        assert!(first.reason().unwrap().contains("def"));
        assert_eq!(first, index.should_download(&drifted));
    }

    #[test]
    fn test_entries_escaping_sidecars_dir_are_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(INDEX_FILE_NAME);
        for record in [
            "- name: a\n  uri: u\n  archive_path: ../../outside.zip\n",
            "- name: a\n  uri: u\n  archive_path: /etc/passwd\n",
            "- name: ../victim\n  uri: u\n  archive_path: .cache/a.zip\n",
        ] {
            fs::write(&path, record).unwrap();
            let err = ArtifactIndex::load(&path).unwrap_err();
            assert!(
                matches!(err, SidecarsError::Cache(CacheError::Corrupt { .. })),
                "{record}"
            );
        }
    }

    #[test]
    fn test_reconcile_returns_only_stale_entries() {
        let tmp = TempDir::new().unwrap();
        let mut index = ArtifactIndex::load(tmp.path().join(INDEX_FILE_NAME)).unwrap();
        index.record(&spec("a", "u1", None), ".cache/a.zip");
        index.record(&spec("b", "u2", None), ".cache/b.zip");
        index.record(&spec("c", "u3", None), ".cache/c.zip");

        let current = vec![spec("a", "u1", None), spec("c", "u3", None)];
        let stale = index.reconcile(&current);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "b");
    }

    #[test]
    fn test_persist_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join(INDEX_FILE_NAME);
        let mut index = ArtifactIndex::load(&path).unwrap();
        index.record(&spec("a", "u1", Some("ff")), ".cache/a.zip");
        index.persist().unwrap();

        assert!(path.exists());
        assert!(!path.with_file_name(".index.yml.tmp").exists());
        assert_eq!(index.root(), tmp.path().join("nested"));
    }
}
