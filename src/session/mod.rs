//! On-disk credential custody for the socket adapter.
//!
//! One session directory per logical client: a root credential blob
//! (`creds.json`) plus ephemeral per-peer key artifacts whose names
//! carry the markers in [`EPHEMERAL_MARKERS`]. The socket adapter that
//! opened the directory owns it exclusively; everything here uses
//! synchronous `std::fs` since these are quick local operations.

pub mod cleanup;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use tracing::{debug, info};

/// File name of the root credential artifact.
pub const ROOT_CREDS_FILE: &str = "creds.json";

/// Name markers identifying ephemeral key artifacts. The root
/// credential file never matches any of these.
pub const EPHEMERAL_MARKERS: &[&str] = &["session-", "pre-key-", "sender-key-"];

/// Credential store rooted at one session directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at `root`. Does not touch the filesystem;
    /// call [`ensure_dir`](Self::ensure_dir) before first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The session directory this store owns.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the session directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create session directory {}", self.root.display()))
    }

    fn root_creds_path(&self) -> PathBuf {
        self.root.join(ROOT_CREDS_FILE)
    }

    /// Load the persisted root credential blob, or `None` when the
    /// session is fresh (pairing not yet completed).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_root(&self) -> anyhow::Result<Option<serde_json::Value>> {
        let path = self.root_creds_path();
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read credentials {}", path.display()))
            }
        };
        let blob = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse credentials {}", path.display()))?;
        Ok(Some(blob))
    }

    /// Persist a root credential rotation. Writes to a temp file then
    /// renames, so a crash mid-write never leaves a truncated blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be written.
    pub fn persist_root(&self, blob: &serde_json::Value) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let path = self.root_creds_path();
        let tmp = self.root.join(format!("{ROOT_CREDS_FILE}.tmp"));
        let contents = serde_json::to_string(blob).context("failed to serialize credentials")?;
        fs::write(&tmp, contents)
            .with_context(|| format!("failed to write credentials {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace credentials {}", path.display()))?;
        debug!(path = %path.display(), "root credentials persisted");
        Ok(())
    }

    /// Persist an ephemeral key artifact under a sanitized file name.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be written.
    pub fn persist_ephemeral(&self, name: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let safe = sanitize_name(name);
        if safe.is_empty() {
            anyhow::bail!("ephemeral artifact name {name:?} sanitizes to nothing");
        }
        let path = self.root.join(safe);
        let contents = serde_json::to_string(data).context("failed to serialize key artifact")?;
        fs::write(&path, contents)
            .with_context(|| format!("failed to write key artifact {}", path.display()))?;
        Ok(())
    }

    /// Administrative per-number reset: delete every file under the
    /// session directory whose name or textual content contains the
    /// number's digits, pruning subdirectories that become empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the walk or a deletion fails.
    pub fn delete_by_number(&self, number: &str) -> anyhow::Result<usize> {
        let needle = crate::jid::digits(number);
        if needle.is_empty() {
            anyhow::bail!("number {number:?} contains no digits");
        }
        if !self.root.exists() {
            return Ok(0);
        }
        let deleted = delete_matching(&self.root, &|path| {
            if file_name_contains(path, &needle) {
                return true;
            }
            // Binary or unreadable files never content-match.
            fs::read_to_string(path).is_ok_and(|c| c.contains(&needle))
        })?;
        info!(number = %needle, deleted, dir = %self.root.display(), "per-number session reset");
        Ok(deleted)
    }

    /// Routine hygiene: delete every ephemeral-pattern file, leaving
    /// the root credential file untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the walk or a deletion fails.
    pub fn delete_by_patterns(&self) -> anyhow::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let deleted = delete_matching(&self.root, &is_ephemeral)?;
        info!(deleted, dir = %self.root.display(), "ephemeral session artifacts pruned");
        Ok(deleted)
    }

    /// Delete ephemeral-pattern files strictly older than `cutoff`,
    /// leaving newer files (possibly mid-use by an about-to-reconnect
    /// session) and the root credential file untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the walk or a deletion fails.
    pub fn delete_stale_ephemeral(&self, cutoff: SystemTime) -> anyhow::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        delete_matching(&self.root, &|path| {
            if !is_ephemeral(path) {
                return false;
            }
            modified_time(path).is_some_and(|mtime| mtime < cutoff)
        })
    }

    /// Full reset: force-delete the entire session directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn clear_all(&self) -> anyhow::Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&self.root)
            .with_context(|| format!("failed to remove session directory {}", self.root.display()))?;
        info!(dir = %self.root.display(), "session directory cleared");
        Ok(())
    }
}

/// Whether a file carries one of the ephemeral name markers.
fn is_ephemeral(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| EPHEMERAL_MARKERS.iter().any(|m| name.contains(m)))
}

fn file_name_contains(path: &Path, needle: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.contains(needle))
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Strip anything that could escape the session directory from an
/// artifact name supplied by the gateway.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// Recursive walk deleting files matched by `matches`. After a
/// subdirectory's walk, removes it if it became empty. Returns the
/// number of files deleted.
fn delete_matching(dir: &Path, matches: &dyn Fn(&Path) -> bool) -> anyhow::Result<usize> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read session directory {}", dir.display()))?;

    let mut deleted: usize = 0;
    for entry in entries {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();

        if path.is_dir() {
            deleted = deleted.saturating_add(delete_matching(&path, matches)?);
            let now_empty = fs::read_dir(&path)
                .map(|mut it| it.next().is_none())
                .unwrap_or(false);
            if now_empty {
                fs::remove_dir(&path).with_context(|| {
                    format!("failed to remove empty directory {}", path.display())
                })?;
                debug!(dir = %path.display(), "pruned empty session subdirectory");
            }
            continue;
        }

        if matches(&path) {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
            deleted = deleted.saturating_add(1);
        }
    }

    Ok(deleted)
}
