//! FSReader: cached reads of `/proc` and `/sys`, directory listings, and
//! file existence checks.
//!
//! The cache is a single-tier, path-keyed TTL map guarded by a
//! `parking_lot::RwLock` — deliberately not a multi-tier compressing cache,
//! since the values here are a handful of small kernel text files, not
//! object-storage payloads.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::warn;

use crate::commands::CommandRunner;

struct CacheEntry {
    value: String,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

pub struct FSReader {
    proc_root: PathBuf,
    sysfs_root: PathBuf,
    ttl: Duration,
    cache: RwLock<std::collections::HashMap<PathBuf, CacheEntry>>,
    commands: CommandRunner,
}

impl FSReader {
    pub fn new(proc_root: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            proc_root: proc_root.into(),
            sysfs_root: sysfs_root.into(),
            ttl,
            cache: RwLock::new(std::collections::HashMap::new()),
            commands: CommandRunner::default(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// Reads an absolute path. Missing files yield an empty string and are
    /// logged at warning level; they never raise. `cacheable` controls
    /// whether the value is stored in the TTL cache.
    pub async fn read_file(&self, path: &Path, cacheable: bool) -> String {
        if cacheable {
            if let Some(hit) = self.cache_lookup(path) {
                return hit;
            }
        }

        let value = match tokio::fs::read_to_string(path).await {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read file");
                String::new()
            }
        };

        if cacheable {
            self.cache.write().insert(
                path.to_path_buf(),
                CacheEntry {
                    value: value.clone(),
                    created_at: Instant::now(),
                },
            );
        }

        value
    }

    fn cache_lookup(&self, path: &Path) -> Option<String> {
        let cache = self.cache.read();
        let entry = cache.get(path)?;
        if entry.is_expired(self.ttl) {
            None
        } else {
            Some(entry.value.clone())
        }
    }

    /// Reads `<proc_root>/<name>`, e.g. `readProc("mdstat")`. Falls back to
    /// `cat <path>` via CommandRunner if the direct read is empty and the
    /// file is expected to exist — used by MdStatReader per the
    /// FilesystemRead fallback policy.
    pub async fn read_proc(&self, name: &str) -> String {
        self.read_file(&self.proc_root.join(name), true).await
    }

    /// Falls back to `cat` when a direct read fails; only used for paths the
    /// contract names explicitly (currently `/proc/mdstat`).
    pub async fn read_proc_with_cat_fallback(&self, name: &str) -> String {
        let path = self.proc_root.join(name);
        let direct = self.read_file(&path, true).await;
        if !direct.is_empty() {
            return direct;
        }
        let outcome = self.commands.run("cat", &[path.to_string_lossy().as_ref()], false).await;
        if outcome.success {
            self.invalidate(&path);
            self.cache.write().insert(
                path,
                CacheEntry {
                    value: outcome.sanitised_output.clone(),
                    created_at: Instant::now(),
                },
            );
            outcome.sanitised_output
        } else {
            warn!(path = %name, "cat fallback also failed");
            String::new()
        }
    }

    pub async fn read_sys(&self, rel_path: &str) -> String {
        self.read_file(&self.sysfs_root.join(rel_path), true).await
    }

    /// Reads `<device>/<prop>` under `/sys/block`, falling back to
    /// `<device>/device/<prop>` when the first is absent.
    pub async fn read_sys_block_props(&self, device: &str, props: &[&str]) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(props.len());
        for prop in props {
            let primary = format!("block/{device}/{prop}");
            let mut value = self.read_sys(&primary).await.trim().to_string();
            if value.is_empty() {
                let fallback = format!("block/{device}/device/{prop}");
                value = self.read_sys(&fallback).await.trim().to_string();
            }
            out.push((prop.to_string(), value));
        }
        out
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    pub async fn list_dir(&self, path: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut rd = match tokio::fs::read_dir(path).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not list directory");
                return names;
            }
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn invalidate(&self, path: &Path) {
        self.cache.write().remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_existing_file_and_caches_it() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("proc");
        tokio::fs::create_dir_all(&proc_dir).await.unwrap();
        tokio::fs::write(proc_dir.join("mdstat"), "Personalities :\n")
            .await
            .unwrap();

        let reader = FSReader::new(&proc_dir, dir.path().join("sys"), Duration::from_secs(60));
        let content = reader.read_proc("mdstat").await;
        assert_eq!(content, "Personalities :\n");
    }

    #[tokio::test]
    async fn missing_file_yields_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FSReader::new(dir.path().join("proc"), dir.path().join("sys"), Duration::from_secs(60));
        let content = reader.read_proc("does-not-exist").await;
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_read() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("proc");
        tokio::fs::create_dir_all(&proc_dir).await.unwrap();
        let path = proc_dir.join("mdstat");
        tokio::fs::write(&path, "first").await.unwrap();

        let reader = FSReader::new(&proc_dir, dir.path().join("sys"), Duration::from_secs(3600));
        assert_eq!(reader.read_proc("mdstat").await, "first");

        tokio::fs::write(&path, "second").await.unwrap();
        // Without invalidation the TTL cache still holds the old value.
        assert_eq!(reader.read_proc("mdstat").await, "first");

        reader.invalidate(&path);
        assert_eq!(reader.read_proc("mdstat").await, "second");
    }
}
