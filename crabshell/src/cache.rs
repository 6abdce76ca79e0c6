//! Content-addressed store for patched manifests.
//!
//! ```text
//! <root>/<key>/
//!   AndroidManifest.xml   # patched binary manifest
//!   resources.arsc        # only when rebuilt resources were requested
//!   meta.json             # originals; its mtime is the entry age
//! ```
//!
//! Entries are written into a sibling temp directory and renamed into place.
//! Removal renames the entry aside first, so readers see either a complete
//! entry or none.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::manifest::PatchedManifest;
use crate::toolchain::sha256_file_bytes;

const SCHEMA_TAG: &[u8] = b"crabshell-manifest-cache/v1";
const MANIFEST_FILE: &str = "AndroidManifest.xml";
const RESOURCES_FILE: &str = "resources.arsc";
const META_FILE: &str = "meta.json";

/// Inputs besides the artifact bytes that change the patch result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKeyOptions {
    pub use_rebuilt_resources: bool,
    pub provider_override: Option<String>,
    pub salt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    original_application: String,
    #[serde(default)]
    original_factory: Option<String>,
    has_resources: bool,
}

pub fn cache_key(artifact_sha256: &[u8; 32], options: &CacheKeyOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SCHEMA_TAG);
    hasher.update(artifact_sha256);
    hasher.update([u8::from(options.use_rebuilt_resources)]);
    update_optional(&mut hasher, options.provider_override.as_deref());
    update_optional(&mut hasher, options.salt.as_deref());
    hex::encode(hasher.finalize())
}

// Length-prefixed so that (None, "ab") and ("a", "b") cannot collide.
fn update_optional(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        None => hasher.update([0u8]),
        Some(value) => {
            hasher.update([1u8]);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit,
    Miss,
}

#[derive(Debug, Clone)]
pub struct ManifestCache {
    root: PathBuf,
}

impl ManifestCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ManifestCache { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn key_for(&self, artifact: &Path, options: &CacheKeyOptions) -> Result<String> {
        Ok(cache_key(&sha256_file_bytes(artifact)?, options))
    }

    /// Returns the cached result for `artifact`, or runs `compute` and stores
    /// what it produced. `compute` is not called on a hit.
    pub fn get_or_compute<F>(
        &self,
        artifact: &Path,
        options: &CacheKeyOptions,
        compute: F,
    ) -> Result<(String, PatchedManifest, Lookup)>
    where
        F: FnOnce() -> Result<PatchedManifest>,
    {
        let key = self.key_for(artifact, options)?;
        if let Some(entry) = self.lookup(&key) {
            info!("Manifest cache hit ({key})");
            return Ok((key, entry, Lookup::Hit));
        }

        info!("Manifest cache miss ({key})");
        let entry = compute()?;
        if let Err(error) = self.store(&key, &entry) {
            warn!("failed to store manifest cache entry {key}: {error}");
        }
        Ok((key, entry, Lookup::Miss))
    }

    /// A missing or unreadable entry is a miss.
    pub fn lookup(&self, key: &str) -> Option<PatchedManifest> {
        let dir = self.entry_dir(key);
        if !dir.is_dir() {
            return None;
        }
        match read_entry(&dir) {
            Ok(entry) => Some(entry),
            Err(error) => {
                debug!("{error}");
                None
            }
        }
    }

    pub fn store(&self, key: &str, entry: &PatchedManifest) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let staging = self.sibling(".tmp", key);
        let written = write_entry(&staging, entry).and_then(|()| self.publish(&staging, key));
        if written.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        written
    }

    fn publish(&self, staging: &Path, key: &str) -> Result<()> {
        let target = self.entry_dir(key);
        if target.exists() {
            self.remove(key)?;
        }
        match fs::rename(staging, &target) {
            Ok(()) => Ok(()),
            // Another writer published the same key in between. Entries are a
            // pure function of the key, so theirs is as good as ours.
            Err(_) if target.is_dir() => {
                fs::remove_dir_all(staging)?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Renames the entry aside, then deletes it.
    pub fn remove(&self, key: &str) -> Result<()> {
        let dir = self.entry_dir(key);
        let trash = self.sibling(".trash", key);
        match fs::rename(&dir, &trash) {
            Ok(()) => fs::remove_dir_all(&trash).map_err(Error::from),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn sibling(&self, kind: &str, key: &str) -> PathBuf {
        let nonce: u32 = rand::thread_rng().gen();
        self.root
            .join(format!("{kind}-{key}-{}-{nonce:08x}", std::process::id()))
    }

    /// Entry keys with their age stamp, skipping staging and trash dirs.
    pub fn entries(&self) -> Result<Vec<EntryStamp>> {
        let mut stamps = Vec::new();
        let listing = match fs::read_dir(&self.root) {
            Ok(listing) => listing,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(stamps),
            Err(error) => return Err(error.into()),
        };
        for entry in listing {
            let entry = entry?;
            let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if key.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            let modified = fs::metadata(&meta_path)
                .or_else(|_| entry.metadata())
                .and_then(|metadata| metadata.modified())
                .map(unix_seconds)
                .unwrap_or(0);
            stamps.push(EntryStamp { key, modified });
        }
        Ok(stamps)
    }

    /// Removes expired entries, then the oldest until at most `max_entries`
    /// remain. Returns the removed keys.
    pub fn prune(
        &self,
        max_entries: usize,
        ttl: Duration,
        now: SystemTime,
        preserve: &[&str],
    ) -> Result<Vec<String>> {
        let preserve: HashSet<&str> = preserve.iter().copied().collect();
        let doomed = plan_prune(
            &self.entries()?,
            max_entries,
            ttl.as_secs(),
            unix_seconds(now),
            &preserve,
        );
        for key in &doomed {
            self.remove(key)?;
            debug!("pruned manifest cache entry {key}");
        }
        Ok(doomed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStamp {
    pub key: String,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}

/// Decides which entries `prune` removes. Preserved keys are never chosen but
/// still count toward `max_entries`.
pub fn plan_prune(
    entries: &[EntryStamp],
    max_entries: usize,
    ttl_secs: u64,
    now_secs: u64,
    preserve: &HashSet<&str>,
) -> Vec<String> {
    let mut doomed = Vec::new();
    let mut survivors: Vec<&EntryStamp> = Vec::new();

    for entry in entries {
        let expired = now_secs.saturating_sub(entry.modified) > ttl_secs;
        if expired && !preserve.contains(entry.key.as_str()) {
            doomed.push(entry.key.clone());
        } else {
            survivors.push(entry);
        }
    }

    survivors.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));
    let mut excess = survivors.len().saturating_sub(max_entries);
    for entry in survivors {
        if excess == 0 {
            break;
        }
        if preserve.contains(entry.key.as_str()) {
            continue;
        }
        doomed.push(entry.key.clone());
        excess -= 1;
    }
    doomed
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn write_entry(dir: &Path, entry: &PatchedManifest) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(MANIFEST_FILE), &entry.manifest)?;
    if let Some(resources) = &entry.resources {
        fs::write(dir.join(RESOURCES_FILE), resources)?;
    }
    let meta = EntryMeta {
        original_application: entry.original_application.clone(),
        original_factory: entry.original_factory.clone(),
        has_resources: entry.resources.is_some(),
    };
    let json = serde_json::to_vec_pretty(&meta)
        .map_err(|error| Error::Config(format!("failed to serialize cache metadata: {error}")))?;
    // Written last: an entry without meta.json is incomplete.
    fs::write(dir.join(META_FILE), json)?;
    Ok(())
}

fn read_entry(dir: &Path) -> Result<PatchedManifest> {
    let corrupt = |reason: String| Error::CacheCorrupt {
        path: dir.to_path_buf(),
        reason,
    };

    let raw = fs::read(dir.join(META_FILE)).map_err(|error| corrupt(format!("meta.json: {error}")))?;
    let meta: EntryMeta =
        serde_json::from_slice(&raw).map_err(|error| corrupt(format!("meta.json: {error}")))?;
    let manifest = fs::read(dir.join(MANIFEST_FILE))
        .map_err(|error| corrupt(format!("{MANIFEST_FILE}: {error}")))?;
    if manifest.is_empty() {
        return Err(corrupt(format!("{MANIFEST_FILE} is empty")));
    }
    let resources = if meta.has_resources {
        Some(
            fs::read(dir.join(RESOURCES_FILE))
                .map_err(|error| corrupt(format!("{RESOURCES_FILE}: {error}")))?,
        )
    } else {
        None
    };

    Ok(PatchedManifest {
        manifest,
        resources,
        original_application: meta.original_application,
        original_factory: meta.original_factory,
    })
}
