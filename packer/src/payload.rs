//! Payload selection, encryption and the blob format the loader parses.
//!
//! ```text
//! ciphertext_1 .. ciphertext_N
//! metadata: u32 N, then N x (u16 name_len, name, u32 size, [u8; 12] nonce)
//! u32 metadata_len
//! "SHELL"
//! ```
//! All integers are little-endian.

use std::collections::HashSet;
use std::io::{Read, Seek};
use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{bail, Context};
use glob::Pattern;
use log::{debug, info};
use rand::Rng;
use zip::ZipArchive;

pub const PAYLOAD_ENTRY: &str = "assets/kapp_payload.bin";
pub const MAGIC: &[u8; 5] = b"SHELL";
pub const NONCE_LEN: usize = 12;

/// Which target entries stay in plaintext.
#[derive(Debug, Default)]
pub struct KeepRules {
    /// Dex type descriptors, `Lcom/example/App;`.
    pub descriptors: Vec<String>,
    /// Package prefixes as descriptor prefixes, `Lcom/example/`.
    pub prefixes: Vec<String>,
    pub libs: Vec<String>,
    pub encrypt_assets: Vec<Pattern>,
}

impl KeepRules {
    pub fn new(classes: &[String], prefixes: &[String], libs: &[String], encrypt_assets: &[String]) -> anyhow::Result<Self> {
        let encrypt_assets = encrypt_assets
            .iter()
            .map(|raw| Pattern::new(raw).with_context(|| format!("invalid --encrypt-asset pattern {raw:?}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(KeepRules {
            descriptors: classes.iter().map(|class| to_dex_descriptor(class)).collect(),
            prefixes: prefixes
                .iter()
                .map(|prefix| format!("L{}/", prefix.trim().trim_matches('.').replace('.', "/")))
                .collect(),
            libs: libs.to_vec(),
            encrypt_assets,
        })
    }

    /// Whether `name` is a payload candidate before its bytes are inspected.
    pub fn is_candidate(&self, name: &str) -> bool {
        if name == PAYLOAD_ENTRY {
            return false;
        }
        let is_dex = !name.contains('/') && name.starts_with("classes") && name.ends_with(".dex");
        let is_lib = name.starts_with("lib/") && name.ends_with(".so");
        let is_asset = name.starts_with("assets/")
            && self.encrypt_assets.iter().any(|pattern| pattern.matches(name));
        is_dex || is_lib || is_asset
    }

    pub fn keeps(&self, name: &str, bytes: &[u8]) -> bool {
        if name.ends_with(".dex") {
            return self
                .descriptors
                .iter()
                .chain(&self.prefixes)
                .any(|needle| contains(bytes, needle.as_bytes()));
        }
        if name.ends_with(".so") {
            let file_name = Path::new(name)
                .file_name()
                .and_then(|file_name| file_name.to_str())
                .unwrap_or_default();
            return self.libs.iter().any(|kept| {
                file_name == kept || file_name == format!("lib{kept}.so") || file_name == format!("{kept}.so")
            });
        }
        false
    }
}

pub fn to_dex_descriptor(class_name: &str) -> String {
    let trimmed = class_name.trim();
    if trimmed.starts_with('L') && trimmed.ends_with(';') {
        return trimmed.to_string();
    }
    format!("L{};", trimmed.replace('.', "/"))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

#[derive(Debug)]
pub struct EncryptedEntry {
    pub name: String,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Names of the entries that go into the payload, in archive order.
pub fn select<R: Read + Seek>(target: &mut ZipArchive<R>, rules: &KeepRules) -> anyhow::Result<Vec<String>> {
    Ok(read_selected(target, rules)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// Encrypts every selected entry under `key` with a fresh nonce each.
pub fn encrypt_entries<R: Read + Seek>(
    target: &mut ZipArchive<R>,
    rules: &KeepRules,
    key: &[u8; 32],
) -> anyhow::Result<Vec<EncryptedEntry>> {
    let cipher = Aes256Gcm::new(&(*key).into());
    let entries = read_selected(target, rules)?
        .into_iter()
        .map(|(name, plaintext)| -> anyhow::Result<EncryptedEntry> {
            info!("Encrypting {name}...");
            let (ciphertext, nonce) = encrypt(&cipher, &plaintext)?;
            debug!("{name}: nonce={}", hex::encode(nonce));
            Ok(EncryptedEntry {
                name,
                ciphertext,
                nonce,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    info!("Encrypted {} entries total", entries.len());
    Ok(entries)
}

fn read_selected<R: Read + Seek>(target: &mut ZipArchive<R>, rules: &KeepRules) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut selected = Vec::new();
    for index in 0..target.len() {
        let mut entry = target.by_index(index)?;
        let name = entry.name().to_string();
        if entry.is_dir() || !rules.is_candidate(&name) {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        if rules.keeps(&name, &bytes) {
            info!("Keeping {name} in plaintext for startup compatibility");
            continue;
        }
        selected.push((name, bytes));
    }
    Ok(selected)
}

fn encrypt(cipher: &Aes256Gcm, data: &[u8]) -> anyhow::Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| anyhow::anyhow!("Encryption failure: {:?}", e))?;
    Ok((ciphertext, nonce_bytes))
}

pub fn build_blob(entries: &[EncryptedEntry]) -> Vec<u8> {
    let mut blob = Vec::new();
    for entry in entries {
        blob.extend_from_slice(&entry.ciphertext);
    }

    let mut metadata = Vec::new();
    metadata.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        let name = entry.name.as_bytes();
        metadata.extend_from_slice(&(name.len() as u16).to_le_bytes());
        metadata.extend_from_slice(name);
        metadata.extend_from_slice(&(entry.ciphertext.len() as u32).to_le_bytes());
        metadata.extend_from_slice(&entry.nonce);
    }

    blob.extend_from_slice(&metadata);
    blob.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    blob.extend_from_slice(MAGIC);
    blob
}

/// One metadata record of a parsed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub nonce: [u8; NONCE_LEN],
}

/// Parses the metadata of a blob written by [`build_blob`].
pub fn parse_blob(blob: &[u8]) -> anyhow::Result<Vec<BlobRecord>> {
    let Some(body) = blob.strip_suffix(MAGIC.as_slice()) else {
        bail!("payload blob has no {} footer", String::from_utf8_lossy(MAGIC));
    };
    let Some(split) = body.len().checked_sub(4) else {
        bail!("payload blob is truncated");
    };
    let metadata_len = read_u32(body, split)? as usize;
    let Some(metadata_start) = split.checked_sub(metadata_len) else {
        bail!("payload metadata length {metadata_len} exceeds the blob");
    };
    let metadata = &body[metadata_start..split];

    let count = read_u32(metadata, 0)? as usize;
    let mut cursor = 4;
    let mut offset = 0;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = read_u16(metadata, cursor)? as usize;
        cursor += 2;
        let name = metadata
            .get(cursor..cursor + name_len)
            .context("payload metadata truncated in entry name")?;
        let name = String::from_utf8(name.to_vec()).context("payload entry name is not UTF-8")?;
        cursor += name_len;
        let size = read_u32(metadata, cursor)? as usize;
        cursor += 4;
        let nonce: [u8; NONCE_LEN] = metadata
            .get(cursor..cursor + NONCE_LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .context("payload metadata truncated in nonce")?;
        cursor += NONCE_LEN;
        records.push(BlobRecord {
            name,
            offset,
            size,
            nonce,
        });
        offset += size;
    }
    if offset != metadata_start {
        bail!("payload ciphertexts span {offset} bytes but metadata starts at {metadata_start}");
    }
    Ok(records)
}

fn read_u32(bytes: &[u8], at: usize) -> anyhow::Result<u32> {
    let raw: [u8; 4] = bytes
        .get(at..at + 4)
        .and_then(|raw| raw.try_into().ok())
        .context("payload blob truncated")?;
    Ok(u32::from_le_bytes(raw))
}

fn read_u16(bytes: &[u8], at: usize) -> anyhow::Result<u16> {
    let raw: [u8; 2] = bytes
        .get(at..at + 2)
        .and_then(|raw| raw.try_into().ok())
        .context("payload blob truncated")?;
    Ok(u16::from_le_bytes(raw))
}

/// The set of names a `--payload-in` blob was built from must match what the
/// target still selects, otherwise the repack would drop or keep the wrong
/// entries.
pub fn check_matches(records: &[BlobRecord], selected: &[String]) -> anyhow::Result<()> {
    let in_blob: HashSet<&str> = records.iter().map(|record| record.name.as_str()).collect();
    let in_target: HashSet<&str> = selected.iter().map(String::as_str).collect();
    if in_blob != in_target {
        let mut missing: Vec<_> = in_target.difference(&in_blob).collect();
        let mut extra: Vec<_> = in_blob.difference(&in_target).collect();
        missing.sort();
        extra.sort();
        bail!("payload blob does not match the target: missing={missing:?} unexpected={extra:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    const KEY: [u8; 32] = [7u8; 32];

    fn target() -> ZipArchive<Cursor<Vec<u8>>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in [
            ("AndroidManifest.xml", "manifest"),
            ("classes.dex", "dex Lcom/example/App; body"),
            ("classes2.dex", "dex Lcom/vendor/sdk/Init; body"),
            ("classes3.dex", "dex Lcom/other/Thing; body"),
            ("lib/arm64-v8a/libapp.so", "elf"),
            ("lib/arm64-v8a/libmmkv.so", "elf"),
            ("assets/index.js", "js"),
            ("assets/fonts/a.ttf", "ttf"),
            (PAYLOAD_ENTRY, "old payload"),
        ] {
            writer.start_file(name, FileOptions::default()).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        ZipArchive::new(writer.finish().unwrap()).unwrap()
    }

    fn rules(classes: &[&str], prefixes: &[&str], libs: &[&str], assets: &[&str]) -> KeepRules {
        let owned = |items: &[&str]| items.iter().map(|item| item.to_string()).collect::<Vec<_>>();
        KeepRules::new(&owned(classes), &owned(prefixes), &owned(libs), &owned(assets)).unwrap()
    }

    #[test]
    fn descriptors_accept_dotted_and_jvm_forms() {
        assert_eq!(to_dex_descriptor(" com.example.App "), "Lcom/example/App;");
        assert_eq!(to_dex_descriptor("Lcom/example/App;"), "Lcom/example/App;");
        assert_eq!(rules(&[], &[".com.vendor."], &[], &[]).prefixes, vec!["Lcom/vendor/"]);
    }

    #[test]
    fn keep_rules_leave_startup_code_in_plaintext() {
        let mut archive = target();
        let selected = select(
            &mut archive,
            &rules(&["com.example.App"], &["com.vendor"], &["mmkv"], &["assets/*.js"]),
        )
        .unwrap();
        assert_eq!(
            selected,
            vec!["classes3.dex", "lib/arm64-v8a/libapp.so", "assets/index.js"]
        );
    }

    #[test]
    fn assets_and_old_payload_are_not_encrypted_by_default() {
        let mut archive = target();
        let selected = select(&mut archive, &rules(&[], &[], &[], &[])).unwrap();
        assert_eq!(
            selected,
            vec![
                "classes.dex",
                "classes2.dex",
                "classes3.dex",
                "lib/arm64-v8a/libapp.so",
                "lib/arm64-v8a/libmmkv.so",
            ]
        );
    }

    #[test]
    fn lib_keep_names_match_every_spelling() {
        let rules = rules(&[], &[], &["app", "libmmkv.so", "crypto.so"], &[]);
        assert!(rules.keeps("lib/x86/libapp.so", b""));
        assert!(rules.keeps("lib/x86/libmmkv.so", b""));
        assert!(rules.keeps("lib/x86/crypto.so", b""));
        assert!(!rules.keeps("lib/x86/libother.so", b""));
    }

    #[test]
    fn blob_metadata_describes_each_ciphertext() {
        let mut archive = target();
        let entries = encrypt_entries(&mut archive, &rules(&[], &[], &["mmkv", "app"], &[]), &KEY).unwrap();
        let blob = build_blob(&entries);
        assert!(blob.ends_with(MAGIC));

        let records = parse_blob(&blob).unwrap();
        let names: Vec<&str> = records.iter().map(|record| record.name.as_str()).collect();
        assert_eq!(names, vec!["classes.dex", "classes2.dex", "classes3.dex"]);

        let cipher = Aes256Gcm::new(&KEY.into());
        let third = &records[2];
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&third.nonce),
                &blob[third.offset..third.offset + third.size],
            )
            .unwrap();
        assert_eq!(plaintext, b"dex Lcom/other/Thing; body");
        assert_ne!(records[0].nonce, records[1].nonce);
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        assert!(parse_blob(b"no footer").is_err());
        assert!(parse_blob(b"SHELL").is_err());
        let mut lying = Vec::new();
        lying.extend_from_slice(&1u32.to_le_bytes());
        lying.extend_from_slice(&999u32.to_le_bytes());
        lying.extend_from_slice(MAGIC);
        assert!(parse_blob(&lying).is_err());
    }

    #[test]
    fn reused_blob_must_match_the_selection() {
        let record = |name: &str| BlobRecord {
            name: name.to_string(),
            offset: 0,
            size: 0,
            nonce: [0; NONCE_LEN],
        };
        let records = vec![record("classes.dex"), record("lib/x86/libapp.so")];
        let same = vec!["lib/x86/libapp.so".to_string(), "classes.dex".to_string()];
        assert!(check_matches(&records, &same).is_ok());
        let error = check_matches(&records, &["classes.dex".to_string()]).unwrap_err();
        assert!(error.to_string().contains("unexpected=[\"lib/x86/libapp.so\"]"));
    }
}
