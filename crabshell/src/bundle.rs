//! Conversion between a flat package and a module bundle.
//!
//! Flat → bundle never unpacks anything: entries are copied compressed from
//! archive to archive with `raw_copy_file`, and the bundle keeps its own
//! protobuf manifest. Bundle → flat is delegated to bundletool.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use log::info;
use zip::{ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::process::run_checked;
use crate::settings::JarTool;
use crate::signing::Keytool;
use crate::toolchain::Toolchain;

pub const BUNDLE_MARKER: &str = "BundleConfig.pb";
const UNIVERSAL_APK: &str = "universal.apk";

/// True when the archive has a `BundleConfig.pb` entry. Anything unreadable
/// is not a bundle.
pub fn is_bundle(path: &Path) -> bool {
    File::open(path)
        .ok()
        .and_then(|file| ZipArchive::new(file).ok())
        .is_some_and(|archive| archive.file_names().any(|name| name == BUNDLE_MARKER))
}

/// Base-module directories replaced wholesale from the hardened flat package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Dex,
    Lib,
    Assets,
}

impl Category {
    /// Bundle name for a flat entry in a replaceable category.
    fn from_flat(name: &str) -> Option<(Category, String)> {
        if !name.contains('/') && name.ends_with(".dex") {
            Some((Category::Dex, format!("base/dex/{name}")))
        } else if name.starts_with("lib/") {
            Some((Category::Lib, format!("base/{name}")))
        } else if name.starts_with("assets/") {
            Some((Category::Assets, format!("base/{name}")))
        } else {
            None
        }
    }

    fn from_bundle(name: &str) -> Option<Category> {
        if name.starts_with("base/dex/") {
            Some(Category::Dex)
        } else if name.starts_with("base/lib/") {
            Some(Category::Lib)
        } else if name.starts_with("base/assets/") {
            Some(Category::Assets)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReformatSummary {
    /// Original bundle entries carried over unchanged.
    pub kept: usize,
    /// Original bundle entries dropped because their category was replaced.
    pub dropped: usize,
    /// Entries streamed in from the hardened flat package.
    pub inserted: usize,
}

pub fn flat_to_bundle(hardened: &Path, original_bundle: &Path, output: &Path) -> Result<ReformatSummary> {
    info!("Converting hardened APK back to AAB...");
    let summary = flat_to_bundle_streams(
        File::open(hardened)?,
        File::open(original_bundle)?,
        File::create(output)?,
    )?;
    info!(
        "AAB written to {} (kept {}, replaced {} with {})",
        output.display(),
        summary.kept,
        summary.dropped,
        summary.inserted
    );
    Ok(summary)
}

/// Streams `original_bundle` into `output`, swapping every category the
/// hardened flat package carries. Replacements are written where the
/// original category first appeared, or at the end when it had none.
pub fn flat_to_bundle_streams<H, B, W>(hardened: H, original_bundle: B, output: W) -> Result<ReformatSummary>
where
    H: Read + Seek,
    B: Read + Seek,
    W: Write + Seek,
{
    let mut hardened = ZipArchive::new(hardened)?;
    let mut original = ZipArchive::new(original_bundle)?;
    let mut writer = ZipWriter::new(output);
    let mut summary = ReformatSummary::default();

    let mut replacements: Vec<(Category, usize, String)> = Vec::new();
    for index in 0..hardened.len() {
        let entry = hardened.by_index_raw(index)?;
        if entry.is_dir() {
            continue;
        }
        if let Some((category, name)) = Category::from_flat(entry.name()) {
            replacements.push((category, index, name));
        }
    }
    let replaced: BTreeSet<Category> = replacements.iter().map(|(category, _, _)| *category).collect();
    let mut emitted: BTreeSet<Category> = BTreeSet::new();

    for index in 0..original.len() {
        let entry = original.by_index_raw(index)?;
        match Category::from_bundle(entry.name()).filter(|category| replaced.contains(category)) {
            Some(category) => {
                drop(entry);
                summary.dropped += 1;
                if emitted.insert(category) {
                    summary.inserted += copy_category(&mut hardened, &mut writer, &replacements, category)?;
                }
            }
            None => {
                writer.raw_copy_file(entry)?;
                summary.kept += 1;
            }
        }
    }

    for category in replaced.difference(&emitted) {
        summary.inserted += copy_category(&mut hardened, &mut writer, &replacements, *category)?;
    }

    writer.finish()?;
    Ok(summary)
}

fn copy_category<H: Read + Seek, W: Write + Seek>(
    hardened: &mut ZipArchive<H>,
    writer: &mut ZipWriter<W>,
    replacements: &[(Category, usize, String)],
    category: Category,
) -> Result<usize> {
    let mut copied = 0;
    for (_, index, name) in replacements.iter().filter(|(c, _, _)| *c == category) {
        writer.raw_copy_file_rename(hardened.by_index_raw(*index)?, name)?;
        copied += 1;
    }
    Ok(copied)
}

/// Bundle builder collaborator.
pub trait BundleBuilder {
    /// Writes an `.apks` set holding `universal.apk` for `bundle`.
    fn build_universal_apks(&self, bundle: &Path, apks_out: &Path) -> Result<()>;
}

/// bundletool, signing with the local debug identity.
pub struct Bundletool<'a> {
    toolchain: &'a Toolchain,
}

impl<'a> Bundletool<'a> {
    pub fn new(toolchain: &'a Toolchain) -> Self {
        Bundletool { toolchain }
    }
}

impl BundleBuilder for Bundletool<'_> {
    fn build_universal_apks(&self, bundle: &Path, apks_out: &Path) -> Result<()> {
        let identity = Keytool::new(self.toolchain).debug_identity()?;
        let mut command = self.toolchain.jar_command(JarTool::Bundletool)?;
        command
            .arg("build-apks")
            .arg("--bundle")
            .arg(bundle)
            .arg("--output")
            .arg(apks_out)
            .args(["--mode", "universal", "--ks"])
            .arg(&identity.keystore)
            .args(["--ks-pass", identity.pass_arg().as_str()])
            .args(["--ks-key-alias", identity.alias.as_deref().unwrap_or_default()])
            .args(["--key-pass", identity.pass_arg().as_str()]);
        run_checked(&mut command, "bundletool build-apks").map(drop)
    }
}

/// Builds a universal flat package from `bundle` at `output`.
pub fn bundle_to_flat(
    builder: &dyn BundleBuilder,
    bundle: &Path,
    output: &Path,
    work_dir: &Path,
) -> Result<PathBuf> {
    info!("Converting AAB to universal APK...");
    let apks = work_dir.join("temp.apks");
    builder.build_universal_apks(bundle, &apks)?;

    let mut archive = ZipArchive::new(File::open(&apks)?)?;
    if !archive.file_names().any(|name| name == UNIVERSAL_APK) {
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort_unstable();
        names.truncate(20);
        return Err(Error::InvalidArtifact {
            reason: format!("bundletool output does not contain {UNIVERSAL_APK}. entries={names:?}"),
            path: apks,
        });
    }
    let mut universal = archive.by_name(UNIVERSAL_APK)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    io::copy(&mut universal, &mut File::create(output)?)?;
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Cursor;
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, FileOptions::default().compression_method(CompressionMethod::Deflated))
                .unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn names(bytes: &[u8]) -> Vec<String> {
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    fn read(bytes: &[u8], name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        out
    }

    fn original_bundle() -> Vec<u8> {
        archive(&[
            (BUNDLE_MARKER, "config"),
            ("base/manifest/AndroidManifest.xml", "proto manifest"),
            ("base/dex/classes.dex", "old dex"),
            ("base/lib/arm64-v8a/libold.so", "old lib"),
            ("base/assets/config.json", "{}"),
            ("base/resources.pb", "resources"),
        ])
    }

    #[test]
    fn replaces_present_categories_and_keeps_manifest() {
        let hardened = archive(&[
            ("AndroidManifest.xml", "binary manifest"),
            ("classes.dex", "shell dex"),
            ("classes2.dex", "kept dex"),
            ("lib/arm64-v8a/libmmkv.so", "mmkv"),
            ("lib/arm64-v8a/libshell.so", "shell"),
            ("assets/kapp_payload.bin", "payload"),
            ("resources.arsc", "arsc"),
        ]);
        let mut out = Cursor::new(Vec::new());

        let summary =
            flat_to_bundle_streams(Cursor::new(&hardened), Cursor::new(original_bundle()), &mut out).unwrap();
        let bundle = out.into_inner();
        let entries = names(&bundle);

        assert!(entries.contains(&"base/lib/arm64-v8a/libmmkv.so".to_string()));
        assert!(!entries.contains(&"base/lib/arm64-v8a/libold.so".to_string()));
        assert!(!entries.contains(&"base/assets/config.json".to_string()));
        assert!(entries.contains(&"base/assets/kapp_payload.bin".to_string()));
        assert!(!entries.iter().any(|name| name == "resources.arsc" || name == "AndroidManifest.xml"));
        assert_eq!(read(&bundle, "base/dex/classes.dex"), b"shell dex");
        assert_eq!(read(&bundle, "base/dex/classes2.dex"), b"kept dex");
        assert_eq!(read(&bundle, "base/manifest/AndroidManifest.xml"), b"proto manifest");
        assert_eq!(read(&bundle, "base/lib/arm64-v8a/libmmkv.so"), b"mmkv");
        assert_eq!(
            summary,
            ReformatSummary {
                kept: 3,
                dropped: 3,
                inserted: 5
            }
        );
    }

    #[test]
    fn absent_categories_keep_original_entries() {
        let hardened = archive(&[("classes.dex", "shell dex")]);
        let mut out = Cursor::new(Vec::new());

        flat_to_bundle_streams(Cursor::new(&hardened), Cursor::new(original_bundle()), &mut out).unwrap();
        let bundle = out.into_inner();

        assert_eq!(read(&bundle, "base/lib/arm64-v8a/libold.so"), b"old lib");
        assert_eq!(read(&bundle, "base/assets/config.json"), b"{}");
        assert_eq!(read(&bundle, "base/dex/classes.dex"), b"shell dex");
    }

    #[test]
    fn categories_missing_from_the_bundle_are_appended() {
        let bundle = archive(&[(BUNDLE_MARKER, "config"), ("base/dex/classes.dex", "old")]);
        let hardened = archive(&[("classes.dex", "new"), ("lib/x86_64/libshell.so", "shell")]);
        let mut out = Cursor::new(Vec::new());

        flat_to_bundle_streams(Cursor::new(&hardened), Cursor::new(bundle), &mut out).unwrap();
        let entries = names(&out.into_inner());
        assert_eq!(
            entries,
            vec![BUNDLE_MARKER, "base/dex/classes.dex", "base/lib/x86_64/libshell.so"]
        );
    }

    #[test]
    fn raw_copy_preserves_compression() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("assets/kapp_payload.bin", FileOptions::default().compression_method(CompressionMethod::Stored))
            .unwrap();
        writer.write_all(&[7u8; 256]).unwrap();
        let hardened = writer.finish().unwrap().into_inner();
        let mut out = Cursor::new(Vec::new());

        flat_to_bundle_streams(Cursor::new(&hardened), Cursor::new(original_bundle()), &mut out).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(out.into_inner())).unwrap();
        let payload = archive.by_name("base/assets/kapp_payload.bin").unwrap();
        assert_eq!(payload.compression(), CompressionMethod::Stored);
    }

    #[test]
    fn sniffs_bundles_by_marker_entry() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app.apk");
        fs::write(&bundle, original_bundle()).unwrap();
        let flat = dir.path().join("app.aab");
        fs::write(&flat, archive(&[("classes.dex", "dex")])).unwrap();
        let junk = dir.path().join("junk.aab");
        fs::write(&junk, b"not a zip").unwrap();

        assert!(is_bundle(&bundle));
        assert!(!is_bundle(&flat));
        assert!(!is_bundle(&junk));
        assert!(!is_bundle(&dir.path().join("missing.aab")));
    }

    struct FakeBundletool {
        entries: Vec<(&'static str, &'static str)>,
        calls: Cell<usize>,
    }

    impl BundleBuilder for FakeBundletool {
        fn build_universal_apks(&self, _bundle: &Path, apks_out: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            fs::write(apks_out, archive(&self.entries))?;
            Ok(())
        }
    }

    #[test]
    fn extracts_universal_apk() {
        let dir = tempfile::tempdir().unwrap();
        let builder = FakeBundletool {
            entries: vec![("toc.pb", "toc"), (UNIVERSAL_APK, "apk bytes")],
            calls: Cell::new(0),
        };
        let output = dir.path().join("out/universal_from_aab.apk");

        let path = bundle_to_flat(&builder, Path::new("app.aab"), &output, dir.path()).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"apk bytes");
        assert_eq!(builder.calls.get(), 1);
    }

    #[test]
    fn missing_universal_apk_lists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let builder = FakeBundletool {
            entries: vec![("toc.pb", "toc"), ("splits/base-master.apk", "apk")],
            calls: Cell::new(0),
        };

        let error = bundle_to_flat(&builder, Path::new("app.aab"), &dir.path().join("u.apk"), dir.path())
            .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("universal.apk"));
        assert!(message.contains("splits/base-master.apk"));
    }
}
