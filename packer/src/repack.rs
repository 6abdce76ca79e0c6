//! Rebuilds the target APK around the loader: bootstrap dex first, the
//! loader's native library per ABI, and the payload as a stored asset.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::path::Path;

use anyhow::{bail, Context};
use log::info;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::payload::PAYLOAD_ENTRY;

pub const SHELL_LIB: &str = "libshell.so";

/// Replacement bytes for the target's manifest and resource table.
#[derive(Debug, Default)]
pub struct Overrides {
    pub manifest: Option<Vec<u8>>,
    pub resources: Option<Vec<u8>>,
}

/// Everything the loader contributes to the output.
#[derive(Debug)]
pub struct Bootstrap {
    /// Dex files of the bootstrap APK in `classes.dex`, `classes2.dex`, ... order.
    pub dex: Vec<Vec<u8>>,
    /// `(abi, libshell.so bytes)`, sorted by ABI.
    pub libs: Vec<(String, Vec<u8>)>,
}

impl Bootstrap {
    pub fn load(bootstrap_apk: &Path, lib_dir: &Path) -> anyhow::Result<Self> {
        let mut apk = ZipArchive::new(
            File::open(bootstrap_apk)
                .with_context(|| format!("opening bootstrap APK {}", bootstrap_apk.display()))?,
        )?;
        Ok(Bootstrap {
            dex: bootstrap_dex(&mut apk)?,
            libs: shell_libs(lib_dir)?,
        })
    }
}

/// `classes.dex` is 1, `classesN.dex` is N.
pub fn class_index(name: &str) -> Option<usize> {
    let middle = name.strip_prefix("classes")?.strip_suffix(".dex")?;
    if middle.is_empty() {
        return Some(1);
    }
    middle.parse().ok()
}

pub fn dex_name(index: usize) -> String {
    if index == 1 {
        "classes.dex".to_string()
    } else {
        format!("classes{index}.dex")
    }
}

fn bootstrap_dex<R: Read + Seek>(apk: &mut ZipArchive<R>) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut dex: Vec<(usize, Vec<u8>)> = Vec::new();
    for index in 0..apk.len() {
        let mut entry = apk.by_index(index)?;
        let Some(class) = class_index(entry.name()) else {
            continue;
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        dex.push((class, bytes));
    }
    if dex.is_empty() {
        bail!("No classes*.dex found in bootstrap APK");
    }
    dex.sort_by_key(|(class, _)| *class);
    Ok(dex.into_iter().map(|(_, bytes)| bytes).collect())
}

fn shell_libs(lib_dir: &Path) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut libs = Vec::new();
    let abis = fs::read_dir(lib_dir)
        .with_context(|| format!("reading bootstrap lib dir {}", lib_dir.display()))?;
    for abi in abis {
        let abi = abi?;
        let lib = abi.path().join(SHELL_LIB);
        if !abi.path().is_dir() || !lib.is_file() {
            continue;
        }
        libs.push((abi.file_name().to_string_lossy().into_owned(), fs::read(&lib)?));
    }
    if libs.is_empty() {
        bail!("No {SHELL_LIB} found under bootstrap_lib_dir: {}", lib_dir.display());
    }
    libs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(libs)
}

/// Copies `target` into `output` minus the encrypted entries and any stale
/// payload, then appends the bootstrap and `payload`.
pub fn repack<R, W>(
    target: &mut ZipArchive<R>,
    encrypted: &HashSet<String>,
    overrides: &Overrides,
    bootstrap: &Bootstrap,
    payload: &[u8],
    output: W,
) -> anyhow::Result<W>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let mut writer = ZipWriter::new(output);
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
    let mut retained_dex: Vec<(usize, Vec<u8>)> = Vec::new();

    for index in 0..target.len() {
        let entry = target.by_index_raw(index)?;
        let name = entry.name().to_string();
        if name == PAYLOAD_ENTRY || encrypted.contains(&name) {
            continue;
        }

        let replacement = match name.as_str() {
            "AndroidManifest.xml" => overrides.manifest.as_ref(),
            "resources.arsc" => overrides.resources.as_ref(),
            _ => None,
        };
        if let Some(bytes) = replacement {
            let options = FileOptions::default().compression_method(entry.compression());
            writer.start_file(name, options)?;
            writer.write_all(bytes)?;
            continue;
        }

        if let Some(class) = class_index(&name) {
            drop(entry);
            let mut entry = target.by_index(index)?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            retained_dex.push((class, bytes));
            continue;
        }

        writer.raw_copy_file(entry)?;
    }
    retained_dex.sort_by_key(|(class, _)| *class);

    let dex = bootstrap
        .dex
        .iter()
        .chain(retained_dex.iter().map(|(_, bytes)| bytes));
    for (position, bytes) in dex.enumerate() {
        writer.start_file(dex_name(position + 1), stored)?;
        writer.write_all(bytes)?;
    }
    info!(
        "Injected {} bootstrap dex, kept {} plaintext dex",
        bootstrap.dex.len(),
        retained_dex.len()
    );

    for (abi, bytes) in &bootstrap.libs {
        writer.start_file(format!("lib/{abi}/{SHELL_LIB}"), stored)?;
        writer.write_all(bytes)?;
    }

    writer.start_file(PAYLOAD_ENTRY, stored)?;
    writer.write_all(payload)?;
    Ok(writer.finish()?)
}
