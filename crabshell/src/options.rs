//! Resolution of user-facing pack options: output path and format, the
//! optional `kapp-config.json` file and the keep lists.

use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use clap::ValueEnum;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "kapp-config.json";
pub const DEFAULT_OUTPUT: &str = "protected.apk";
/// Always shipped in plaintext; MMKV is loaded before the loader can run.
pub const ALWAYS_KEPT_LIB: &str = "mmkv";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Same container as the input.
    #[default]
    Auto,
    Apk,
    Aab,
}

/// Container of the final artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Apk,
    Aab,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::Apk => "apk",
            Container::Aab => "aab",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Container::Apk => "APK",
            Container::Aab => "AAB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub path: PathBuf,
    pub container: Container,
}

/// A directory (existing, or spelled with a trailing separator) becomes
/// `<dir>/<target-stem>-protected.apk`.
pub fn normalize_output_path(target: &Path, output: &Path) -> PathBuf {
    let spelled_as_dir = output
        .to_str()
        .is_some_and(|raw| raw.ends_with(MAIN_SEPARATOR) || raw.ends_with('/'));
    if !(output.is_dir() || spelled_as_dir) {
        return output.to_path_buf();
    }
    let stem = target
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    output.join(format!("{stem}-protected.apk"))
}

/// Picks the output container and rewrites the extension to match. A bundle
/// can only be produced from a bundle input, since the reformatter needs the
/// original bundle as its template.
pub fn resolve_output(output: &Path, format: OutputFormat, input_is_bundle: bool) -> Result<ResolvedOutput> {
    let container = match format {
        OutputFormat::Auto if input_is_bundle => Container::Aab,
        OutputFormat::Auto | OutputFormat::Apk => Container::Apk,
        OutputFormat::Aab if input_is_bundle => Container::Aab,
        OutputFormat::Aab => {
            return Err(Error::Config(
                "--output-format aab requires an AAB input (the original bundle is the template)"
                    .to_string(),
            ))
        }
    };
    let path = if output.extension().is_some_and(|ext| ext == container.extension()) {
        output.to_path_buf()
    } else {
        output.with_extension(container.extension())
    };
    Ok(ResolvedOutput { path, container })
}

/// A list option that may be written as a single string.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListValue {
    One(String),
    Many(Vec<String>),
}

impl ListValue {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ListValue::One(item) => vec![item],
            ListValue::Many(items) => items,
        }
        .into_iter()
        .filter(|item| !item.is_empty())
        .collect()
    }
}

/// Defaults read from `kapp-config.json`. Command-line values win.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub target: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub output_format: Option<OutputFormat>,
    pub keystore: Option<PathBuf>,
    pub ks_pass: Option<String>,
    pub key_alias: Option<String>,
    pub no_sign: bool,
    pub skip_build: bool,
    pub require_signature_hash: bool,
    pub keep_class: Option<ListValue>,
    pub keep_prefix: Option<ListValue>,
    pub keep_lib: Option<ListValue>,
    pub encrypt_asset: Option<ListValue>,
}

impl FileConfig {
    /// A missing file is an empty config; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(FileConfig::default());
        }
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|error| Error::Config(format!("{}: {error}", path.display())))
    }
}

/// Classes, packages, libraries and asset globs handed to the packer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepLists {
    pub classes: Vec<String>,
    pub prefixes: Vec<String>,
    pub libs: Vec<String>,
    pub encrypt_assets: Vec<String>,
}

impl KeepLists {
    /// Each non-empty command-line list replaces the file's list. `mmkv` is
    /// always kept.
    pub fn merge(cli: KeepLists, file: &FileConfig) -> KeepLists {
        let pick = |cli: Vec<String>, file: &Option<ListValue>| {
            let cli: Vec<String> = cli.into_iter().filter(|item| !item.is_empty()).collect();
            if cli.is_empty() {
                file.clone().map(ListValue::into_vec).unwrap_or_default()
            } else {
                cli
            }
        };
        let mut libs = pick(cli.libs, &file.keep_lib);
        if !libs.iter().any(|lib| lib == ALWAYS_KEPT_LIB) {
            libs.push(ALWAYS_KEPT_LIB.to_string());
        }
        KeepLists {
            classes: pick(cli.classes, &file.keep_class),
            prefixes: pick(cli.prefixes, &file.keep_prefix),
            libs,
            encrypt_assets: pick(cli.encrypt_assets, &file.encrypt_asset),
        }
    }
}
