//! Layout checks on a hardened APK: required entries present, forbidden
//! native libraries gone, plaintext dex count within bounds.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use zip::ZipArchive;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct LayoutRules {
    pub required_entries: Vec<String>,
    pub forbidden_libs: Vec<String>,
    pub min_plaintext_dex: Option<usize>,
    pub max_plaintext_dex: Option<usize>,
}

impl LayoutRules {
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_plaintext_dex, self.max_plaintext_dex) {
            if min > max {
                return Err(Error::Config(format!(
                    "--min-plaintext-dex ({min}) cannot be greater than --max-plaintext-dex ({max})"
                )));
            }
        }
        Ok(())
    }
}

/// `mmkv`, `libmmkv` and `mmkv.so` all mean `libmmkv.so`.
pub fn normalize_lib_name(value: &str) -> Result<String> {
    let token = value.trim();
    if token.is_empty() {
        return Err(Error::Config(
            "Forbidden library name cannot be empty".to_string(),
        ));
    }
    let token = if token.starts_with("lib") {
        token.to_string()
    } else {
        format!("lib{token}")
    };
    Ok(if token.ends_with(".so") {
        token
    } else {
        format!("{token}.so")
    })
}

/// Returns one message per violated rule; empty means the layout passed.
pub fn check(apk: &Path, rules: &LayoutRules) -> Result<Vec<String>> {
    rules.validate()?;
    check_archive(ZipArchive::new(File::open(apk)?)?, rules)
}

pub fn check_archive<R: Read + Seek>(archive: ZipArchive<R>, rules: &LayoutRules) -> Result<Vec<String>> {
    let names: BTreeSet<&str> = archive.file_names().collect();
    let root_dex: Vec<&str> = names
        .iter()
        .copied()
        .filter(|name| !name.contains('/') && name.starts_with("classes") && name.ends_with(".dex"))
        .collect();
    let libs: BTreeSet<&str> = names
        .iter()
        .filter(|name| name.starts_with("lib/") && name.ends_with(".so"))
        .filter_map(|name| name.rsplit('/').next())
        .collect();

    let mut violations = Vec::new();
    for entry in &rules.required_entries {
        if !names.contains(entry.as_str()) {
            violations.push(format!("Missing required entry: {entry}"));
        }
    }
    for forbidden in &rules.forbidden_libs {
        let lib = normalize_lib_name(forbidden)?;
        if libs.contains(lib.as_str()) {
            violations.push(format!("Forbidden native library remains in APK: {lib}"));
        }
    }

    let count = root_dex.len();
    if let Some(min) = rules.min_plaintext_dex.filter(|min| count < *min) {
        violations.push(format!(
            "Plaintext classes*.dex count too small: {count} < {min} (found: {root_dex:?})"
        ));
    }
    if let Some(max) = rules.max_plaintext_dex.filter(|max| count > *max) {
        violations.push(format!(
            "Plaintext classes*.dex count too large: {count} > {max} (found: {root_dex:?})"
        ));
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    fn hardened(names: &[&str]) -> ZipArchive<Cursor<Vec<u8>>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for name in names {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(b"x").unwrap();
        }
        ZipArchive::new(writer.finish().unwrap()).unwrap()
    }

    const LAYOUT: &[&str] = &[
        "AndroidManifest.xml",
        "classes.dex",
        "classes2.dex",
        "lib/arm64-v8a/libshell.so",
        "lib/arm64-v8a/libmmkv.so",
        "assets/kapp_payload.bin",
        "assets/dex/classes9.dex",
    ];

    #[test]
    fn passing_layout_has_no_violations() {
        let rules = LayoutRules {
            required_entries: vec!["assets/kapp_payload.bin".to_string()],
            forbidden_libs: vec!["libapp".to_string()],
            min_plaintext_dex: Some(1),
            max_plaintext_dex: Some(2),
        };
        assert!(check_archive(hardened(LAYOUT), &rules).unwrap().is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let rules = LayoutRules {
            required_entries: vec!["lib/armeabi-v7a/libshell.so".to_string()],
            forbidden_libs: vec!["mmkv".to_string()],
            min_plaintext_dex: Some(3),
            max_plaintext_dex: None,
        };
        let violations = check_archive(hardened(LAYOUT), &rules).unwrap();
        assert_eq!(violations.len(), 3);
        assert_eq!(violations[0], "Missing required entry: lib/armeabi-v7a/libshell.so");
        assert_eq!(
            violations[1],
            "Forbidden native library remains in APK: libmmkv.so"
        );
        assert!(violations[2].starts_with("Plaintext classes*.dex count too small: 2 < 3"));
    }

    #[test]
    fn nested_dex_does_not_count_as_plaintext() {
        let rules = LayoutRules {
            max_plaintext_dex: Some(1),
            ..LayoutRules::default()
        };
        let violations = check_archive(hardened(LAYOUT), &rules).unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("too large: 2 > 1"));
    }

    #[test]
    fn lib_names_normalize() {
        assert_eq!(normalize_lib_name("mmkv").unwrap(), "libmmkv.so");
        assert_eq!(normalize_lib_name("libmmkv").unwrap(), "libmmkv.so");
        assert_eq!(normalize_lib_name("mmkv.so").unwrap(), "libmmkv.so");
        assert_eq!(normalize_lib_name(" libc++_shared.so ").unwrap(), "libc++_shared.so");
        assert!(normalize_lib_name("  ").is_err());
    }

    #[test]
    fn inverted_dex_bounds_are_rejected() {
        let rules = LayoutRules {
            min_plaintext_dex: Some(3),
            max_plaintext_dex: Some(1),
            ..LayoutRules::default()
        };
        assert!(matches!(rules.validate(), Err(Error::Config(_))));
    }
}
