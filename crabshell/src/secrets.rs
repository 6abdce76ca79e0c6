//! Build-time secrets for the loader and the packer: the payload key split
//! into two XOR shares, and the loader's sensitive strings XOR-ed with a
//! random string key. Both land in generated Rust sources that the loader
//! and packer crates include at compile time.

use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;

const GENERATED_HEADER: &str = "// Auto-generated by crabshell. DO NOT EDIT.";

/// Strings the loader must not carry in clear.
pub const SENSITIVE_STRINGS: [(&str, &str); 15] = [
    ("PROC_STATUS", "/proc/self/status"),
    ("TRACER_PID", "TracerPid:"),
    ("PAYLOAD_NAME", "assets/kapp_payload.bin"),
    ("LOG_TAG", "KAppShell"),
    ("ERR_NO_PAYLOAD", "No shell payload found"),
    ("ERR_INVALID_CHECKSUM", "Invalid checksum"),
    ("MSG_NATIVE_LOAD_DEX", "nativeLoadDex (Application) called for SDK {}"),
    ("MSG_OPEN_APK", "Opening APK at {}"),
    ("MAGIC_SHELL", "SHELL"),
    ("DEBUG_DETECTED", "Debugger detected"),
    ("EXITING", "Exiting..."),
    ("PTRACE_FAILED", "ptrace failed with errno {}"),
    ("PTRACE_RESTRICTED", "Ptrace TRACEME restricted by system (errno 13)."),
    ("PTRACE_SUCCESS", "Ptrace TRACEME successful (no debugger attached)."),
    ("TRACER_PID_LOG", "TracerPid: {}"),
];

/// The AES-256 payload key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        KeyMaterial(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        KeyMaterial(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Splits the key under a fresh random mask.
    pub fn split(&self) -> SplitKey {
        let mut mask = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut mask);
        SplitKey {
            mask,
            masked: xor32(&self.0, &mask),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// `KEY_PART_1` and `KEY_PART_2`; neither alone reveals the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitKey {
    pub mask: [u8; KEY_LEN],
    pub masked: [u8; KEY_LEN],
}

impl SplitKey {
    pub fn join(&self) -> KeyMaterial {
        KeyMaterial(xor32(&self.mask, &self.masked))
    }
}

fn xor32(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    std::array::from_fn(|i| a[i] ^ b[i])
}

/// XOR with a repeating key. Applying it twice with the same key restores
/// the input.
pub fn xor_with_key(data: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i % KEY_LEN])
        .collect()
}

/// Inverse of the obfuscation, as the loader performs it.
pub fn deobfuscate(data: &[u8], key: &[u8; KEY_LEN]) -> String {
    String::from_utf8(xor_with_key(data, key)).unwrap_or_else(|_| String::from("ERROR_DECRYPT"))
}

#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub config_path: PathBuf,
    pub strings_path: PathBuf,
}

/// Writes `config.rs` at `config_path` and `strings_config.rs` next to it.
/// Absent hashes are written as 32 zero bytes.
pub fn generate(
    config_path: &Path,
    key: &KeyMaterial,
    payload_hash: Option<&[u8; 32]>,
    signature_hash: Option<&[u8; 32]>,
) -> Result<GeneratedConfig> {
    let mut string_key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut string_key);

    let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let strings_path = dir.join("strings_config.rs");

    fs::write(
        config_path,
        render_config(&key.split(), &string_key, payload_hash, signature_hash),
    )?;
    fs::write(&strings_path, render_strings(&string_key))?;

    info!("Generated config -> {}", config_path.display());
    info!("Generated strings -> {}", strings_path.display());
    Ok(GeneratedConfig {
        config_path: config_path.to_path_buf(),
        strings_path,
    })
}

pub fn render_config(
    split: &SplitKey,
    string_key: &[u8; KEY_LEN],
    payload_hash: Option<&[u8; 32]>,
    signature_hash: Option<&[u8; 32]>,
) -> String {
    let zero = [0u8; 32];
    format!(
        r#"{GENERATED_HEADER}

// KEY_PART_1 (Mask)
const KEY_PART_1: [u8; 32] = [{mask}];

// KEY_PART_2 (Masked Key)
const KEY_PART_2: [u8; 32] = [{masked}];

pub const STRING_XOR_KEY: [u8; 32] = [{string_key}];

#[inline(always)]
pub fn get_aes_key() -> [u8; 32] {{
    let mut key = [0u8; 32];
    for i in 0..32 {{
        key[i] = KEY_PART_1[i] ^ KEY_PART_2[i];
    }}
    key
}}

pub const PAYLOAD_HASH: [u8; 32] = [{payload}];
pub const EXPECTED_SIGNATURE_HASH: [u8; 32] = [{signature}];
"#,
        mask = byte_list(&split.mask),
        masked = byte_list(&split.masked),
        string_key = byte_list(string_key),
        payload = byte_list(payload_hash.unwrap_or(&zero)),
        signature = byte_list(signature_hash.unwrap_or(&zero)),
    )
}

pub fn render_strings(string_key: &[u8; KEY_LEN]) -> String {
    let mut out = format!("{GENERATED_HEADER}\n#![allow(dead_code)]\n\n");
    for (name, value) in SENSITIVE_STRINGS {
        let _ = writeln!(
            out,
            "pub const {name}: &[u8] = &[{}];",
            byte_list(&xor_with_key(value.as_bytes(), string_key))
        );
    }
    out
}

fn byte_list(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("0x{byte:02x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads the key back from a previously generated `config.rs`.
pub fn recover(config_path: &Path) -> Result<KeyMaterial> {
    let source = fs::read_to_string(config_path).map_err(|error| {
        Error::KeyMaterial(format!(
            "config file not found: {} ({error})",
            config_path.display()
        ))
    })?;
    let split = SplitKey {
        mask: parse_u8_array(&source, "KEY_PART_1")?,
        masked: parse_u8_array(&source, "KEY_PART_2")?,
    };
    Ok(split.join())
}

/// Fresh key for a full build, or the key of the existing packer config when
/// the build is skipped (the prebuilt loader was compiled against it).
pub fn select_key(reuse_existing: bool, packer_config: &Path) -> Result<KeyMaterial> {
    if !reuse_existing {
        return Ok(KeyMaterial::generate());
    }
    let key = recover(packer_config)?;
    info!(
        "--skip-build enabled, reusing existing key from {}",
        packer_config.display()
    );
    Ok(key)
}

/// Parses `const NAME: [u8; 32] = [..];` out of Rust source.
pub fn parse_u8_array(source: &str, const_name: &str) -> Result<[u8; 32]> {
    let pattern = format!(
        r"(?s)const\s+{}\s*:\s*\[u8;\s*32\]\s*=\s*\[(.*?)\];",
        regex::escape(const_name)
    );
    let regex = Regex::new(&pattern).map_err(|error| Error::KeyMaterial(error.to_string()))?;
    let body = regex
        .captures(source)
        .and_then(|captures| captures.get(1))
        .ok_or_else(|| Error::KeyMaterial(format!("missing {const_name} in generated config")))?
        .as_str();

    let values = body
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| parse_int_literal(token).map_err(|reason| {
            Error::KeyMaterial(format!("{const_name}: {reason}"))
        }))
        .collect::<Result<Vec<i64>>>()?;

    if values.len() != KEY_LEN {
        return Err(Error::KeyMaterial(format!(
            "{const_name} must have 32 bytes, got {}",
            values.len()
        )));
    }
    let mut out = [0u8; KEY_LEN];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = u8::try_from(value).map_err(|_| {
            Error::KeyMaterial(format!("{const_name} contains out-of-range byte value {value}"))
        })?;
    }
    Ok(out)
}

/// Integer literal in hex, octal, binary or decimal, optionally negative and
/// with `_` separators or a `u8` suffix.
fn parse_int_literal(token: &str) -> std::result::Result<i64, String> {
    let cleaned: String = token.trim_end_matches("u8").chars().filter(|c| *c != '_').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };
    let lower = digits.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2)
    } else {
        lower.parse::<i64>()
    };
    parsed
        .map(|value| if negative { -value } else { value })
        .map_err(|_| format!("invalid integer literal '{token}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> KeyMaterial {
        KeyMaterial::from_bytes(std::array::from_fn(|i| i as u8 * 7))
    }

    #[test]
    fn split_shares_xor_back_to_key() {
        let key = key();
        let split = key.split();
        assert_eq!(split.join(), key);
        assert_ne!(&split.masked, key.as_bytes());
        assert_ne!(key.split().mask, split.mask);
    }

    #[test]
    fn obfuscation_round_trips_only_with_the_right_key() {
        let string_key = [0x5au8; 32];
        let plain = "Ptrace TRACEME restricted by system (errno 13).";
        let hidden = xor_with_key(plain.as_bytes(), &string_key);
        assert_ne!(hidden, plain.as_bytes());
        assert_eq!(deobfuscate(&hidden, &string_key), plain);
        assert_ne!(deobfuscate(&hidden, &[0x11u8; 32]), plain);
    }

    #[test]
    fn generated_config_recovers_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src/config.rs");
        let key = key();
        let payload = [0xabu8; 32];

        let generated = generate(&path, &key, Some(&payload), None).unwrap();

        assert_eq!(recover(&generated.config_path).unwrap(), key);
        let config = fs::read_to_string(&path).unwrap();
        assert_eq!(parse_u8_array(&config, "PAYLOAD_HASH").unwrap(), payload);
        assert_eq!(
            parse_u8_array(&config, "EXPECTED_SIGNATURE_HASH").unwrap(),
            [0u8; 32]
        );
        assert!(config.contains("pub fn get_aes_key() -> [u8; 32]"));

        let strings = fs::read_to_string(&generated.strings_path).unwrap();
        assert_eq!(strings.matches("pub const ").count(), SENSITIVE_STRINGS.len());
        assert!(!strings.contains("TracerPid"));
    }

    #[test]
    fn strings_decode_with_the_generated_key() {
        let string_key = [0x33u8; 32];
        let rendered = render_strings(&string_key);
        let line = rendered
            .lines()
            .find(|line| line.starts_with("pub const PAYLOAD_NAME"))
            .unwrap();
        let bytes: Vec<u8> = line
            .rsplit('[')
            .next()
            .unwrap()
            .trim_end_matches("];")
            .split(", ")
            .map(|token| u8::from_str_radix(token.trim_start_matches("0x"), 16).unwrap())
            .collect();
        assert_eq!(deobfuscate(&bytes, &string_key), "assets/kapp_payload.bin");
    }

    #[test]
    fn regenerating_uses_fresh_randomness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.rs");
        generate(&path, &key(), None, None).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        generate(&path, &key(), None, None).unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert_ne!(first, second);
        assert_eq!(recover(&path).unwrap(), key());
    }

    #[test]
    fn accepts_every_literal_base() {
        let mut items: Vec<String> = (0..28).map(|i| i.to_string()).collect();
        items.extend(["0xff", "0o17", "0b101", "1_0"].map(str::to_string));
        let source = format!("const KEY_PART_1: [u8; 32] = [{}];", items.join(",\n  "));
        let parsed = parse_u8_array(&source, "KEY_PART_1").unwrap();
        assert_eq!(parsed[27], 27);
        assert_eq!(&parsed[28..], &[255, 15, 5, 10]);
    }

    #[test]
    fn rejects_malformed_arrays() {
        let short = "const KEY_PART_1: [u8; 32] = [1, 2, 3];";
        assert!(parse_u8_array(short, "KEY_PART_1").is_err());

        let mut values = vec!["0"; 31];
        values.push("256");
        let range = format!("const KEY_PART_1: [u8; 32] = [{}];", values.join(", "));
        let error = parse_u8_array(&range, "KEY_PART_1").unwrap_err();
        assert!(error.to_string().contains("out-of-range"));

        let negative = range.replace("256", "-1");
        assert!(parse_u8_array(&negative, "KEY_PART_1").is_err());

        let garbage = range.replace("256", "zz");
        assert!(parse_u8_array(&garbage, "KEY_PART_1").is_err());

        assert!(parse_u8_array("", "KEY_PART_2").is_err());
    }

    #[test]
    fn missing_config_fails_recover() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            recover(&dir.path().join("config.rs")),
            Err(Error::KeyMaterial(_))
        ));
        assert!(select_key(true, &dir.path().join("config.rs")).is_err());
        assert!(select_key(false, &dir.path().join("config.rs")).is_ok());
    }
}
