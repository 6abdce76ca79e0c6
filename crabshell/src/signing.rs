use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::process::run_checked;
use crate::settings::JarTool;
use crate::toolchain::Toolchain;

pub const DEBUG_ALIAS: &str = "androiddebugkey";
pub const DEBUG_PASSWORD: &str = "android";
const DEBUG_DNAME: &str = "CN=Android Debug,O=Android,C=US";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub keystore: PathBuf,
    /// Store and key password, without the `pass:` prefix.
    pub password: String,
    pub alias: Option<String>,
}

impl SigningIdentity {
    pub fn new(keystore: impl Into<PathBuf>, password: &str, alias: Option<String>) -> Self {
        SigningIdentity {
            keystore: keystore.into(),
            password: password.strip_prefix("pass:").unwrap_or(password).to_string(),
            alias: alias.filter(|alias| !alias.is_empty()),
        }
    }

    pub fn debug(keystore: impl Into<PathBuf>) -> Self {
        SigningIdentity::new(keystore, DEBUG_PASSWORD, Some(DEBUG_ALIAS.to_string()))
    }

    pub fn pass_arg(&self) -> String {
        format!("pass:{}", self.password)
    }
}

/// Code signer collaborator.
pub trait Signer {
    fn sign(&self, apk: &Path, identity: &SigningIdentity) -> Result<()>;
}

/// Source of the signing certificate's SHA-256 fingerprint. `Ok(None)` means
/// it could not be determined.
pub trait FingerprintSource {
    fn certificate_sha256(&self, identity: &SigningIdentity) -> Result<Option<[u8; 32]>>;
}

/// `apksigner` from the build-tools, falling back to uber-apk-signer.
pub struct ApkSigner<'a> {
    toolchain: &'a Toolchain,
}

impl<'a> ApkSigner<'a> {
    pub fn new(toolchain: &'a Toolchain) -> Self {
        ApkSigner { toolchain }
    }

    fn sign_with_uber(&self, apk: &Path, identity: &SigningIdentity) -> Result<()> {
        let mut command = self.toolchain.jar_command(JarTool::UberApkSigner)?;
        command
            .arg("--apks")
            .arg(apk)
            .arg("--ks")
            .arg(&identity.keystore)
            .args(["--ksPass", identity.password.as_str()])
            .args(["--ksAlias", identity.alias.as_deref().unwrap_or(DEBUG_ALIAS)])
            .args(["--ksKeyPass", identity.password.as_str(), "--overwrite"]);
        run_checked(&mut command, "uber-apk-signer sign").map(drop)
    }
}

impl Signer for ApkSigner<'_> {
    fn sign(&self, apk: &Path, identity: &SigningIdentity) -> Result<()> {
        info!("Signing {}...", apk.display());
        if let Some(apksigner) = self.toolchain.find_build_tool("apksigner") {
            let mut command = Command::new(apksigner);
            command
                .arg("sign")
                .arg("--ks")
                .arg(&identity.keystore)
                .args(["--ks-pass", identity.pass_arg().as_str()])
                .args(["--key-pass", identity.pass_arg().as_str()]);
            if let Some(alias) = &identity.alias {
                command.args(["--ks-key-alias", alias.as_str()]);
            }
            command.arg(apk);
            match run_checked(&mut command, "apksigner sign") {
                Ok(_) => return Ok(()),
                Err(error) => {
                    warn!("apksigner failed, falling back to managed uber-apk-signer. reason={error}")
                }
            }
        }
        self.sign_with_uber(apk, identity)
    }
}

pub struct Keytool<'a> {
    toolchain: &'a Toolchain,
}

impl<'a> Keytool<'a> {
    pub fn new(toolchain: &'a Toolchain) -> Self {
        Keytool { toolchain }
    }

    fn command(&self) -> Result<Command> {
        Ok(Command::new(self.toolchain.keytool()?))
    }

    fn verifies(&self, keystore: &Path) -> Result<bool> {
        let mut command = self.command()?;
        command
            .arg("-list")
            .arg("-keystore")
            .arg(keystore)
            .args(["-storepass", DEBUG_PASSWORD, "-alias", DEBUG_ALIAS]);
        Ok(run_checked(&mut command, "keytool verify debug keystore").is_ok())
    }

    fn generate_debug(&self, keystore: &Path) -> Result<()> {
        if keystore.exists() {
            let _ = fs::remove_file(keystore);
        }
        info!("Generating debug keystore: {}", keystore.display());
        let mut command = self.command()?;
        command
            .args(["-genkeypair", "-v", "-noprompt", "-keystore"])
            .arg(keystore)
            .args(["-storepass", DEBUG_PASSWORD, "-alias", DEBUG_ALIAS])
            .args(["-keypass", DEBUG_PASSWORD, "-dname", DEBUG_DNAME])
            .args(["-keyalg", "RSA", "-keysize", "2048", "-validity", "10000"]);
        run_checked(&mut command, "keytool generate debug keystore").map(drop)
    }

    /// Makes `keystore` a usable debug keystore. An existing one that does not
    /// open with the default credentials is moved to `<keystore>.broken`.
    fn ensure_debug(&self, keystore: &Path) -> Result<()> {
        if !keystore.exists() {
            return self.generate_debug(keystore);
        }
        if self.verifies(keystore)? {
            return Ok(());
        }
        let broken = PathBuf::from(format!("{}.broken", keystore.display()));
        warn!(
            "Existing debug keystore is invalid for default credentials. Backing up to: {}",
            broken.display()
        );
        let _ = fs::remove_file(&broken);
        if let Err(error) = fs::rename(keystore, &broken) {
            warn!("failed to back up invalid debug keystore: {error}");
        }
        self.generate_debug(keystore)
    }

    /// The Android debug identity, created on first use. Prefers
    /// `~/.android/debug.keystore` and falls back to the temp dir when the
    /// home location is not writable or cannot be prepared.
    pub fn debug_identity(&self) -> Result<SigningIdentity> {
        let temp_keystore = std::env::temp_dir().join("kapp-debug.keystore");
        let home_keystore = self
            .toolchain
            .settings()
            .home_dir
            .as_ref()
            .map(|home| home.join(".android").join("debug.keystore"))
            .filter(|path| path.parent().is_some_and(can_write_dir));

        if let Some(home_keystore) = home_keystore {
            match self.ensure_debug(&home_keystore) {
                Ok(()) => return Ok(SigningIdentity::debug(home_keystore)),
                Err(error) => warn!(
                    "Failed to prepare ~/.android debug keystore, retrying with temporary location. Reason: {error}"
                ),
            }
        } else {
            info!(
                "Default ~/.android directory is not writable. Using temporary debug keystore: {}",
                temp_keystore.display()
            );
        }

        self.ensure_debug(&temp_keystore)?;
        Ok(SigningIdentity::debug(temp_keystore))
    }
}

impl FingerprintSource for Keytool<'_> {
    fn certificate_sha256(&self, identity: &SigningIdentity) -> Result<Option<[u8; 32]>> {
        if !identity.keystore.exists() {
            return Ok(None);
        }
        let mut command = self.command()?;
        command
            .args(["-list", "-v", "-keystore"])
            .arg(&identity.keystore)
            .args(["-storepass", identity.password.as_str()]);
        if let Some(alias) = &identity.alias {
            command.args(["-alias", alias.as_str()]);
        }
        let output = run_checked(&mut command, "keytool list certificate")?;
        Ok(parse_sha256_fingerprint(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// First `SHA256:` fingerprint in `keytool -list -v` output.
pub fn parse_sha256_fingerprint(listing: &str) -> Option<[u8; 32]> {
    listing
        .lines()
        .filter_map(|line| line.split_once("SHA256:").map(|(_, rest)| rest))
        .find_map(|rest| {
            let digits: String = rest.trim().chars().filter(|c| *c != ':').collect();
            let bytes = hex::decode(digits).ok()?;
            <[u8; 32]>::try_from(bytes.as_slice()).ok()
        })
}

/// An explicit keystore with password wins; otherwise the debug identity.
pub fn resolve_identity(
    keystore: Option<PathBuf>,
    password: Option<String>,
    alias: Option<String>,
    debug: impl FnOnce() -> Result<SigningIdentity>,
) -> Result<SigningIdentity> {
    match (keystore, password) {
        (Some(keystore), Some(password)) if !password.is_empty() => {
            if !keystore.exists() {
                return Err(Error::Config(format!(
                    "keystore not found: {}",
                    keystore.display()
                )));
            }
            Ok(SigningIdentity::new(keystore, &password, alias))
        }
        _ => {
            info!("No signing config provided. Falling back to Android debug keystore.");
            debug()
        }
    }
}

fn can_write_dir(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".kapp-write-test-{}", std::process::id()));
    let writable = fs::write(&probe, b"ok").is_ok();
    let _ = fs::remove_file(&probe);
    writable
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Alias name: androiddebugkey
Creation date: Jan 1, 2024
Certificate fingerprints:
\t SHA1: 11:22:33
\t SHA256: 0A:1B:2C:3D:4E:5F:60:71:82:93:A4:B5:C6:D7:E8:F9:0A:1B:2C:3D:4E:5F:60:71:82:93:A4:B5:C6:D7:E8:F9
Signature algorithm name: SHA256withRSA
";

    #[test]
    fn parses_keytool_fingerprint() {
        let fingerprint = parse_sha256_fingerprint(LISTING).unwrap();
        assert_eq!(fingerprint[0], 0x0a);
        assert_eq!(fingerprint[31], 0xf9);
    }

    #[test]
    fn unusable_fingerprints_are_none() {
        assert_eq!(parse_sha256_fingerprint("no certificates here"), None);
        assert_eq!(parse_sha256_fingerprint("SHA256: 0A:1B"), None);
        assert_eq!(parse_sha256_fingerprint("SHA256: not-hex"), None);
    }

    #[test]
    fn identity_strips_pass_prefix() {
        let identity = SigningIdentity::new("release.jks", "pass:s3cret", Some(String::new()));
        assert_eq!(identity.password, "s3cret");
        assert_eq!(identity.pass_arg(), "pass:s3cret");
        assert_eq!(identity.alias, None);
    }

    #[test]
    fn explicit_keystore_wins_over_debug() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = dir.path().join("release.jks");
        fs::write(&keystore, b"jks").unwrap();

        let identity = resolve_identity(
            Some(keystore.clone()),
            Some("pw".to_string()),
            Some("release".to_string()),
            || panic!("debug keystore must not be prepared"),
        )
        .unwrap();
        assert_eq!(identity.keystore, keystore);
        assert_eq!(identity.alias.as_deref(), Some("release"));

        let fallback = resolve_identity(Some(keystore), None, None, || {
            Ok(SigningIdentity::debug("/tmp/debug.keystore"))
        })
        .unwrap();
        assert_eq!(fallback.alias.as_deref(), Some(DEBUG_ALIAS));
        assert_eq!(fallback.password, DEBUG_PASSWORD);
    }

    #[test]
    fn missing_explicit_keystore_is_a_config_error() {
        let error = resolve_identity(
            Some(PathBuf::from("/nonexistent/release.jks")),
            Some("pw".to_string()),
            None,
            || panic!("unused"),
        )
        .unwrap_err();
        assert!(matches!(error, Error::Config(_)));
    }
}
