//! Locating and acquiring the external tools the pipeline shells out to.
//!
//! Lookup order for native tools is the managed toolchain directory, then
//! the search path, then the SDK `build-tools/<version>/` directories (the
//! highest version wins). Jar tools are downloaded into the managed
//! directory when missing, trying operator mirrors before the canonical URL,
//! each with a bounded number of attempts. A valid cached download means no
//! network access at all.

use std::cell::OnceCell;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::{info, warn};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::process;
use crate::retry::RetryPolicy;
use crate::settings::{JarSource, JarTool, Settings};

const CHUNK_SIZE: usize = 256 * 1024;
const UNKNOWN_LENGTH_REPORT_EVERY: u64 = 4 * 1024 * 1024;

const JDK_BIN_CANDIDATES: [&str; 6] = [
    "/opt/homebrew/opt/openjdk@21/bin",
    "/opt/homebrew/opt/openjdk@17/bin",
    "/opt/homebrew/opt/openjdk/bin",
    "/usr/local/opt/openjdk@21/bin",
    "/usr/local/opt/openjdk@17/bin",
    "/usr/local/opt/openjdk/bin",
];

/// Source of bytes for a download. The HTTP implementation is the only one
/// used outside tests.
pub trait Fetcher {
    /// Opens `url`, returning the announced length (if any) and the body.
    fn open(&self, url: &str) -> Result<(Option<u64>, Box<dyn Read>)>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn open(&self, url: &str) -> Result<(Option<u64>, Box<dyn Read>)> {
        let response = self.client.get(url).send()?.error_for_status()?;
        let length = response.content_length();
        Ok((length, Box::new(response)))
    }
}

pub struct Toolchain {
    settings: Settings,
    fetcher: Box<dyn Fetcher>,
    java: OnceCell<PathBuf>,
    keytool: OnceCell<PathBuf>,
}

impl Toolchain {
    pub fn new(settings: &Settings) -> Result<Self> {
        let fetcher = HttpFetcher::new(settings.download_timeout)?;
        Ok(Self::with_fetcher(settings, Box::new(fetcher)))
    }

    pub fn with_fetcher(settings: &Settings, fetcher: Box<dyn Fetcher>) -> Self {
        Toolchain {
            settings: settings.clone(),
            fetcher,
            java: OnceCell::new(),
            keytool: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn managed_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.settings.toolchain_dir)?;
        Ok(&self.settings.toolchain_dir)
    }

    /// Finds an SDK build tool such as `apksigner`. `None` when absent
    /// everywhere; build tools have no download source.
    pub fn find_build_tool(&self, name: &str) -> Option<PathBuf> {
        let managed = &self.settings.toolchain_dir;
        [managed.join("bin").join(name), managed.join(name)]
            .into_iter()
            .find(|candidate| is_executable(candidate))
            .or_else(|| self.find_in_search_path(name))
            .or_else(|| self.find_in_sdk(name))
    }

    fn find_in_search_path(&self, name: &str) -> Option<PathBuf> {
        self.settings
            .search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }

    fn find_in_sdk(&self, name: &str) -> Option<PathBuf> {
        let mut candidates: Vec<(Vec<u64>, PathBuf)> = Vec::new();
        for root in self.settings.sdk_roots.iter().filter(|root| root.is_dir()) {
            let Ok(versions) = fs::read_dir(root.join("build-tools")) else {
                continue;
            };
            for version in versions.flatten() {
                let tool = version.path().join(name);
                if is_executable(&tool) {
                    let version = version.file_name().to_string_lossy().into_owned();
                    candidates.push((version_tuple(&version), tool));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.pop().map(|(_, path)| path)
    }

    /// A usable `java`, checked with `-version`.
    pub fn java(&self) -> Result<&Path> {
        if let Some(java) = self.java.get() {
            return Ok(java);
        }
        let java = self.locate_java().ok_or_else(|| Error::ToolNotFound {
            tool: "java".to_string(),
            reason: "Java runtime not found or unusable. Install JDK 17+ and set JAVA_HOME \
                     (macOS: `brew install --cask temurin`)."
                .to_string(),
        })?;
        Ok(self.java.get_or_init(|| java))
    }

    fn locate_java(&self) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(home) = &self.settings.java_home {
            candidates.push(home.join("bin").join("java"));
        }
        candidates.extend(self.find_in_search_path("java"));
        candidates.extend(JDK_BIN_CANDIDATES.iter().map(|dir| Path::new(dir).join("java")));
        if let Some(home) = macos_java_home() {
            candidates.push(home.join("bin").join("java"));
        }
        candidates
            .into_iter()
            .find(|candidate| is_executable(candidate) && process::answers(candidate, "-version"))
    }

    /// `keytool` from JAVA_HOME, the search path, next to `java`, or a
    /// Homebrew JDK.
    pub fn keytool(&self) -> Result<&Path> {
        if let Some(keytool) = self.keytool.get() {
            return Ok(keytool);
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(home) = &self.settings.java_home {
            candidates.push(home.join("bin").join("keytool"));
        }
        candidates.extend(self.find_in_search_path("keytool"));
        if let Ok(java) = self.java() {
            let resolved = fs::canonicalize(java).unwrap_or_else(|_| java.to_path_buf());
            if let Some(bin) = resolved.parent() {
                candidates.push(bin.join("keytool"));
            }
        }
        candidates.extend(JDK_BIN_CANDIDATES.iter().map(|dir| Path::new(dir).join("keytool")));

        let keytool = candidates
            .into_iter()
            .find(|candidate| is_executable(candidate) && process::answers(candidate, "-help"))
            .ok_or_else(|| Error::ToolNotFound {
                tool: "keytool".to_string(),
                reason: "install JDK 17+ and make sure keytool is available".to_string(),
            })?;
        Ok(self.keytool.get_or_init(|| keytool))
    }

    /// `apktool` as a native launcher when installed, else `java -jar`.
    pub fn apktool(&self) -> Result<Command> {
        let managed = &self.settings.toolchain_dir;
        let native = [managed.join("bin").join("apktool"), managed.join("apktool")]
            .into_iter()
            .find(|candidate| is_executable(candidate))
            .or_else(|| self.find_in_search_path("apktool"));
        match native {
            Some(path) => Ok(Command::new(path)),
            None => self.jar_command(JarTool::Apktool),
        }
    }

    /// `java -jar <tool.jar>`, downloading the jar if needed.
    pub fn jar_command(&self, tool: JarTool) -> Result<Command> {
        let jar = self.ensure_jar(tool)?;
        let mut command = Command::new(self.java()?);
        command.arg("-jar").arg(jar);
        Ok(command)
    }

    pub fn ensure_jar(&self, tool: JarTool) -> Result<PathBuf> {
        let source = self.settings.jar_source(tool).clone();
        let target = self.managed_dir()?.join(source.file_name());
        self.ensure_downloaded(&source, &target)?;
        Ok(target)
    }

    /// Makes sure `target` holds a valid copy of `source`. An invalid file is
    /// deleted and fetched again once before giving up.
    pub fn ensure_downloaded(&self, source: &JarSource, target: &Path) -> Result<()> {
        if validate_file(target, source.sha256.as_deref()) {
            return Ok(());
        }

        let urls = source.candidate_urls();
        for round in 1..=2 {
            info!(
                "[toolchain] downloading {} from {}",
                source.file_name(),
                urls.first().map(String::as_str).unwrap_or("<none>")
            );
            self.download_with_fallback(source.tool.name(), &urls, target)?;
            if validate_file(target, source.sha256.as_deref()) {
                return Ok(());
            }
            warn!(
                "[toolchain] downloaded {} failed validation (round {round}/2)",
                target.display()
            );
        }

        Err(Error::ToolNotFound {
            tool: source.tool.name().to_string(),
            reason: format!(
                "downloaded file is invalid and could not be validated: {}",
                target.display()
            ),
        })
    }

    fn download_with_fallback(&self, tool: &str, urls: &[String], target: &Path) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();
        for url in urls {
            match self.download_with_retries(url, target) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    info!("[toolchain] source-failed {url} reason={error}");
                    failures.push(format!("{url} -> {error}"));
                }
            }
        }
        Err(Error::ToolNotFound {
            tool: tool.to_string(),
            reason: format!(
                "All download sources failed for {}: {}",
                file_name(target),
                failures.join(" | ")
            ),
        })
    }

    fn download_with_retries(&self, url: &str, target: &Path) -> Result<()> {
        let name = file_name(target);
        let partial = partial_path(target);
        let policy = RetryPolicy::new(self.settings.download_retries);

        policy
            .run(
                |attempt| {
                    info!("[toolchain] download-start {name} attempt={attempt}");
                    self.download_once(url, &partial, &name)
                },
                |attempt, error| {
                    let _ = fs::remove_file(&partial);
                    if !attempt.is_last() {
                        info!("[toolchain] download-retry {name} attempt={attempt} reason={error}");
                    }
                },
            )
            .map_err(|exhausted| {
                Error::Download(format!(
                    "Failed to download {name} after {} attempts: {}",
                    exhausted.attempts, exhausted.last
                ))
            })?;

        fs::rename(&partial, target)?;
        info!("[toolchain] download-done {name}");
        Ok(())
    }

    fn download_once(&self, url: &str, partial: &Path, name: &str) -> Result<()> {
        let (total, mut body) = self.fetcher.open(url)?;
        let mut output = File::create(partial)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut downloaded: u64 = 0;
        let mut last_percent: Option<u64> = None;

        loop {
            let read = body.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            output.write_all(&buffer[..read])?;
            let before = downloaded;
            downloaded += read as u64;

            match total {
                Some(total) if total > 0 => {
                    let percent = (downloaded * 100 / total).min(100);
                    if last_percent != Some(percent) && percent % 10 == 0 {
                        info!(
                            "[toolchain] download-progress {name} {percent}% ({}/{})",
                            format_bytes(downloaded),
                            format_bytes(total)
                        );
                        last_percent = Some(percent);
                    }
                }
                _ => {
                    if before / UNKNOWN_LENGTH_REPORT_EVERY != downloaded / UNKNOWN_LENGTH_REPORT_EVERY {
                        info!("[toolchain] download-progress {name} {}", format_bytes(downloaded));
                    }
                }
            }
        }
        output.flush()?;

        if let Some(total) = total {
            if downloaded < total {
                return Err(Error::Download(format!(
                    "retrieval incomplete: got only {downloaded} out of {total} bytes"
                )));
            }
        }
        Ok(())
    }
}

/// Existing, checksum-matching and (for jars) structurally sound. Anything
/// else is deleted so the caller downloads a fresh copy.
fn validate_file(path: &Path, expected_sha256: Option<&str>) -> bool {
    if !path.is_file() {
        return false;
    }

    if let Some(expected) = expected_sha256 {
        match sha256_file(path) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => {}
            _ => {
                warn!("Checksum mismatch for {}, re-downloading...", path.display());
                let _ = fs::remove_file(path);
                return false;
            }
        }
    }

    let is_jar = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("jar"))
        .unwrap_or(false);
    if is_jar && !is_valid_archive(path) {
        warn!("[toolchain] detected corrupt jar, re-downloading: {}", path.display());
        let _ = fs::remove_file(path);
        return false;
    }

    true
}

/// Reads every entry so CRC mismatches surface.
pub fn is_valid_archive(path: &Path) -> bool {
    let check = || -> Result<()> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            io::copy(&mut entry, &mut io::sink())?;
        }
        Ok(())
    };
    check().is_ok()
}

pub fn sha256_file(path: &Path) -> Result<String> {
    Ok(hex::encode(sha256_file_bytes(path)?))
}

pub fn sha256_file_bytes(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// `34.0.0-rc1` -> `[34, 0, 0, 0]`; non-numeric parts count as zero.
pub fn version_tuple(version: &str) -> Vec<u64> {
    version
        .replace('-', ".")
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

pub fn format_bytes(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = size as f64;
    for (index, unit) in UNITS.iter().enumerate() {
        if value < 1024.0 || index == UNITS.len() - 1 {
            if index == 0 {
                return format!("{size}{unit}");
            }
            return format!("{value:.1}{unit}");
        }
        value /= 1024.0;
    }
    format!("{size}B")
}

fn macos_java_home() -> Option<PathBuf> {
    let helper = Path::new("/usr/libexec/java_home");
    if !helper.exists() {
        return None;
    }
    let output = Command::new(helper).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let home = String::from_utf8(output.stdout).ok()?;
    let home = home.trim();
    (!home.is_empty()).then(|| PathBuf::from(home))
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::rc::Rc;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    #[derive(Clone, Default)]
    struct FakeFetcher {
        /// url -> queued responses; `None` simulates a connection error.
        responses: Rc<RefCell<HashMap<String, Vec<Option<Vec<u8>>>>>>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl FakeFetcher {
        fn queue(&self, url: &str, response: Option<Vec<u8>>) {
            self.responses
                .borrow_mut()
                .entry(url.to_string())
                .or_default()
                .push(response);
        }
    }

    impl Fetcher for FakeFetcher {
        fn open(&self, url: &str) -> Result<(Option<u64>, Box<dyn Read>)> {
            self.calls.borrow_mut().push(url.to_string());
            let mut responses = self.responses.borrow_mut();
            let queue = responses.entry(url.to_string()).or_default();
            if queue.is_empty() {
                return Err(Error::Download(format!("unreachable {url}")));
            }
            match queue.remove(0) {
                Some(body) => Ok((Some(body.len() as u64), Box::new(Cursor::new(body)))),
                None => Err(Error::Download("connection reset".to_string())),
            }
        }
    }

    fn jar_bytes() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("META-INF/MANIFEST.MF", FileOptions::default())
            .unwrap();
        writer.write_all(b"Manifest-Version: 1.0\n").unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn settings_for(dir: &Path, mirrors: &str) -> Settings {
        let mut env: HashMap<String, String> = HashMap::new();
        env.insert(
            "CRABSHELL_TOOLCHAIN_DIR".to_string(),
            dir.display().to_string(),
        );
        env.insert("CRABSHELL_BUNDLETOOL_URLS".to_string(), mirrors.to_string());
        env.insert("TOOL_DOWNLOAD_RETRIES".to_string(), "2".to_string());
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn falls_back_to_next_source_after_retries() {
        let temp = TempDir::new().unwrap();
        let settings = settings_for(temp.path(), "https://mirror.invalid/bt.jar");
        let fetcher = FakeFetcher::default();
        fetcher.queue("https://mirror.invalid/bt.jar", None);
        fetcher.queue("https://mirror.invalid/bt.jar", None);
        fetcher.queue(&settings.bundletool.canonical_url, Some(jar_bytes()));

        let toolchain = Toolchain::with_fetcher(&settings, Box::new(fetcher.clone()));
        let jar = toolchain.ensure_jar(JarTool::Bundletool).unwrap();

        assert_eq!(jar, temp.path().join("bundletool-1.17.2.jar"));
        assert!(is_valid_archive(&jar));
        assert!(!partial_path(&jar).exists());
        assert_eq!(fetcher.calls.borrow().len(), 3);
    }

    #[test]
    fn cached_valid_jar_needs_no_network() {
        let temp = TempDir::new().unwrap();
        let settings = settings_for(temp.path(), "");
        fs::write(temp.path().join("bundletool-1.17.2.jar"), jar_bytes()).unwrap();

        let fetcher = FakeFetcher::default();
        let toolchain = Toolchain::with_fetcher(&settings, Box::new(fetcher.clone()));
        toolchain.ensure_jar(JarTool::Bundletool).unwrap();
        toolchain.ensure_jar(JarTool::Bundletool).unwrap();

        assert!(fetcher.calls.borrow().is_empty());
    }

    #[test]
    fn corrupt_cached_jar_is_replaced() {
        let temp = TempDir::new().unwrap();
        let settings = settings_for(temp.path(), "");
        let jar_path = temp.path().join("bundletool-1.17.2.jar");
        fs::write(&jar_path, b"not a zip").unwrap();

        let fetcher = FakeFetcher::default();
        fetcher.queue(&settings.bundletool.canonical_url, Some(jar_bytes()));
        let toolchain = Toolchain::with_fetcher(&settings, Box::new(fetcher.clone()));
        toolchain.ensure_jar(JarTool::Bundletool).unwrap();

        assert!(is_valid_archive(&jar_path));
        assert_eq!(fetcher.calls.borrow().len(), 1);
    }

    #[test]
    fn exhausting_every_source_reports_each_reason() {
        let temp = TempDir::new().unwrap();
        let settings = settings_for(temp.path(), "https://a.invalid/x.jar");
        let toolchain = Toolchain::with_fetcher(&settings, Box::new(FakeFetcher::default()));

        let error = toolchain.ensure_jar(JarTool::Bundletool).unwrap_err();
        let message = error.to_string();
        assert!(matches!(error, Error::ToolNotFound { .. }));
        assert!(message.contains("https://a.invalid/x.jar ->"));
        assert!(message.contains(&format!("{} ->", settings.bundletool.canonical_url)));
        assert!(message.contains(" | "));
        assert!(!partial_path(&temp.path().join("bundletool-1.17.2.jar")).exists());
    }

    #[test]
    fn invalid_download_is_fetched_once_more_then_fails() {
        let temp = TempDir::new().unwrap();
        let settings = settings_for(temp.path(), "");
        let fetcher = FakeFetcher::default();
        fetcher.queue(&settings.bundletool.canonical_url, Some(b"garbage".to_vec()));
        fetcher.queue(&settings.bundletool.canonical_url, Some(b"garbage".to_vec()));

        let toolchain = Toolchain::with_fetcher(&settings, Box::new(fetcher.clone()));
        let error = toolchain.ensure_jar(JarTool::Bundletool).unwrap_err();

        assert!(error.to_string().contains("could not be validated"));
        assert_eq!(fetcher.calls.borrow().len(), 2);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tool.bin");
        fs::write(&path, b"abc").unwrap();
        let digest = sha256_file(&path).unwrap();

        assert!(validate_file(&path, Some(&digest.to_uppercase())));
        assert!(!validate_file(&path, Some("00")));
        assert!(!path.exists());
    }

    #[test]
    fn version_tuples_order_like_numbers() {
        assert!(version_tuple("34.0.0") > version_tuple("9.0.0"));
        assert!(version_tuple("33.0.1") > version_tuple("33.0.0"));
        assert_eq!(version_tuple("34.0.0-rc1"), vec![34, 0, 0, 0]);
    }

    #[cfg(unix)]
    #[test]
    fn build_tool_lookup_prefers_highest_sdk_version() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let sdk = temp.path().join("sdk");
        for version in ["30.0.3", "34.0.0", "9.0.0"] {
            let dir = sdk.join("build-tools").join(version);
            fs::create_dir_all(&dir).unwrap();
            let tool = dir.join("apksigner");
            fs::write(&tool, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut env: HashMap<String, String> = HashMap::new();
        env.insert(
            "CRABSHELL_TOOLCHAIN_DIR".to_string(),
            temp.path().join("managed").display().to_string(),
        );
        env.insert("ANDROID_SDK_ROOT".to_string(), sdk.display().to_string());
        env.insert("PATH".to_string(), temp.path().join("empty").display().to_string());
        let settings = Settings::from_lookup(|key| env.get(key).cloned());

        let toolchain = Toolchain::with_fetcher(&settings, Box::new(FakeFetcher::default()));
        let found = toolchain.find_build_tool("apksigner").unwrap();
        assert_eq!(found, sdk.join("build-tools/34.0.0/apksigner"));
        assert!(toolchain.find_build_tool("zipalign").is_none());
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0MB");
    }
}
