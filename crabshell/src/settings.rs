//! Process-wide configuration, read from the environment exactly once.
//!
//! Everything that used to be looked up ad hoc (tool versions, mirror lists,
//! cache location, feature flags) lives in [`Settings`], which is handed to
//! the constructors that need it. Tests build one from a map through
//! [`Settings::from_lookup`].

use std::path::PathBuf;
use std::time::Duration;

const TOOLCHAIN_SUBDIR: &str = "crabshell-toolchain";
const DEFAULT_CACHE_MAX_ENTRIES: usize = 32;
const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

pub const DEFAULT_PROVIDER_CLASS: &str = "com.kapp.shell.BootstrapProvider";

/// A jar-distributed tool the resolver may download on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JarTool {
    Apktool,
    Bundletool,
    UberApkSigner,
}

impl JarTool {
    pub fn name(self) -> &'static str {
        match self {
            JarTool::Apktool => "apktool",
            JarTool::Bundletool => "bundletool",
            JarTool::UberApkSigner => "uber-apk-signer",
        }
    }

    fn env_prefix(self) -> &'static str {
        match self {
            JarTool::Apktool => "APKTOOL",
            JarTool::Bundletool => "BUNDLETOOL",
            JarTool::UberApkSigner => "UBER_APK_SIGNER",
        }
    }

    fn default_version(self) -> &'static str {
        match self {
            JarTool::Apktool => "2.11.1",
            JarTool::Bundletool => "1.17.2",
            JarTool::UberApkSigner => "1.3.0",
        }
    }

    fn canonical_url(self, version: &str) -> String {
        match self {
            JarTool::Apktool => format!(
                "https://github.com/iBotPeaches/Apktool/releases/download/v{version}/apktool_{version}.jar"
            ),
            JarTool::Bundletool => format!(
                "https://github.com/google/bundletool/releases/download/{version}/bundletool-all-{version}.jar"
            ),
            JarTool::UberApkSigner => format!(
                "https://github.com/patrickfav/uber-apk-signer/releases/download/v{version}/uber-apk-signer-{version}.jar"
            ),
        }
    }
}

/// Where to fetch one jar tool from and how to validate it.
#[derive(Debug, Clone)]
pub struct JarSource {
    pub tool: JarTool,
    pub version: String,
    pub canonical_url: String,
    /// Operator mirrors, tried before the canonical URL.
    pub override_urls: Vec<String>,
    pub sha256: Option<String>,
}

impl JarSource {
    pub fn file_name(&self) -> String {
        format!("{}-{}.jar", self.tool.name(), self.version)
    }

    /// Mirrors first, then the canonical URL, without duplicates.
    pub fn candidate_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for url in self
            .override_urls
            .iter()
            .chain(std::iter::once(&self.canonical_url))
        {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub salt: Option<String>,
    pub max_entries: usize,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Repository root holding `packer/` and the loader project.
    pub project_root: PathBuf,
    pub toolchain_dir: PathBuf,
    pub apktool: JarSource,
    pub bundletool: JarSource,
    pub uber_apk_signer: JarSource,
    pub download_retries: u32,
    pub download_timeout: Duration,
    pub cache: CacheSettings,
    /// Ship the `resources.arsc` rebuilt by apktool instead of the original.
    pub use_rebuilt_resources: bool,
    pub provider_class_override: Option<String>,
    /// Candidate SDK roots in lookup order. Missing directories are skipped
    /// at use.
    pub sdk_roots: Vec<PathBuf>,
    /// Directories of the process search path.
    pub search_path: Vec<PathBuf>,
    pub java_home: Option<PathBuf>,
    pub ndk_home: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let home_dir = dirs::home_dir();
        let expand = |raw: String| expand_home(&raw, home_dir.as_ref());

        let project_root = get("CRABSHELL_ROOT")
            .map(expand)
            .unwrap_or_else(|| PathBuf::from("."));

        let toolchain_dir = match get("CRABSHELL_TOOLCHAIN_DIR") {
            Some(dir) => expand(dir),
            None => {
                let codex_home = get("CODEX_HOME").map(expand).unwrap_or_else(|| {
                    home_dir
                        .clone()
                        .unwrap_or_else(std::env::temp_dir)
                        .join(".codex")
                });
                codex_home.join("tools").join(TOOLCHAIN_SUBDIR)
            }
        };

        let jar_source = |tool: JarTool| {
            let prefix = tool.env_prefix();
            let version = get(&format!("{prefix}_VERSION"))
                .unwrap_or_else(|| tool.default_version().to_string());
            JarSource {
                tool,
                canonical_url: tool.canonical_url(&version),
                version,
                override_urls: get(&format!("CRABSHELL_{prefix}_URLS"))
                    .map(|raw| split_list(&raw))
                    .unwrap_or_default(),
                sha256: get(&format!("CRABSHELL_{prefix}_SHA256")),
            }
        };

        let cache = CacheSettings {
            enabled: get("CRABSHELL_MANIFEST_CACHE")
                .map(|value| parse_flag(&value))
                .unwrap_or(true),
            dir: get("CRABSHELL_MANIFEST_CACHE_DIR")
                .map(expand)
                .unwrap_or_else(|| toolchain_dir.join("manifest-cache")),
            salt: get("CRABSHELL_MANIFEST_CACHE_SALT"),
            max_entries: get("CRABSHELL_MANIFEST_CACHE_MAX_ENTRIES")
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
            ttl: Duration::from_secs(
                get("CRABSHELL_MANIFEST_CACHE_TTL_SECS")
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(DEFAULT_CACHE_TTL_SECS),
            ),
        };

        let mut sdk_roots: Vec<PathBuf> = ["ANDROID_SDK_ROOT", "ANDROID_HOME"]
            .iter()
            .filter_map(|&key| get(key).map(PathBuf::from))
            .collect();
        if let Some(home) = &home_dir {
            sdk_roots.push(home.join("Library/Android/sdk"));
        }
        sdk_roots.push(PathBuf::from("/usr/local/lib/android/sdk"));

        Settings {
            project_root,
            apktool: jar_source(JarTool::Apktool),
            bundletool: jar_source(JarTool::Bundletool),
            uber_apk_signer: jar_source(JarTool::UberApkSigner),
            download_retries: get("TOOL_DOWNLOAD_RETRIES")
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|retries| *retries > 0)
                .unwrap_or(3),
            download_timeout: Duration::from_secs(
                get("TOOL_DOWNLOAD_TIMEOUT")
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(60),
            ),
            cache,
            use_rebuilt_resources: get("CRABSHELL_USE_REBUILT_RESOURCES")
                .map(|value| value == "1")
                .unwrap_or(false),
            provider_class_override: get("CRABSHELL_BOOTSTRAP_PROVIDER"),
            sdk_roots,
            search_path: lookup("PATH")
                .map(|raw| std::env::split_paths(&raw).collect())
                .unwrap_or_default(),
            java_home: get("JAVA_HOME").map(PathBuf::from),
            ndk_home: get("ANDROID_NDK_HOME").map(PathBuf::from),
            home_dir,
            toolchain_dir,
        }
    }

    pub fn jar_source(&self, tool: JarTool) -> &JarSource {
        match tool {
            JarTool::Apktool => &self.apktool,
            JarTool::Bundletool => &self.bundletool,
            JarTool::UberApkSigner => &self.uber_apk_signer,
        }
    }

    pub fn provider_class(&self) -> &str {
        self.provider_class_override
            .as_deref()
            .unwrap_or(DEFAULT_PROVIDER_CLASS)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn expand_home(raw: &str, home: Option<&PathBuf>) -> PathBuf {
    match (raw.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn override_urls_come_first_and_are_deduplicated() {
        let settings = settings(&[(
            "CRABSHELL_APKTOOL_URLS",
            "https://mirror.example/a.jar, ,https://mirror.example/a.jar,https://github.com/iBotPeaches/Apktool/releases/download/v2.11.1/apktool_2.11.1.jar",
        )]);

        let urls = settings.apktool.candidate_urls();
        assert_eq!(
            urls,
            vec![
                "https://mirror.example/a.jar".to_string(),
                settings.apktool.canonical_url.clone(),
            ]
        );
    }

    #[test]
    fn defaults_apply_without_environment() {
        let settings = settings(&[]);
        assert_eq!(settings.download_retries, 3);
        assert_eq!(settings.download_timeout, Duration::from_secs(60));
        assert!(settings.cache.enabled);
        assert!(!settings.use_rebuilt_resources);
        assert_eq!(settings.provider_class(), DEFAULT_PROVIDER_CLASS);
        assert_eq!(settings.bundletool.file_name(), "bundletool-1.17.2.jar");
        assert!(settings.cache.dir.ends_with("manifest-cache"));
    }

    #[test]
    fn cache_and_resource_flags_are_read() {
        let settings = settings(&[
            ("CRABSHELL_MANIFEST_CACHE", "0"),
            ("CRABSHELL_MANIFEST_CACHE_SALT", "v2"),
            ("CRABSHELL_USE_REBUILT_RESOURCES", "1"),
            ("CRABSHELL_BOOTSTRAP_PROVIDER", "com.acme.Boot"),
            ("APKTOOL_VERSION", "2.9.3"),
        ]);
        assert!(!settings.cache.enabled);
        assert_eq!(settings.cache.salt.as_deref(), Some("v2"));
        assert!(settings.use_rebuilt_resources);
        assert_eq!(settings.provider_class(), "com.acme.Boot");
        assert_eq!(settings.apktool.file_name(), "apktool-2.9.3.jar");
        assert!(settings.apktool.canonical_url.contains("v2.9.3/apktool_2.9.3.jar"));
    }
}
