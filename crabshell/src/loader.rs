//! Builds the loader project (native library + bootstrap APK) and the packer,
//! and runs the packer binary.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use regex::Regex;

use crate::error::{Error, Result};
use crate::process::run_checked;
use crate::settings::Settings;
use crate::toolchain::{version_tuple, Toolchain};

/// Where the loader project and the packer crate live under the repository
/// root.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProjectLayout { root: root.into() }
    }

    pub fn loader_project(&self) -> PathBuf {
        self.root.join("loader")
    }

    pub fn loader_crate(&self) -> PathBuf {
        self.loader_project().join("app/src/main/rust")
    }

    pub fn packer_crate(&self) -> PathBuf {
        self.root.join("packer")
    }

    pub fn loader_config(&self) -> PathBuf {
        self.loader_crate().join("src/config.rs")
    }

    pub fn packer_config(&self) -> PathBuf {
        self.packer_crate().join("src/config.rs")
    }

    pub fn bootstrap_lib_dir(&self) -> PathBuf {
        self.loader_project().join("app/src/main/jniLibs")
    }

    pub fn bootstrap_apk(&self) -> PathBuf {
        self.loader_project()
            .join("app/build/outputs/apk/release/app-release-unsigned.apk")
    }

    pub fn component_factory_source(&self) -> PathBuf {
        self.loader_project()
            .join("app/src/main/java/com/kapp/shell/ShellComponentFactory.java")
    }

    /// The packer is a workspace member, so it lands in the workspace target
    /// dir. A standalone build of the crate is accepted as well.
    pub fn packer_binary(&self) -> PathBuf {
        let name = format!("packer{}", std::env::consts::EXE_SUFFIX);
        let workspace = self.root.join("target/release").join(&name);
        let standalone = self.packer_crate().join("target/release").join(&name);
        if !workspace.exists() && standalone.exists() {
            standalone
        } else {
            workspace
        }
    }
}

/// Compiles the loader and packer against the currently generated configs.
pub trait LoaderBuilder {
    fn build_packer(&self) -> Result<()>;
    /// Bakes the original application and factory class names into the
    /// loader's Java sources.
    fn patch_constants(&self, original_application: &str, original_factory: Option<&str>) -> Result<()>;
    /// Native library, then the bootstrap APK.
    fn build_loader(&self) -> Result<()>;
}

pub struct CargoLoaderBuilder<'a> {
    layout: ProjectLayout,
    toolchain: &'a Toolchain,
}

impl<'a> CargoLoaderBuilder<'a> {
    pub fn new(layout: ProjectLayout, toolchain: &'a Toolchain) -> Self {
        CargoLoaderBuilder { layout, toolchain }
    }

    fn cargo_search_path(&self) -> Vec<PathBuf> {
        let settings = self.toolchain.settings();
        let mut path = settings.search_path.clone();
        if let Some(cargo_bin) = settings.home_dir.as_ref().map(|home| home.join(".cargo/bin")) {
            if !path.contains(&cargo_bin) {
                path.insert(0, cargo_bin);
            }
        }
        path
    }

    /// Environment for cargo-ndk and gradle: a JDK first on `PATH`,
    /// `JAVA_HOME` matching it, and a usable `ANDROID_NDK_HOME`.
    fn android_env(&self) -> Result<Vec<(&'static str, OsString)>> {
        let settings = self.toolchain.settings();
        let mut env = Vec::new();
        let mut path = self.cargo_search_path();

        let java = fs::canonicalize(self.toolchain.java()?)?;
        if let Some(java_bin) = java.parent() {
            path.retain(|entry| entry != java_bin);
            path.insert(0, java_bin.to_path_buf());
        }
        if let Some(java_home) = java_home_from(&java) {
            env.push(("JAVA_HOME", java_home.into_os_string()));
        }

        let ndk = detect_ndk(settings).ok_or_else(|| {
            Error::Config(
                "Could not detect Android NDK. Please set ANDROID_NDK_HOME to your NDK installation."
                    .to_string(),
            )
        })?;
        info!("Using NDK at: {}", ndk.display());
        env.push(("ANDROID_NDK_HOME", ndk.into_os_string()));

        let joined = std::env::join_paths(path).map_err(|error| Error::Config(error.to_string()))?;
        env.push(("PATH", joined));
        Ok(env)
    }
}

impl LoaderBuilder for CargoLoaderBuilder<'_> {
    fn build_packer(&self) -> Result<()> {
        info!("Building Packer...");
        let path = std::env::join_paths(self.cargo_search_path())
            .map_err(|error| Error::Config(error.to_string()))?;
        let mut command = Command::new("cargo");
        command
            .args(["build", "--release"])
            .current_dir(self.layout.packer_crate())
            .env("PATH", path);
        run_checked(&mut command, "Build Packer").map(drop)
    }

    fn patch_constants(&self, original_application: &str, original_factory: Option<&str>) -> Result<()> {
        info!(
            "Patching Shell loader constants: App={original_application}, Factory={}",
            original_factory.unwrap_or_default()
        );
        let source_path = self.layout.component_factory_source();
        let Ok(source) = fs::read_to_string(&source_path) else {
            warn!("{} not found, skipping constant patching", source_path.display());
            return Ok(());
        };
        let patched = patch_loader_constants(
            &source,
            original_application,
            original_factory.unwrap_or_default(),
        );
        fs::write(&source_path, patched)?;
        Ok(())
    }

    fn build_loader(&self) -> Result<()> {
        let env = self.android_env()?;

        info!("Building Shell (Native)...");
        let mut native = Command::new("cargo");
        native
            .args(["ndk", "-t", "arm64-v8a", "-t", "armeabi-v7a", "-o", "../jniLibs"])
            .args(["build", "--release"])
            .current_dir(self.layout.loader_crate())
            .envs(env.iter().map(|(key, value)| (*key, value)));
        run_checked(&mut native, "Build Shell (Native)")?;

        info!("Building Shell (APK)...");
        let project = self.layout.loader_project();
        let gradle = if project.join("gradlew").exists() {
            "./gradlew"
        } else {
            "gradle"
        };
        let mut apk = Command::new(gradle);
        apk.arg("assembleRelease")
            .current_dir(&project)
            .envs(env.iter().map(|(key, value)| (*key, value)));
        run_checked(&mut apk, "Gradle assembleRelease")?;
        Ok(())
    }
}

/// Rewrites `ORIGINAL_APP` / `ORIGINAL_FACTORY` string constants, or the
/// `REPLACE_ORIGINAL_*` placeholders when the constants are not declared.
pub fn patch_loader_constants(source: &str, original_application: &str, original_factory: &str) -> String {
    let mut out = source.to_string();
    for (constant, placeholder, value) in [
        ("ORIGINAL_APP", "REPLACE_ORIGINAL_APP", original_application),
        ("ORIGINAL_FACTORY", "REPLACE_ORIGINAL_FACTORY", original_factory),
    ] {
        let pattern = format!(r#"(public\s+static\s+final\s+String\s+{constant}\s*=\s*)".*?";"#);
        let Ok(regex) = Regex::new(&pattern) else {
            continue;
        };
        match regex.find(&out) {
            Some(found) => {
                let declaration = regex.replace(found.as_str(), |captures: &regex::Captures<'_>| {
                    format!("{}\"{}\";", &captures[1], java_escape(value))
                });
                out = format!("{}{}{}", &out[..found.start()], declaration, &out[found.end()..]);
            }
            None => out = out.replace(placeholder, value),
        }
    }
    out
}

fn java_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn java_home_from(java: &Path) -> Option<PathBuf> {
    let bin = java.parent()?;
    if bin.file_name()? != "bin" {
        return None;
    }
    let home = bin.parent()?;
    home.join("bin").join("java").exists().then(|| home.to_path_buf())
}

/// `ANDROID_NDK_HOME` when it exists, otherwise the newest NDK under the
/// usual SDK locations.
pub fn detect_ndk(settings: &Settings) -> Option<PathBuf> {
    if let Some(ndk) = &settings.ndk_home {
        if ndk.is_dir() {
            return Some(ndk.clone());
        }
        warn!(
            "ANDROID_NDK_HOME is set to '{}' but that directory does not exist. Ignoring.",
            ndk.display()
        );
    }

    let mut candidates: Vec<PathBuf> = settings.sdk_roots.iter().map(|root| root.join("ndk")).collect();
    if let Some(home) = &settings.home_dir {
        candidates.push(home.join("Library/Android/sdk/ndk-bundle"));
    }

    candidates.into_iter().filter(|dir| dir.is_dir()).find_map(|dir| {
        let newest = fs::read_dir(&dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with(|c: char| c.is_ascii_digit()))
            .max_by_key(|name| version_tuple(name));
        match newest {
            Some(version) => Some(dir.join(version)),
            None => dir.join("sysroot").exists().then_some(dir),
        }
    })
}

/// Mode of one packer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadMode {
    /// Write only the encrypted payload blob here.
    Out(PathBuf),
    /// Repack reusing this blob.
    In(PathBuf),
}

/// Arguments of a packer run, shared by both phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackerInvocation {
    pub target: PathBuf,
    pub output: PathBuf,
    pub bootstrap_apk: PathBuf,
    pub bootstrap_lib_dir: PathBuf,
    pub patched_manifest: PathBuf,
    pub resources: Option<PathBuf>,
    pub keep_classes: Vec<String>,
    pub keep_prefixes: Vec<String>,
    pub keep_libs: Vec<String>,
    pub encrypt_assets: Vec<String>,
}

impl PackerInvocation {
    pub fn to_args(&self, mode: &PayloadMode) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: &Path| {
            args.push(flag.into());
            args.push(value.as_os_str().to_owned());
        };
        push("--target", &self.target);
        if let PayloadMode::In(_) = mode {
            push("--output", &self.output);
        }
        push("--bootstrap-apk", &self.bootstrap_apk);
        push("--bootstrap-lib-dir", &self.bootstrap_lib_dir);
        push("--patched-manifest", &self.patched_manifest);
        if let Some(resources) = &self.resources {
            push("--resources", resources);
        }
        match mode {
            PayloadMode::Out(path) => push("--payload-out", path),
            PayloadMode::In(path) => push("--payload-in", path),
        }
        for (flag, values) in [
            ("--keep-class", &self.keep_classes),
            ("--keep-prefix", &self.keep_prefixes),
            ("--keep-lib", &self.keep_libs),
            ("--encrypt-asset", &self.encrypt_assets),
        ] {
            for value in values {
                args.push(flag.into());
                args.push(value.into());
            }
        }
        args
    }
}

/// Packer collaborator.
pub trait PackerRunner {
    fn run(&self, invocation: &PackerInvocation, mode: &PayloadMode) -> Result<()>;
}

pub struct PackerBinary {
    binary: PathBuf,
}

impl PackerBinary {
    pub fn new(layout: &ProjectLayout) -> Self {
        PackerBinary {
            binary: layout.packer_binary(),
        }
    }
}

impl PackerRunner for PackerBinary {
    fn run(&self, invocation: &PackerInvocation, mode: &PayloadMode) -> Result<()> {
        if !self.binary.exists() {
            return Err(Error::ToolNotFound {
                tool: "packer".to_string(),
                reason: format!(
                    "{} does not exist; build it first or drop --skip-build",
                    self.binary.display()
                ),
            });
        }
        let action = match mode {
            PayloadMode::Out(_) => "Generate payload",
            PayloadMode::In(_) => "Final packing",
        };
        let mut command = Command::new(&self.binary);
        command.args(invocation.to_args(mode));
        let output = run_checked(&mut command, action)?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("{line}");
        }
        Ok(())
    }
}
