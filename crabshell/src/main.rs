use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use env_logger::{Env, Target};
use log::{error, info};

use crabshell::bundle::{is_bundle, Bundletool};
use crabshell::cache::ManifestCache;
use crabshell::check::{self, LayoutRules};
use crabshell::loader::{CargoLoaderBuilder, PackerBinary, ProjectLayout};
use crabshell::manifest::Apktool;
use crabshell::options::{
    normalize_output_path, resolve_output, FileConfig, KeepLists, OutputFormat, DEFAULT_CONFIG_FILE,
    DEFAULT_OUTPUT,
};
use crabshell::pipeline::{Collaborators, PackRequest, Pipeline};
use crabshell::settings::Settings;
use crabshell::signing::{resolve_identity, ApkSigner, Keytool};
use crabshell::toolchain::Toolchain;

#[derive(Parser, Debug)]
#[command(author, version, about = "CrabShell APK/AAB hardening", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Harden an APK or AAB.
    Pack(PackArgs),
    /// Validate the layout of a hardened APK.
    Check(CheckArgs),
    /// Maintain the manifest cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args, Debug)]
struct PackArgs {
    /// JSON file with defaults for every option below
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// APK or AAB to harden
    #[arg(long)]
    target: Option<PathBuf>,

    /// Output file or directory [default: protected.apk]
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum)]
    output_format: Option<OutputFormat>,

    #[arg(long)]
    keystore: Option<PathBuf>,

    #[arg(long)]
    ks_pass: Option<String>,

    #[arg(long)]
    key_alias: Option<String>,

    #[arg(long)]
    no_sign: bool,

    /// Reuse the prebuilt packer and loader
    #[arg(long)]
    skip_build: bool,

    /// Fail when the signing certificate fingerprint cannot be read
    #[arg(long)]
    require_signature_hash: bool,

    /// Class kept in plaintext (repeatable)
    #[arg(long = "keep-class")]
    keep_classes: Vec<String>,

    /// Package prefix kept in plaintext (repeatable)
    #[arg(long = "keep-prefix")]
    keep_prefixes: Vec<String>,

    /// Native library kept in plaintext, e.g. `mmkv` (repeatable)
    #[arg(long = "keep-lib")]
    keep_libs: Vec<String>,

    /// Asset glob to encrypt, e.g. `assets/*.js` (repeatable)
    #[arg(long = "encrypt-asset")]
    encrypt_assets: Vec<String>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long)]
    apk: PathBuf,

    /// Entry that must exist, e.g. assets/kapp_payload.bin (repeatable)
    #[arg(long = "require-entry")]
    require_entries: Vec<String>,

    /// Library that must not remain, e.g. mmkv or libmmkv.so (repeatable)
    #[arg(long = "forbid-lib")]
    forbid_libs: Vec<String>,

    #[arg(long)]
    min_plaintext_dex: Option<usize>,

    #[arg(long)]
    max_plaintext_dex: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Drop expired entries, then the oldest beyond the entry budget.
    Prune {
        #[arg(long)]
        max_entries: Option<usize>,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stdout)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    match cli.command {
        Command::Pack(args) => pack(args, &settings),
        Command::Check(args) => check_layout(args),
        Command::Cache {
            action: CacheAction::Prune {
                max_entries,
                ttl_secs,
            },
        } => prune_cache(&settings, max_entries, ttl_secs),
    }
}

fn pack(args: PackArgs, settings: &Settings) -> anyhow::Result<()> {
    let file = FileConfig::load(&args.config)?;

    let target = args
        .target
        .or(file.target.clone())
        .context("Target APK not specified (use --target or config file).")?;
    let output = args
        .output
        .or(file.output.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    let output = normalize_output_path(&target, &output);
    let format = args.output_format.or(file.output_format).unwrap_or_default();
    let resolved = resolve_output(&output, format, is_bundle(&target))?;
    if let Some(parent) = resolved.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }

    let keep = KeepLists::merge(
        KeepLists {
            classes: args.keep_classes,
            prefixes: args.keep_prefixes,
            libs: args.keep_libs,
            encrypt_assets: args.encrypt_assets,
        },
        &file,
    );

    let toolchain = Toolchain::new(settings)?;
    let keytool = Keytool::new(&toolchain);
    let signing = resolve_identity(
        args.keystore.or(file.keystore.clone()),
        args.ks_pass.or(file.ks_pass.clone()),
        args.key_alias.or(file.key_alias.clone()),
        || keytool.debug_identity(),
    )?;

    let layout = ProjectLayout::new(&settings.project_root);
    let codec = Apktool::new(&toolchain);
    let bundles = Bundletool::new(&toolchain);
    let signer = ApkSigner::new(&toolchain);
    let loader = CargoLoaderBuilder::new(layout.clone(), &toolchain);
    let packer = PackerBinary::new(&layout);
    let pipeline = Pipeline::new(
        settings,
        layout,
        Collaborators {
            codec: &codec,
            bundles: &bundles,
            signer: &signer,
            fingerprints: &keytool,
            loader: &loader,
            packer: &packer,
        },
    );

    let request = PackRequest {
        target,
        output: resolved.path,
        container: resolved.container,
        keep,
        signing,
        sign: !(args.no_sign || file.no_sign),
        skip_build: args.skip_build || file.skip_build,
        strict_integrity: args.require_signature_hash || file.require_signature_hash,
    };
    pipeline.run(&request)?;
    Ok(())
}

fn check_layout(args: CheckArgs) -> anyhow::Result<()> {
    if !args.apk.exists() {
        bail!("APK does not exist: {}", args.apk.display());
    }
    let rules = LayoutRules {
        required_entries: args.require_entries,
        forbidden_libs: args.forbid_libs,
        min_plaintext_dex: args.min_plaintext_dex,
        max_plaintext_dex: args.max_plaintext_dex,
    };
    let violations = check::check(&args.apk, &rules)?;
    if violations.is_empty() {
        info!("[OK] Hardened APK layout check passed: {}", args.apk.display());
        return Ok(());
    }
    for violation in &violations {
        error!("[FAIL] {violation}");
    }
    bail!("{} layout violation(s) in {}", violations.len(), args.apk.display())
}

fn prune_cache(settings: &Settings, max_entries: Option<usize>, ttl_secs: Option<u64>) -> anyhow::Result<()> {
    let cache = ManifestCache::new(&settings.cache.dir);
    let removed = cache.prune(
        max_entries.unwrap_or(settings.cache.max_entries),
        ttl_secs.map(Duration::from_secs).unwrap_or(settings.cache.ttl),
        SystemTime::now(),
        &[],
    )?;
    info!(
        "Removed {} manifest cache entries from {}",
        removed.len(),
        cache.root().display()
    );
    Ok(())
}
