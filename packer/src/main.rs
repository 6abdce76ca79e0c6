use std::collections::HashSet;
use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser};
use env_logger::{Env, Target};
use log::{debug, info, warn};
use zip::ZipArchive;

// Generated by `crabshell pack`; seeded from config.defaults.rs by build.rs.
#[allow(dead_code)]
mod config;
mod payload;
mod repack;

use payload::KeepRules;
use repack::{Bootstrap, Overrides};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("payload").args(["payload_out", "payload_in"])))]
struct Args {
    #[arg(short, long)]
    target: PathBuf,

    /// Hardened APK; not needed with --payload-out
    #[arg(short, long, required_unless_present = "payload_out")]
    output: Option<PathBuf>,

    #[arg(long)]
    bootstrap_apk: PathBuf,

    #[arg(long)]
    bootstrap_lib_dir: PathBuf,

    #[arg(long)]
    patched_manifest: Option<PathBuf>,

    #[arg(long)]
    resources: Option<PathBuf>,

    #[arg(long = "keep-class")]
    keep_class: Vec<String>,

    #[arg(long = "keep-prefix")]
    keep_prefix: Vec<String>,

    /// Library name without `lib`/`.so` (both spellings accepted)
    #[arg(long = "keep-lib")]
    keep_lib: Vec<String>,

    /// Glob of assets to encrypt, e.g. `assets/*.js`
    #[arg(long = "encrypt-asset")]
    encrypt_asset: Vec<String>,

    /// Write only the encrypted payload blob here
    #[arg(long)]
    payload_out: Option<PathBuf>,

    /// Repack around a blob written earlier with --payload-out
    #[arg(long)]
    payload_in: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stdout)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let args = Args::parse();
    let rules = KeepRules::new(&args.keep_class, &args.keep_prefix, &args.keep_lib, &args.encrypt_asset)?;
    info!("Keep descriptors: {:?}", rules.descriptors);
    info!("Keep prefixes: {:?}", rules.prefixes);
    info!("Keep libs: {:?}", rules.libs);

    let mut target = ZipArchive::new(
        File::open(&args.target).with_context(|| format!("opening target {}", args.target.display()))?,
    )?;

    let (blob, encrypted) = match &args.payload_in {
        Some(path) => {
            let blob = fs::read(path).with_context(|| format!("reading payload {}", path.display()))?;
            let records = payload::parse_blob(&blob)?;
            let selected = payload::select(&mut target, &rules)?;
            payload::check_matches(&records, &selected)?;
            for record in &records {
                debug!(
                    "{}: {} bytes at {} nonce={}",
                    record.name,
                    record.size,
                    record.offset,
                    hex::encode(record.nonce)
                );
            }
            info!("Reusing payload {} ({} entries)", path.display(), records.len());
            (blob, selected)
        }
        None => {
            let key = config::get_aes_key();
            if key == [0u8; 32] {
                warn!("packer was built with the all-zero placeholder key");
            }
            let entries = payload::encrypt_entries(&mut target, &rules, &key)?;
            if entries.is_empty() {
                bail!("No classes*.dex or lib/**/*.so found in target APK");
            }
            let names = entries.iter().map(|entry| entry.name.clone()).collect();
            (payload::build_blob(&entries), names)
        }
    };

    if let Some(path) = &args.payload_out {
        fs::write(path, &blob)?;
        info!("Payload written to {} ({} bytes)", path.display(), blob.len());
        return Ok(());
    }
    let Some(output) = &args.output else {
        bail!("--output is required unless --payload-out is given");
    };

    let overrides = Overrides {
        manifest: args.patched_manifest.as_deref().map(fs::read).transpose()?,
        resources: args.resources.as_deref().map(fs::read).transpose()?,
    };
    let bootstrap = Bootstrap::load(&args.bootstrap_apk, &args.bootstrap_lib_dir)?;
    let encrypted: HashSet<String> = encrypted.into_iter().collect();

    info!(
        "Packing target {} -> {}",
        args.target.display(),
        output.display()
    );
    repack::repack(
        &mut target,
        &encrypted,
        &overrides,
        &bootstrap,
        &blob,
        File::create(output)?,
    )?;

    info!("Success! Output written to {}", output.display());
    Ok(())
}
