//! Two-phase, integrity-bound hardening build.
//!
//! The loader has to know the payload hash at compile time while the payload
//! is produced by the packer, which in turn embeds the loader. The build
//! therefore runs the packer twice: phase 1 only emits the encrypted payload,
//! whose hash is baked into a regenerated config before the loader is
//! rebuilt; phase 2 repacks with the very same payload.
//!
//! Every stage hands a typed value to the next one:
//! [`PreparedTarget`] -> [`PayloadBlob`] -> [`IntegrityChain`] -> [`HardenedApk`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{info, warn};

use crate::bundle::{self, BundleBuilder};
use crate::cache::{CacheKeyOptions, Lookup, ManifestCache};
use crate::error::{Error, Result};
use crate::loader::{LoaderBuilder, PackerInvocation, PackerRunner, PayloadMode, ProjectLayout};
use crate::manifest::{ManifestCodec, PatchDirectives, PatchEngine, PatchedManifest};
use crate::options::{Container, KeepLists};
use crate::secrets::{self, KeyMaterial};
use crate::settings::Settings;
use crate::signing::{FingerprintSource, Signer, SigningIdentity};
use crate::toolchain::sha256_file_bytes;

const UNIVERSAL_APK: &str = "universal_from_aab.apk";
const PATCHED_MANIFEST: &str = "AndroidManifest_patched.xml";
const REBUILT_RESOURCES: &str = "resources.arsc";
const PAYLOAD_FILE: &str = "kapp_payload.bin";
const INTERMEDIATE_APK: &str = "hardened_for_aab.apk";

/// External tools the pipeline drives.
pub struct Collaborators<'a> {
    pub codec: &'a dyn ManifestCodec,
    pub bundles: &'a dyn BundleBuilder,
    pub signer: &'a dyn Signer,
    pub fingerprints: &'a dyn FingerprintSource,
    pub loader: &'a dyn LoaderBuilder,
    pub packer: &'a dyn PackerRunner,
}

#[derive(Debug, Clone)]
pub struct PackRequest {
    pub target: PathBuf,
    /// Final artifact path, extension already matching `container`.
    pub output: PathBuf,
    pub container: Container,
    pub keep: KeepLists,
    pub signing: SigningIdentity,
    pub sign: bool,
    /// Reuse the prebuilt loader and packer, and the key they were built with.
    pub skip_build: bool,
    /// Fail instead of embedding a zero signature hash.
    pub strict_integrity: bool,
}

/// Flat target with its patched manifest written to the work dir.
#[derive(Debug, Clone)]
pub struct PreparedTarget {
    pub flat_target: PathBuf,
    /// The input bundle, when the input was one.
    pub original_bundle: Option<PathBuf>,
    pub manifest: PathBuf,
    pub resources: Option<PathBuf>,
    pub original_application: String,
    pub original_factory: Option<String>,
    pub cache: Option<Lookup>,
}

#[derive(Debug, Clone)]
pub struct PayloadBlob {
    pub path: PathBuf,
    pub sha256: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityChain {
    pub payload_sha256: [u8; 32],
    /// `None` when the certificate could not be read.
    pub signature_sha256: Option<[u8; 32]>,
}

impl IntegrityChain {
    /// What the loader is compiled against. Unknown is all zeroes.
    pub fn embedded_signature(&self) -> [u8; 32] {
        self.signature_sha256.unwrap_or([0u8; 32])
    }
}

#[derive(Debug, Clone)]
pub struct HardenedApk {
    pub path: PathBuf,
    pub signed: bool,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct PackReport {
    pub output: PathBuf,
    pub container: Container,
    pub original_application: String,
    pub integrity: IntegrityChain,
    pub cache: Option<Lookup>,
    pub signed: bool,
}

pub struct Pipeline<'a> {
    settings: &'a Settings,
    layout: ProjectLayout,
    tools: Collaborators<'a>,
    cache: Option<ManifestCache>,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a Settings, layout: ProjectLayout, tools: Collaborators<'a>) -> Self {
        let cache = settings
            .cache
            .enabled
            .then(|| ManifestCache::new(&settings.cache.dir));
        Pipeline {
            settings,
            layout,
            tools,
            cache,
        }
    }

    pub fn with_cache(mut self, cache: Option<ManifestCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn run(&self, request: &PackRequest) -> Result<PackReport> {
        let work = tempfile::Builder::new().prefix("kapp-").tempdir()?;
        let work_dir = work.path();

        let prepared = self.prepare(request, work_dir)?;

        let key = secrets::select_key(request.skip_build, &self.layout.packer_config())?;
        self.write_configs(&key, None)?;
        if !request.skip_build {
            self.tools.loader.build_packer()?;
            self.tools.loader.patch_constants(
                &prepared.original_application,
                prepared.original_factory.as_deref(),
            )?;
            self.tools.loader.build_loader()?;
        }

        let apk_output = match request.container {
            Container::Apk => request.output.clone(),
            Container::Aab => work_dir.join(INTERMEDIATE_APK),
        };
        let invocation = self.invocation(request, &prepared, &apk_output)?;

        let blob = self.generate_payload(&invocation, work_dir)?;
        let integrity = self.bind_integrity(request, &blob)?;

        self.write_configs(&key, Some(&integrity))?;
        if request.skip_build {
            warn!("--skip-build enabled: the prebuilt loader does not embed this build's integrity hashes.");
        } else {
            self.tools.loader.build_loader()?;
            self.tools.loader.build_packer()?;
        }

        let hardened = self.final_pack(&invocation, &blob)?;
        let hardened = self.sign(request, hardened)?;
        let signed = hardened.signed;
        let output = self.finish(request, &prepared, hardened)?;

        info!(
            "Done! Protected {}: {}",
            request.container.label(),
            output.display()
        );
        Ok(PackReport {
            output,
            container: request.container,
            original_application: prepared.original_application,
            integrity,
            cache: prepared.cache,
            signed,
        })
    }

    /// Flattens a bundle input and patches the manifest through the cache.
    pub fn prepare(&self, request: &PackRequest, work_dir: &Path) -> Result<PreparedTarget> {
        if !request.target.is_file() {
            return Err(Error::InvalidArtifact {
                path: request.target.clone(),
                reason: "target does not exist".to_string(),
            });
        }

        let original_bundle = bundle::is_bundle(&request.target).then(|| request.target.clone());
        if request.container == Container::Aab && original_bundle.is_none() {
            return Err(Error::Config(format!(
                "AAB output requested but {} is not a bundle",
                request.target.display()
            )));
        }
        let flat_target = match &original_bundle {
            Some(bundle) => {
                info!("Detected AAB file: {}", bundle.display());
                let apk = bundle::bundle_to_flat(
                    self.tools.bundles,
                    bundle,
                    &work_dir.join(UNIVERSAL_APK),
                    work_dir,
                )?;
                info!("Converted to: {}", apk.display());
                apk
            }
            None => request.target.clone(),
        };

        let engine = PatchEngine::new(
            self.tools.codec,
            PatchDirectives {
                provider_class: self.settings.provider_class().to_string(),
            },
            self.settings.use_rebuilt_resources,
        );
        let compute = || engine.decode_and_patch(&flat_target, work_dir);
        let (patched, lookup) = match &self.cache {
            // Keyed on the input as given, so a bundle hit skips bundletool's
            // non-deterministic universal build.
            Some(cache) => {
                let (key, patched, lookup) =
                    cache.get_or_compute(&request.target, &self.cache_options(), compute)?;
                if lookup == Lookup::Miss {
                    self.prune_cache(cache, &key);
                }
                (patched, Some(lookup))
            }
            None => (compute()?, None),
        };

        let (manifest, resources) = write_patched(&patched, work_dir)?;
        Ok(PreparedTarget {
            flat_target,
            original_bundle,
            manifest,
            resources,
            original_application: patched.original_application,
            original_factory: patched.original_factory,
            cache: lookup,
        })
    }

    fn cache_options(&self) -> CacheKeyOptions {
        CacheKeyOptions {
            use_rebuilt_resources: self.settings.use_rebuilt_resources,
            provider_override: self.settings.provider_class_override.clone(),
            salt: self.settings.cache.salt.clone(),
        }
    }

    fn prune_cache(&self, cache: &ManifestCache, keep: &str) {
        let budget = &self.settings.cache;
        match cache.prune(budget.max_entries, budget.ttl, SystemTime::now(), &[keep]) {
            Ok(removed) if !removed.is_empty() => {
                info!("Pruned {} manifest cache entries", removed.len())
            }
            Ok(_) => {}
            Err(error) => warn!("manifest cache prune failed: {error}"),
        }
    }

    /// Writes `config.rs` for both the loader and the packer.
    fn write_configs(&self, key: &KeyMaterial, integrity: Option<&IntegrityChain>) -> Result<()> {
        let payload = integrity.map(|chain| chain.payload_sha256);
        let signature = integrity.map(IntegrityChain::embedded_signature);
        for config in [self.layout.loader_config(), self.layout.packer_config()] {
            secrets::generate(&config, key, payload.as_ref(), signature.as_ref())?;
        }
        Ok(())
    }

    fn invocation(
        &self,
        request: &PackRequest,
        prepared: &PreparedTarget,
        apk_output: &Path,
    ) -> Result<PackerInvocation> {
        let bootstrap_apk = self.layout.bootstrap_apk();
        if !bootstrap_apk.is_file() {
            return Err(Error::InvalidArtifact {
                path: bootstrap_apk,
                reason: "Shell APK not found; build the loader first".to_string(),
            });
        }
        let bootstrap_lib_dir = self.layout.bootstrap_lib_dir();
        if !bootstrap_lib_dir.is_dir() {
            return Err(Error::InvalidArtifact {
                path: bootstrap_lib_dir,
                reason: "Bootstrap libs directory not found".to_string(),
            });
        }
        if let Some(parent) = apk_output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        Ok(PackerInvocation {
            target: prepared.flat_target.clone(),
            output: apk_output.to_path_buf(),
            bootstrap_apk,
            bootstrap_lib_dir,
            patched_manifest: prepared.manifest.clone(),
            resources: prepared.resources.clone(),
            keep_classes: request.keep.classes.clone(),
            keep_prefixes: request.keep.prefixes.clone(),
            keep_libs: request.keep.libs.clone(),
            encrypt_assets: request.keep.encrypt_assets.clone(),
        })
    }

    /// Phase 1: encrypted payload only.
    fn generate_payload(&self, invocation: &PackerInvocation, work_dir: &Path) -> Result<PayloadBlob> {
        info!(
            "Packing {} using target-preserving mode...",
            invocation.target.display()
        );
        info!("Phase 1: Generating payload for hashing...");
        let path = work_dir.join(PAYLOAD_FILE);
        self.tools
            .packer
            .run(invocation, &PayloadMode::Out(path.clone()))?;
        if !path.is_file() {
            return Err(Error::InvalidArtifact {
                path,
                reason: "packer did not write the payload".to_string(),
            });
        }
        let sha256 = sha256_file_bytes(&path)?;
        info!("Payload hash: {}", hex::encode(sha256));
        Ok(PayloadBlob { path, sha256 })
    }

    fn bind_integrity(&self, request: &PackRequest, blob: &PayloadBlob) -> Result<IntegrityChain> {
        let signature_sha256 = match self.tools.fingerprints.certificate_sha256(&request.signing) {
            Ok(fingerprint) => fingerprint,
            Err(error) => {
                warn!("Failed to get signature hash from keystore: {error}");
                None
            }
        };
        match signature_sha256 {
            Some(fingerprint) => info!("Signature hash: {}", hex::encode(fingerprint)),
            None if request.strict_integrity => {
                return Err(Error::IntegrityUnknown(format!(
                    "no SHA-256 certificate fingerprint for {}",
                    request.signing.keystore.display()
                )))
            }
            None => warn!("Could not determine signature hash. Using dummy value."),
        }
        Ok(IntegrityChain {
            payload_sha256: blob.sha256,
            signature_sha256,
        })
    }

    /// Phase 2: repack around the phase 1 payload.
    fn final_pack(&self, invocation: &PackerInvocation, blob: &PayloadBlob) -> Result<HardenedApk> {
        info!("Phase 2: Final packing...");
        self.tools
            .packer
            .run(invocation, &PayloadMode::In(blob.path.clone()))?;
        if !invocation.output.is_file() {
            return Err(Error::InvalidArtifact {
                path: invocation.output.clone(),
                reason: "packer did not write the hardened APK".to_string(),
            });
        }
        Ok(HardenedApk {
            path: invocation.output.clone(),
            signed: false,
        })
    }

    fn sign(&self, request: &PackRequest, apk: HardenedApk) -> Result<HardenedApk> {
        if !request.sign {
            match request.container {
                Container::Aab => warn!(
                    "Skipping signing (--no-sign). Intermediate APK may be unsigned before AAB conversion."
                ),
                Container::Apk => warn!("Skipping signing (--no-sign). Output APK may fail to install."),
            }
            return Ok(apk);
        }
        self.tools.signer.sign(&apk.path, &request.signing)?;
        Ok(HardenedApk {
            signed: true,
            ..apk
        })
    }

    /// Moves the hardened flat package into the requested container.
    fn finish(&self, request: &PackRequest, prepared: &PreparedTarget, apk: HardenedApk) -> Result<PathBuf> {
        match (request.container, &prepared.original_bundle) {
            (Container::Apk, _) => Ok(apk.path),
            (Container::Aab, Some(original)) => {
                if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                bundle::flat_to_bundle(&apk.path, original, &request.output)?;
                info!("Created hardened AAB: {}", request.output.display());
                Ok(request.output.clone())
            }
            (Container::Aab, None) => Err(Error::Config(
                "AAB output requires the original bundle".to_string(),
            )),
        }
    }
}

fn write_patched(patched: &PatchedManifest, work_dir: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
    let manifest = work_dir.join(PATCHED_MANIFEST);
    fs::write(&manifest, &patched.manifest)?;
    let resources = match &patched.resources {
        Some(bytes) => {
            let path = work_dir.join(REBUILT_RESOURCES);
            fs::write(&path, bytes)?;
            Some(path)
        }
        None => None,
    };
    Ok((manifest, resources))
}
