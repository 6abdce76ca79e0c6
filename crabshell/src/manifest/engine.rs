use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::patch::{self, PatchDirectives};
use super::resources::load_string_table;
use super::xml::Document;
use crate::error::{Error, Result};
use crate::process::run_checked;
use crate::toolchain::Toolchain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Full,
    /// Decoded with `-r`; resources were left binary.
    NoResources,
}

/// Binary-XML codec collaborator.
pub trait ManifestCodec {
    fn decode(&self, archive: &Path, out_dir: &Path, mode: DecodeMode) -> Result<()>;
    fn build(&self, decoded_dir: &Path, out_archive: &Path) -> Result<()>;
}

pub struct Apktool<'a> {
    toolchain: &'a Toolchain,
}

impl<'a> Apktool<'a> {
    pub fn new(toolchain: &'a Toolchain) -> Self {
        Apktool { toolchain }
    }
}

impl ManifestCodec for Apktool<'_> {
    fn decode(&self, archive: &Path, out_dir: &Path, mode: DecodeMode) -> Result<()> {
        let mut command = self.toolchain.apktool()?;
        command.args(["d", "-f"]);
        let action = match mode {
            DecodeMode::Full => "apktool decode",
            DecodeMode::NoResources => {
                command.arg("-r");
                "apktool decode (-r)"
            }
        };
        command.arg(archive).arg("-o").arg(out_dir);
        run_checked(&mut command, action).map(drop)
    }

    fn build(&self, decoded_dir: &Path, out_archive: &Path) -> Result<()> {
        let mut command = self.toolchain.apktool()?;
        command.arg("b").arg(decoded_dir).arg("-o").arg(out_archive);
        run_checked(&mut command, "apktool build").map(drop)
    }
}

#[derive(Debug, Clone)]
pub struct DecodedManifest {
    pub dir: PathBuf,
    pub mode: DecodeMode,
}

/// Binary manifest ready to be packed, plus what it replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedManifest {
    pub manifest: Vec<u8>,
    /// Rebuilt `resources.arsc`, only in rebuilt-resources mode.
    pub resources: Option<Vec<u8>>,
    pub original_application: String,
    pub original_factory: Option<String>,
}

pub struct PatchEngine<'a> {
    codec: &'a dyn ManifestCodec,
    directives: PatchDirectives,
    use_rebuilt_resources: bool,
}

impl<'a> PatchEngine<'a> {
    pub fn new(
        codec: &'a dyn ManifestCodec,
        directives: PatchDirectives,
        use_rebuilt_resources: bool,
    ) -> Self {
        PatchEngine {
            codec,
            directives,
            use_rebuilt_resources,
        }
    }

    /// Full decode, falling back once to a decode without resources.
    pub fn decode(&self, target: &Path, out_dir: &Path) -> Result<DecodedManifest> {
        info!("Decoding target APK with apktool...");
        let full = match self.codec.decode(target, out_dir, DecodeMode::Full) {
            Ok(()) => {
                return Ok(DecodedManifest {
                    dir: out_dir.to_path_buf(),
                    mode: DecodeMode::Full,
                })
            }
            Err(error) => error,
        };
        warn!("apktool full decode failed, retrying with -r (no resources). reason={full}");

        self.codec
            .decode(target, out_dir, DecodeMode::NoResources)
            .map_err(|error| Error::DecodeFailure {
                target: target.to_path_buf(),
                source: Box::new(error),
            })?;
        Ok(DecodedManifest {
            dir: out_dir.to_path_buf(),
            mode: DecodeMode::NoResources,
        })
    }

    /// Patches the decoded manifest in place, rebuilds it with the codec and
    /// pulls the binary manifest back out. `work_dir` receives the
    /// manifest-only archive.
    pub fn patch(&self, decoded: &DecodedManifest, work_dir: &Path) -> Result<PatchedManifest> {
        info!("Patching decoded AndroidManifest.xml...");
        let manifest_path = decoded.dir.join("AndroidManifest.xml");
        let source = fs::read_to_string(&manifest_path)?;
        let mut document = Document::parse(&source)
            .map_err(|error| Error::ManifestInvalid(error.to_string()))?;

        let strings = match decoded.mode {
            DecodeMode::Full => Some(load_string_table(&decoded.dir.join("res"))),
            DecodeMode::NoResources => None,
        };
        let outcome = patch::apply(&mut document, &self.directives, strings.as_ref())?;
        fs::write(&manifest_path, document.to_xml()?)?;

        info!("Rebuilding decoded APK with apktool to get patched binary AndroidManifest.xml...");
        let built = work_dir.join("manifest-only.apk");
        self.codec.build(&decoded.dir, &built)?;

        let mut archive = zip::ZipArchive::new(File::open(&built)?)?;
        let manifest = read_entry(&mut archive, "AndroidManifest.xml")?.ok_or_else(|| {
            Error::InvalidArtifact {
                path: built.clone(),
                reason: "rebuilt archive has no AndroidManifest.xml".to_string(),
            }
        })?;

        let resources = match (self.use_rebuilt_resources, decoded.mode) {
            (false, _) => {
                info!("Preserving original target resources.arsc (skip rebuilt resources replacement).");
                None
            }
            (true, DecodeMode::NoResources) => {
                warn!("Resources were not decoded; keeping original resources.arsc.");
                None
            }
            (true, DecodeMode::Full) => {
                let resources = read_entry(&mut archive, "resources.arsc")?;
                if resources.is_none() {
                    warn!("resources.arsc not found in rebuilt APK.");
                }
                resources
            }
        };

        Ok(PatchedManifest {
            manifest,
            resources,
            original_application: outcome.original_application,
            original_factory: outcome.original_factory,
        })
    }

    pub fn decode_and_patch(&self, target: &Path, work_dir: &Path) -> Result<PatchedManifest> {
        let decoded = self.decode(target, &work_dir.join("target_decoded"))?;
        self.patch(&decoded, work_dir)
    }
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Write;

    use crate::manifest::patch::SHELL_APPLICATION;

    /// Writes a canned decoded tree on `decode` and zips the decoded
    /// manifest text on `build`, which is enough to observe the patch.
    pub(crate) struct FakeCodec {
        pub manifest: String,
        pub fail_full_decode: bool,
        pub fail_degraded_decode: bool,
        pub rebuilt_resources: Option<Vec<u8>>,
        pub calls: RefCell<Vec<String>>,
    }

    impl FakeCodec {
        pub(crate) fn new(manifest: &str) -> Self {
            FakeCodec {
                manifest: manifest.to_string(),
                fail_full_decode: false,
                fail_degraded_decode: false,
                rebuilt_resources: None,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ManifestCodec for FakeCodec {
        fn decode(&self, _archive: &Path, out_dir: &Path, mode: DecodeMode) -> Result<()> {
            self.calls.borrow_mut().push(format!("decode {mode:?}"));
            let fail = match mode {
                DecodeMode::Full => self.fail_full_decode,
                DecodeMode::NoResources => self.fail_degraded_decode,
            };
            if fail {
                return Err(Error::Config(format!("decode {mode:?} refused")));
            }
            fs::create_dir_all(out_dir.join("res/values"))?;
            fs::write(out_dir.join("AndroidManifest.xml"), &self.manifest)?;
            fs::write(
                out_dir.join("res/values/strings.xml"),
                r#"<resources><string name="channel">play</string></resources>"#,
            )?;
            Ok(())
        }

        fn build(&self, decoded_dir: &Path, out_archive: &Path) -> Result<()> {
            self.calls.borrow_mut().push("build".to_string());
            let manifest = fs::read(decoded_dir.join("AndroidManifest.xml"))?;
            let mut writer = zip::ZipWriter::new(File::create(out_archive)?);
            let options = zip::write::FileOptions::default();
            writer.start_file("AndroidManifest.xml", options)?;
            writer.write_all(&manifest)?;
            if let Some(resources) = &self.rebuilt_resources {
                writer.start_file("resources.arsc", options)?;
                writer.write_all(resources)?;
            }
            writer.finish()?;
            Ok(())
        }
    }

    pub(crate) const TARGET: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example">
    <application android:name="com.example.App">
        <meta-data android:name="channel" android:value="@string/channel"/>
    </application>
</manifest>"#;

    #[test]
    fn decoded_manifest_round_trips_through_the_codec() {
        let work = tempfile::tempdir().unwrap();
        let codec = FakeCodec::new(TARGET);
        let engine = PatchEngine::new(&codec, PatchDirectives::default(), false);

        let patched = engine
            .decode_and_patch(Path::new("target.apk"), work.path())
            .unwrap();

        assert_eq!(patched.original_application, "com.example.App");
        assert_eq!(patched.resources, None);
        let text = String::from_utf8(patched.manifest).unwrap();
        let document = Document::parse(&text).unwrap();
        let application = document.root.child("application").unwrap();
        assert_eq!(application.attr("android:name"), Some(SHELL_APPLICATION));
        assert!(text.contains("com.example.kapp-bootstrap"));
        assert!(text.contains("android:value=\"play\""));
        assert_eq!(*codec.calls.borrow(), vec!["decode Full", "build"]);
    }

    #[test]
    fn degraded_decode_skips_string_inlining_and_resources() {
        let work = tempfile::tempdir().unwrap();
        let mut codec = FakeCodec::new(TARGET);
        codec.fail_full_decode = true;
        codec.rebuilt_resources = Some(b"ARSC".to_vec());
        let engine = PatchEngine::new(&codec, PatchDirectives::default(), true);

        let patched = engine
            .decode_and_patch(Path::new("target.apk"), work.path())
            .unwrap();

        assert_eq!(patched.resources, None);
        let text = String::from_utf8(patched.manifest).unwrap();
        assert!(text.contains("@string/channel"));
        assert_eq!(
            *codec.calls.borrow(),
            vec!["decode Full", "decode NoResources", "build"]
        );
    }

    #[test]
    fn rebuilt_resources_are_extracted_when_enabled() {
        let work = tempfile::tempdir().unwrap();
        let mut codec = FakeCodec::new(TARGET);
        codec.rebuilt_resources = Some(b"ARSC".to_vec());
        let engine = PatchEngine::new(&codec, PatchDirectives::default(), true);

        let patched = engine
            .decode_and_patch(Path::new("target.apk"), work.path())
            .unwrap();
        assert_eq!(patched.resources.as_deref(), Some(&b"ARSC"[..]));
    }

    #[test]
    fn failing_degraded_decode_is_a_decode_failure() {
        let work = tempfile::tempdir().unwrap();
        let mut codec = FakeCodec::new(TARGET);
        codec.fail_full_decode = true;
        codec.fail_degraded_decode = true;
        let engine = PatchEngine::new(&codec, PatchDirectives::default(), false);

        let error = engine
            .decode_and_patch(Path::new("target.apk"), work.path())
            .unwrap_err();
        assert!(matches!(error, Error::DecodeFailure { .. }));
        assert!(!codec.calls.borrow().contains(&"build".to_string()));
    }

    #[test]
    fn manifest_without_package_is_invalid() {
        let work = tempfile::tempdir().unwrap();
        let codec = FakeCodec::new(&TARGET.replace(" package=\"com.example\"", ""));
        let engine = PatchEngine::new(&codec, PatchDirectives::default(), false);

        let error = engine
            .decode_and_patch(Path::new("target.apk"), work.path())
            .unwrap_err();
        assert!(matches!(error, Error::ManifestInvalid(_)));
    }
}
