//! Decode, rewrite and rebuild the target's `AndroidManifest.xml` so the
//! loader becomes the application entry point.

mod engine;
pub mod patch;
pub mod resources;
pub mod xml;

pub use engine::{Apktool, DecodeMode, DecodedManifest, ManifestCodec, PatchEngine, PatchedManifest};
pub use patch::{PatchDirectives, PatchOutcome};
