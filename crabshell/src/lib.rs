//! Build-time hardening of Android packages and bundles.
//!
//! The target's manifest is rewritten so the CrabShell loader becomes the
//! entry point, its code is encrypted into a payload by the packer, and the
//! payload and signing certificate hashes are compiled into the loader
//! before the final repack and signing.

pub mod bundle;
pub mod cache;
pub mod check;
mod error;
pub mod loader;
pub mod manifest;
pub mod options;
pub mod pipeline;
pub mod process;
pub mod retry;
pub mod secrets;
pub mod settings;
pub mod signing;
pub mod toolchain;

pub use error::{Error, Result};
