use std::env;
use std::fs;
use std::path::PathBuf;

// `src/config.rs` is generated per build by `crabshell pack` and never
// committed. Seed it from the all-zero template so a plain `cargo build`
// works on a fresh checkout.
fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let src_dir = PathBuf::from(manifest_dir).join("src");
    let generated = src_dir.join("config.rs");
    let template = src_dir.join("config.defaults.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", template.display());
    println!("cargo:rerun-if-changed={}", generated.display());

    if generated.exists() {
        return;
    }
    fs::copy(&template, &generated).unwrap_or_else(|error| {
        panic!(
            "cannot seed {} from {}: {error}",
            generated.display(),
            template.display()
        )
    });
    println!("cargo:warning=config.rs seeded with an all-zero key; run `crabshell pack` to generate real key material");
}
