use std::env;

/// Image tag baked into `--version`, set by the release pipeline.
const IMAGE_VERSION_ENV: &str = "VERSION";

fn main() {
    println!("cargo:rerun-if-env-changed={IMAGE_VERSION_ENV}");
    let image_version = env::var(IMAGE_VERSION_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "latest".to_string());
    println!("cargo:rustc-env=IMAGE_VERSION={image_version}");

    // builds from a source tarball have no repository, version falls back to "unknown"
    if let Err(err) = emit_git_sha() {
        println!("cargo:warning=git metadata unavailable: {err}");
    }
}

fn emit_git_sha() -> anyhow::Result<()> {
    let git = vergen_git2::Git2Builder::default()
        .sha(true)
        .dirty(false)
        .build()?;

    vergen_git2::Emitter::default()
        .add_instructions(&git)?
        .emit()?;
    Ok(())
}
