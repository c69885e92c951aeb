use std::env;

fn main() {
    if let Err(e) = run() {
        // Header generation never fails the build.
        println!("cargo:warning=ocr-cache-engine header generation skipped: {}", e);
    }
}

fn run() -> Result<(), String> {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").map_err(|_| "CARGO_MANIFEST_DIR not set".to_string())?;

    let config = cbindgen::Config::from_file(format!("{}/cbindgen.toml", crate_dir))
        .map_err(|e| format!("Failed to load cbindgen config: {}", e))?;

    let out_dir = env::var("OUT_DIR").map_err(|_| "OUT_DIR not set".to_string())?;

    cbindgen::generate_with_config(&crate_dir, config)
        .map_err(|e| format!("Failed to generate C bindings: {}", e))?
        .write_to_file(format!("{}/ocr_cache.h", out_dir));

    println!("cargo:rerun-if-changed=cbindgen.toml");
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/buffer.rs");

    Ok(())
}
