use ion_layout::{LayoutConfig, LinkerScript};
use std::{env, fs, path::PathBuf};

fn main() {
    let config = LayoutConfig::ion();

    if let Err(e) = config.validate() {
        panic!("invalid kernel layout: {e}");
    }
    let script = LinkerScript::render(&config).unwrap_or_else(|e| panic!("{e}"));

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let ld = out_dir.join("kernel.ld");
    fs::write(&ld, script.as_str()).expect("write linker script");

    println!("cargo:rerun-if-changed=build.rs");

    // Host builds (unit tests, the host stub binary) link normally.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        // The header's pointers must be resolved at link time; the
        // bootloader applies no relocations.
        let rustflags = env::var("CARGO_ENCODED_RUSTFLAGS").unwrap_or_default();
        assert!(
            rustflags.split('\x1f').any(|f| f.ends_with("relocation-model=static")),
            "kernel must be built with -C relocation-model=static (see .cargo/config.toml)"
        );
        println!("cargo:rustc-link-arg-bins=-T{}", ld.display());
        println!("cargo:rustc-link-arg-bins=--gc-sections");
        println!("cargo:rustc-link-arg-bins=--no-pie");
        println!("cargo:rustc-link-arg-bins=-static");
    }
}
