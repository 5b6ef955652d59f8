//! # Ion Test Kernel Binary
//!
//! Built for `x86_64-unknown-none` this is the kernel image the bootloader
//! loads; the link layout comes from `build.rs`. On any other target it is a
//! stub that explains how to build it, so `cargo test --workspace` works.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![allow(unsafe_code)]

#[cfg(target_os = "none")]
mod boot;

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!(
        "The Ion test kernel only runs under the Ion bootloader; \
         build it with --target x86_64-unknown-none"
    );
    std::process::exit(1);
}
