//! # Ion Boot Protocol
//!
//! This crate is the shared vocabulary between the Ion bootloader and the
//! kernels it launches. Both sides link it: the kernel to declare what it
//! needs, the bootloader to find out and to describe what it granted.
//!
//! ## Overview
//!
//! Nothing is shared at runtime. Bootloader and kernel agree only through
//! bytes placed at known locations:
//!
//! * the kernel's [`BootHeader`](header::BootHeader), alone in the `.ionhdr`
//!   section, with a linked list of request tags;
//! * the bootloader's [`BootInfo`](info::BootInfo) record, passed as the only
//!   argument to the kernel entry point, with a linked list of struct tags;
//! * the address space constants in [`memory`], which the kernel's build
//!   script bakes into the linker script and the bootloader uses to map the
//!   image.
//!
//! ## Modules
//!
//! ### Header ([`header`])
//! Kernel-side `#[repr(C)]` declarations and the bootloader-side decoder for
//! the request tags: framebuffer, any-video and unmap-null.
//!
//! ### Handoff Record ([`info`])
//! The record prefix, the struct tag identifiers and a kernel-side
//! [`BootInfoView`](info::BootInfoView) that walks it.
//!
//! ### Entry ([`entry`])
//! The entry symbol, its calling convention and the
//! `Entered → Running → Halted` lifecycle.
//!
//! ### Tag Lists ([`list`])
//! The `{id, next, payload}` framing both lists share, and a walker that
//! refuses cycles, dangling references and runaway lists.
//!
//! ### Memory Layout ([`memory`])
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Identity map (bootloader only) │ 4 GiB, page 0 optionally unmapped
//! LOWER_HALF_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │       (non-canonical)           │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │  null │ text │ rodata │ data    │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Kernel
//! ```rust,ignore
//! use ion_proto::header::{BootHeader, FramebufferTag, HeaderFlags};
//!
//! static FRAMEBUFFER: FramebufferTag = FramebufferTag::new(0, 0, 0);
//!
//! #[used]
//! #[unsafe(link_section = ".ionhdr")]
//! static HEADER: BootHeader = BootHeader::new()
//!     .stack(STACK_TOP)
//!     .flags(HeaderFlags::ALL)
//!     .tags(&raw const FRAMEBUFFER.tag);
//! ```
//!
//! ### Bootloader
//! ```rust,ignore
//! use ion_proto::header::HeaderTag;
//! use ion_proto::list::TagList;
//!
//! for raw in TagList::new(&image, header.tags) {
//!     match HeaderTag::decode(&raw?)? {
//!         HeaderTag::Framebuffer(req) => { /* pick a mode */ }
//!         HeaderTag::Unknown { .. } => continue,
//!         _ => {}
//!     }
//! }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod entry;
pub mod header;
pub mod info;
pub mod list;
pub mod memory;
