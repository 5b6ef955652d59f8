//! # Ion Test Kernel
//!
//! The smallest kernel that exercises the whole Ion handoff: it declares a
//! boot header (default framebuffer, unmapped null page, both request flags),
//! reserves its stacks in `.bss`, and in `ion_main` walks the handoff record,
//! logs what it was given to the QEMU debug console and halts.
//!
//! The bare-metal pieces (statics in `.ionhdr`, `ion_main`, the panic
//! handler) live in the binary. Everything here also builds for the host so
//! it can be tested there.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cpu;
pub mod report;
pub mod stacks;

use ion_proto::entry::{Core, EntryMachine};
use ion_proto::info::BootInfoView;
use ion_proto::list::TagMemory;
use log::{error, info};
use report::BootReport;

/// Kernel body: report the handoff record at `info_addr`, then halt for good.
pub fn run<C, M>(core: &C, mem: &M, info_addr: u64) -> !
where
    C: Core + ?Sized,
    M: TagMemory + ?Sized,
{
    EntryMachine::new(core).run(|| match BootInfoView::new(mem, info_addr) {
        Ok(view) => {
            let report = BootReport::collect(&view);
            report.log();
            info!("Nothing left to do; halting");
        }
        Err(e) => error!("Unreadable boot record at {info_addr:#x}: {e}"),
    })
}
