// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler for bare-metal kernel images
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std, feature `panic_handler`)
//! DEPENDS_ON: log::emit_raw
//! INVARIANTS: No allocation; never blocks on the log sink; never returns

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    match info.location() {
        Some(at) => crate::log::emit_raw(format_args!(
            "\nPANIC: kernel panic at {}:{}: {}",
            at.file(),
            at.line(),
            info.message()
        )),
        None => crate::log::emit_raw(format_args!("\nPANIC: kernel panic: {}", info.message())),
    };
    loop {
        core::hint::spin_loop();
    }
}
