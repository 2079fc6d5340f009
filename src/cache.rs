//! D-cache maintenance for DMA buffers
//!
//! [`Mmio`](crate::Mmio) cleans and invalidates the lines that cover a
//! buffer before and after the controller touches it. The routine follows
//! the cortex-m crate's `SCB` method, which we can't call without owning
//! the SCB.
//!
//! cortex-m crate available at <https://github.com/rust-embedded/cortex-m>.

/// Cache lines are 32 bytes on the Cortex-M7, and absent on earlier cores.
const LINE_SIZE: usize = 32;

/// Clean and invalidate every D-cache line that holds part of
/// `size` bytes starting at `addr`.
///
/// Dirty lines go back to memory before they're dropped, so the next CPU
/// read fetches what the controller wrote. Neighboring data that shares a
/// line is cleaned too; keep DMA buffers line aligned.
pub fn clean_invalidate_dcache_by_address(addr: usize, size: usize) {
    if size == 0 {
        return;
    }

    // Safety: write-only registers, pointer to static memory
    let cbp = unsafe { &*cortex_m::peripheral::CBP::PTR };

    cortex_m::asm::dsb();

    let first = addr & !(LINE_SIZE - 1);
    let end = addr + size;
    for line in (first..end).step_by(LINE_SIZE) {
        // Safety: write to Cortex-M write-only register
        unsafe { cbp.dccimvac.write(line as u32) };
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}
