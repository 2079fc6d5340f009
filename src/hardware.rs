//! The controller's view of the hardware
//!
//! Everything the engine needs from the platform goes through [`Hardware`]:
//! register access, a monotonic clock, and DMA buffer management.
//! [`Mmio`] implements it for memory-mapped controllers on Cortex-M
//! systems.

use crate::{cache, Peripherals};
use ral_registers::RWRegister;
use usb_device::UsbDirection;

/// Access to a DWC3 controller.
///
/// Register offsets are byte offsets from the start of the controller's
/// register window. DMA addresses are the addresses the controller uses
/// to reach memory.
///
/// The DMA methods describe transfers from the controller's point of view:
/// [`UsbDirection::In`] buffers are read by the controller, and
/// [`UsbDirection::Out`] buffers are written by the controller. The
/// defaults assume that the controller sees memory at the CPU's addresses,
/// and that there's no cache to maintain.
pub trait Hardware {
    /// Read the 32-bit register at `offset`.
    fn read(&self, offset: usize) -> u32;
    /// Write the 32-bit register at `offset`.
    fn write(&self, offset: usize, value: u32);
    /// Returns a monotonic timestamp, in microseconds.
    fn now_us(&self) -> u64;

    /// Returns the DMA address of engine-owned memory.
    fn dma_address(&self, ptr: *const u8) -> u64 {
        ptr as usize as u64
    }
    /// Make `len` bytes at `ptr` available to the controller.
    ///
    /// Returns `None` if the buffer can't be mapped.
    fn map(&self, ptr: *const u8, len: usize, direction: UsbDirection) -> Option<u64> {
        self.sync_for_device(ptr as usize as u64, len, direction);
        Some(ptr as usize as u64)
    }
    /// Release a mapping made by [`map`](Hardware::map).
    fn unmap(&self, dma: u64, len: usize, direction: UsbDirection) {
        self.sync_for_cpu(dma, len, direction);
    }
    /// Hand CPU writes over to the controller.
    fn sync_for_device(&self, _dma: u64, _len: usize, _direction: UsbDirection) {}
    /// Make controller writes visible to the CPU.
    fn sync_for_cpu(&self, _dma: u64, _len: usize, _direction: UsbDirection) {}
}

/// A memory-mapped DWC3 controller.
///
/// `Mmio` reads and writes registers through the address provided by
/// [`Peripherals`], and keeps DMA memory coherent with D-cache maintenance.
/// Supply a clock that returns microseconds since any fixed point in time.
pub struct Mmio<P> {
    peripherals: P,
    clock: fn() -> u64,
}

impl<P: Peripherals> Mmio<P> {
    /// Create a memory-mapped controller from its register block.
    pub fn new(peripherals: P, clock: fn() -> u64) -> Self {
        Mmio { peripherals, clock }
    }

    fn register(&self, offset: usize) -> &RWRegister<u32> {
        // Safety: Peripherals guarantees that the address points to the
        // DWC3 register window, and the offsets are in the window.
        unsafe {
            &*self
                .peripherals
                .dwc3()
                .cast::<u8>()
                .add(offset)
                .cast::<RWRegister<u32>>()
        }
    }
}

impl<P: Peripherals> Hardware for Mmio<P> {
    fn read(&self, offset: usize) -> u32 {
        self.register(offset).read()
    }
    fn write(&self, offset: usize, value: u32) {
        self.register(offset).write(value)
    }
    fn now_us(&self) -> u64 {
        (self.clock)()
    }
    fn sync_for_device(&self, dma: u64, len: usize, _: UsbDirection) {
        cache::clean_invalidate_dcache_by_address(dma as usize, len);
    }
    fn sync_for_cpu(&self, dma: u64, len: usize, _: UsbDirection) {
        cache::clean_invalidate_dcache_by_address(dma as usize, len);
    }
}

/// A point in time, after which a poll gives up.
pub(crate) struct Deadline {
    expires: u64,
}

impl Deadline {
    pub fn after<H: Hardware + ?Sized>(hw: &H, micros: u32) -> Self {
        Deadline {
            expires: hw.now_us().saturating_add(micros.into()),
        }
    }

    pub fn is_expired<H: Hardware + ?Sized>(&self, hw: &H) -> bool {
        hw.now_us() >= self.expires
    }
}

/// Spin until `done` returns `true`, or the deadline expires.
///
/// Returns `false` on timeout.
pub(crate) fn poll<H: Hardware + ?Sized>(hw: &H, micros: u32, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Deadline::after(hw, micros);
    loop {
        if done() {
            return true;
        }
        if deadline.is_expired(hw) {
            return false;
        }
        core::hint::spin_loop();
    }
}
