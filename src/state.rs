#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{trb::Trb, ENDPOINT_COUNT};

/// A 32-bit word shared with the controller.
///
/// All accesses are volatile. The layout matches a `u32`, so lists of
/// words can describe controller-visible structures.
#[repr(transparent)]
pub struct Word(UnsafeCell<u32>);

// Safety: accesses are single, volatile, word-sized reads and writes.
// Sequencing between the CPU and the controller is managed by the
// engine's ownership protocols (HWO bit, event count).
unsafe impl Sync for Word {}

impl Word {
    pub const fn new(value: u32) -> Self {
        Word(UnsafeCell::new(value))
    }
    pub fn read(&self) -> u32 {
        // Safety: valid, aligned pointer to our own memory.
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, value: u32) {
        // Safety: see read().
        unsafe { self.0.get().write_volatile(value) }
    }
}

/// Size of the event buffer, in bytes.
pub const EVENT_BUFFER_SIZE: usize = 4096;
const EVENT_COUNT: usize = EVENT_BUFFER_SIZE / 4;

/// Size of each endpoint 0 buffer, in bytes.
///
/// Large enough for one SuperSpeed control packet, since OUT transfers
/// are rounded up to the max packet size.
pub const EP0_BUFFER_SIZE: usize = 512;

/// One TRB for each physical endpoint.
#[repr(align(32))]
struct TrbList([Trb; ENDPOINT_COUNT]);

impl TrbList {
    const fn new() -> Self {
        const TRB: Trb = Trb::new();
        Self([TRB; ENDPOINT_COUNT])
    }
}

#[repr(align(32))]
struct EventBuffer([Word; EVENT_COUNT]);

impl EventBuffer {
    const fn new() -> Self {
        const WORD: Word = Word::new(0);
        Self([WORD; EVENT_COUNT])
    }
}

#[repr(align(32))]
struct Ep0Buffer(UnsafeCell<[u8; EP0_BUFFER_SIZE]>);

impl Ep0Buffer {
    const fn new() -> Self {
        Self(UnsafeCell::new([0; EP0_BUFFER_SIZE]))
    }
}

/// Memory shared by the controller and the engine.
///
/// Each controller needs one `ControllerMemory`. Allocate a `static` object
/// and supply it to your controller's constructor. Make sure that memory
/// is not shared across controllers; otherwise, the constructor panics.
///
/// ```
/// use dwc3_udc::ControllerMemory;
///
/// static MEMORY: ControllerMemory = ControllerMemory::new();
/// ```
///
/// The memory holds the transfer request blocks, the event buffer,
/// and the buffers that endpoint 0 uses for SETUP packets and for
/// the replies the engine sends on its own.
pub struct ControllerMemory {
    trbs: TrbList,
    events: EventBuffer,
    setup: Ep0Buffer,
    reply: Ep0Buffer,
    taken: AtomicBool,
}

unsafe impl Sync for ControllerMemory {}

impl Default for ControllerMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMemory {
    /// Allocate controller memory.
    pub const fn new() -> Self {
        Self {
            trbs: TrbList::new(),
            events: EventBuffer::new(),
            setup: Ep0Buffer::new(),
            reply: Ep0Buffer::new(),
            taken: AtomicBool::new(false),
        }
    }

    /// Take the memory.
    ///
    /// Returns `None` if the memory was already taken.
    pub(crate) fn take(&'static self) -> Option<Memory> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        // Safety: the atomic flag ensures that we only hand out
        // one mutable reference to each buffer.
        let (setup, reply) = unsafe { (&mut *self.setup.0.get(), &mut *self.reply.0.get()) };
        Some(Memory {
            trbs: &self.trbs.0,
            events: &self.events.0,
            setup,
            reply,
        })
    }
}

/// The controller's share of [`ControllerMemory`].
pub(crate) struct Memory {
    pub trbs: &'static [Trb; ENDPOINT_COUNT],
    pub events: &'static [Word],
    pub setup: &'static mut [u8],
    pub reply: &'static mut [u8],
}
