//! A device-mode driver for DWC3 USB 3 controllers
//!
//! `dwc3-udc` runs the device side of a DWC3 controller: it configures
//! endpoints, moves request buffers through transfer request blocks
//! (TRBs), drives the endpoint 0 control state machine, and turns the
//! controller's event buffer into calls on your [`Gadget`].
//!
//! To use the driver,
//!
//! 1. allocate [`ControllerMemory`] in static memory.
//! 2. describe your platform with an implementation of [`Hardware`]. Memory
//!    mapped controllers on Cortex-M systems can use [`Mmio`] with a safe
//!    implementation of [`Peripherals`].
//! 3. create, initialize, and start a [`Controller`], then call
//!    [`Controller::handle_interrupt`] from the USB interrupt.
//!
//! Gadgets use the [`Udc`] interface to enable endpoints, and to queue
//! [`Request`]s.
//!
//! ```no_run
//! use dwc3_udc::{Config, Controller, ControllerMemory, Error, Gadget, SetupPacket, Udc};
//! # struct Instance; unsafe impl dwc3_udc::Peripherals for Instance { fn dwc3(&self) -> *const () { 0x3110_0000 as *const () } }
//! # fn now_us() -> u64 { 0 }
//!
//! static MEMORY: ControllerMemory = ControllerMemory::new();
//!
//! struct Function;
//! impl Gadget for Function {
//!     fn setup(&self, _: &dyn Udc, _: &SetupPacket) -> Result<(), Error> {
//!         Err(Error::Unsupported)
//!     }
//! }
//! static FUNCTION: Function = Function;
//!
//! let hw = dwc3_udc::Mmio::new(Instance, now_us);
//! let udc = Controller::new(hw, &MEMORY, Config::default());
//! udc.initialize().unwrap();
//! udc.bind(&FUNCTION).unwrap();
//! udc.start();
//! loop {
//!     udc.handle_interrupt();
//! }
//! ```

#![no_std]

#[macro_use]
mod log;

mod cache;
mod command;
mod control;
mod controller;
mod dispatch;
mod endpoint;
mod error;
mod event;
mod gadget;
mod hardware;
mod ral;
mod request;
mod state;
mod trb;

#[cfg(test)]
mod mock;

pub use control::{ExitLatency, Phase, SetupPacket};
pub use controller::{Config, Controller, Speed};
pub use endpoint::EndpointDescriptor;
pub use error::Error;
pub use event::LinkState;
pub use gadget::{Gadget, Udc};
pub use hardware::{Hardware, Mmio};
pub use request::{Complete, Rejected, Request, RequestId, Status};
pub use state::ControllerMemory;

/// Sixteen endpoints, two directions
const ENDPOINT_COUNT: usize = 16 * 2;

/// A type that owns the DWC3 register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that
/// owns the controller's registers. The pointer returned by
/// [`dwc3()`](Peripherals::dwc3) is assumed to be valid for the
/// whole register window, and will be cast to register definitions.
///
/// # Example
///
/// A safe implementation of `Peripherals` for a controller at a fixed
/// address. The instance is handed out once.
///
/// ```
/// use core::sync::atomic::{AtomicBool, Ordering};
/// use dwc3_udc::Peripherals;
///
/// struct Usb3 {
///     _private: (),
/// }
///
/// impl Usb3 {
///     const ADDRESS: usize = 0x3110_0000;
///
///     /// Returns `None` if the instance is already taken
///     pub fn take() -> Option<Usb3> {
///         static TAKEN: AtomicBool = AtomicBool::new(false);
///         (!TAKEN.swap(true, Ordering::SeqCst)).then_some(Usb3 { _private: () })
///     }
/// }
///
/// unsafe impl Peripherals for Usb3 {
///     fn dwc3(&self) -> *const () {
///         Self::ADDRESS as *const ()
///     }
/// }
///
/// let usb3 = Usb3::take().unwrap();
/// assert_eq!(usb3.dwc3(), 0x3110_0000 as *const ());
/// assert!(Usb3::take().is_none());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the DWC3 register window
    /// for this peripheral instance
    fn dwc3(&self) -> *const ();
}
