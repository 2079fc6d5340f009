//! Interfaces between the controller and the USB function above it

use crate::{
    control::SetupPacket,
    endpoint::EndpointDescriptor,
    error::Error,
    request::{Rejected, Request, RequestId},
    Speed,
};
use usb_device::endpoint::EndpointAddress;

/// The controller, as seen by a USB function.
///
/// [`Controller`](crate::Controller) implements `Udc`. Completion
/// callbacks and [`Gadget`] upcalls receive a `&dyn Udc`, so they can
/// queue more work while the controller is dispatching events.
pub trait Udc {
    /// Configure and enable an endpoint.
    ///
    /// Fails if the descriptor doesn't describe `address`, or if it
    /// describes an isochronous endpoint. Endpoint 0 is always enabled.
    fn enable_endpoint(
        &self,
        address: EndpointAddress,
        descriptor: &EndpointDescriptor,
    ) -> Result<(), Error>;

    /// Disable an endpoint, and complete its requests with
    /// [`Error::Shutdown`].
    fn disable_endpoint(&self, address: EndpointAddress) -> Result<(), Error>;

    /// Queue a request on an endpoint.
    ///
    /// Requests on one endpoint complete in the order they're queued.
    fn queue(&self, address: EndpointAddress, request: Request) -> Result<(), Rejected>;

    /// Complete a queued request with [`Error::ConnectionReset`].
    ///
    /// This doesn't stop a transfer that the controller already started.
    fn dequeue(&self, address: EndpointAddress, id: RequestId) -> Result<(), Error>;

    /// Stall (`true`) or un-stall (`false`) an endpoint.
    fn set_halt(&self, address: EndpointAddress, halt: bool) -> Result<(), Error>;

    /// Make a request that transfers `buffer`.
    fn alloc_request(&self, buffer: &'static mut [u8]) -> Request;

    /// Take the buffer back from a request.
    fn free_request(&self, request: Request) -> &'static mut [u8];

    /// Returns the speed negotiated with the host, once connected.
    fn speed(&self) -> Option<Speed>;
}

/// A USB function, driven by the controller.
///
/// Only [`setup`](Gadget::setup) is required. The other upcalls do
/// nothing by default.
pub trait Gadget: Sync {
    /// Handle a control request that the controller doesn't answer itself.
    ///
    /// Queue the data stage, if any, on endpoint 0 in the request's
    /// direction. Return an error to stall endpoint 0.
    fn setup(&self, udc: &dyn Udc, packet: &SetupPacket) -> Result<(), Error>;

    /// The host disconnected.
    fn disconnect(&self, udc: &dyn Udc) {
        let _ = udc;
    }

    /// The host reset the bus. Non-control endpoints are disabled.
    fn reset(&self, udc: &dyn Udc) {
        let _ = udc;
    }

    /// The link suspended.
    fn suspend(&self, udc: &dyn Udc) {
        let _ = udc;
    }

    /// The link resumed after a suspend.
    fn resume(&self, udc: &dyn Udc) {
        let _ = udc;
    }
}
