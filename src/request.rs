//! I/O requests
//!
//! A [`Request`] owns its buffer. Queueing a request moves it into the
//! endpoint; completion moves it back to the caller through the
//! completion callback.

use core::fmt;

use crate::{error::Error, gadget::Udc};
use usb_device::endpoint::EndpointAddress;

/// Called when a request completes.
///
/// The callback receives the controller, so it can queue the request
/// again, or queue others.
pub type Complete = fn(&dyn Udc, EndpointAddress, Request);

/// Identifies a request, so it can be dequeued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u32);

/// Where a request is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Not queued yet.
    Idle,
    /// Queued on an endpoint.
    InProgress,
    /// Completed with a result.
    Complete(Result<(), Error>),
}

/// Who handles a request's completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    Gadget,
    Setup,
    Reply,
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mapping {
    None,
    /// Mapped by the engine for the request's time on the queue.
    Engine(u64),
    /// Mapped by the caller.
    Caller(u64),
}

/// A buffer transfer on one endpoint.
///
/// Get requests from [`Udc::alloc_request`]. A new request transfers the
/// whole buffer; use [`set_length`](Request::set_length) to transfer less.
///
/// OUT transfers are rounded up to a multiple of the endpoint's max
/// packet size, and the rounded length must fit in the buffer. The
/// reported [`actual`](Request::actual) length never exceeds the
/// requested length.
pub struct Request {
    buffer: &'static mut [u8],
    length: usize,
    actual: usize,
    status: Status,
    complete: Option<Complete>,
    context: usize,
    id: RequestId,
    pub(crate) origin: Origin,
    mapping: Mapping,
    mapped_len: usize,
}

impl Request {
    pub(crate) fn new(buffer: &'static mut [u8], id: RequestId) -> Self {
        Request {
            length: buffer.len(),
            buffer,
            actual: 0,
            status: Status::Idle,
            complete: None,
            context: 0,
            id,
            origin: Origin::Gadget,
            mapping: Mapping::None,
            mapped_len: 0,
        }
    }

    /// A request the engine sends on endpoint 0 for itself.
    pub(crate) fn internal(
        buffer: &'static mut [u8],
        length: usize,
        origin: Origin,
        id: RequestId,
    ) -> Self {
        let mut request = Self::new(buffer, id);
        request.set_length(length);
        request.origin = origin;
        request
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Bytes to transfer.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Set the number of bytes to transfer.
    ///
    /// The length is limited to the buffer's size.
    pub fn set_length(&mut self, length: usize) {
        self.length = length.min(self.buffer.len());
    }

    /// Bytes transferred.
    pub fn actual(&self) -> usize {
        self.actual
    }

    pub(crate) fn set_actual(&mut self, actual: usize) {
        self.actual = actual.min(self.length);
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns the completion result, if the request completed.
    pub fn result(&self) -> Option<Result<(), Error>> {
        match self.status {
            Status::Complete(result) => Some(result),
            _ => None,
        }
    }

    pub fn set_complete(&mut self, complete: Complete) {
        self.complete = Some(complete);
    }

    /// A word for the caller. The engine doesn't use it.
    pub fn context(&self) -> usize {
        self.context
    }

    pub fn set_context(&mut self, context: usize) {
        self.context = context;
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer[..]
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }

    /// The bytes that were transferred.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual]
    }

    /// Use a DMA address that the caller already mapped.
    ///
    /// The engine synchronizes the buffer instead of mapping it.
    ///
    /// # Safety
    ///
    /// `dma` must be the controller's address for this request's buffer,
    /// and the mapping must outlive every transfer of this request.
    pub unsafe fn set_premapped(&mut self, dma: u64) {
        self.mapping = Mapping::Caller(dma);
    }

    /// Release the request's buffer.
    pub fn into_buffer(self) -> &'static mut [u8] {
        self.buffer
    }

    pub(crate) fn complete_fn(&self) -> Option<Complete> {
        self.complete
    }

    /// Reset the request for a trip through the queue.
    pub(crate) fn start(&mut self) {
        self.status = Status::InProgress;
        self.actual = 0;
    }

    /// Record the result. The first error wins.
    pub(crate) fn finish(&mut self, result: Result<(), Error>) {
        if self.status == Status::InProgress {
            self.status = Status::Complete(result);
        }
    }

    /// The buffer address the controller uses, once mapped.
    pub(crate) fn dma(&self) -> Option<u64> {
        match self.mapping {
            Mapping::None => None,
            Mapping::Engine(dma) | Mapping::Caller(dma) => Some(dma),
        }
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    pub(crate) fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn is_premapped(&self) -> bool {
        matches!(self.mapping, Mapping::Caller(_))
    }

    pub(crate) fn set_mapped(&mut self, dma: u64, len: usize) {
        if !self.is_premapped() {
            self.mapping = Mapping::Engine(dma);
        }
        self.mapped_len = len;
    }

    /// Returns the mapping to release, if the engine made one.
    pub(crate) fn take_mapping(&mut self) -> Option<(u64, usize, bool)> {
        let len = core::mem::take(&mut self.mapped_len);
        match self.mapping {
            Mapping::None => None,
            Mapping::Engine(dma) => {
                self.mapping = Mapping::None;
                Some((dma, len, true))
            }
            Mapping::Caller(dma) => Some((dma, len, false)),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("length", &self.length)
            .field("actual", &self.actual)
            .field("status", &self.status)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// A request that the controller refused to queue.
///
/// The request comes back to the caller with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    pub request: Request,
}
