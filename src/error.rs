//! Engine errors

/// Errors returned by the controller, or delivered to
/// completion callbacks.
///
/// [`Shutdown`](Error::Shutdown) and [`ConnectionReset`](Error::ConnectionReset)
/// never come back from a function call. They only show up as the
/// result of a completed [`Request`](crate::Request).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The endpoint command didn't complete before its deadline.
    ///
    /// The endpoint is marked not-ready, so later commands are deferred
    /// until the hardware signals a command completion.
    #[error("endpoint command timed out")]
    CommandTimeout,
    /// The endpoint command completed with a non-zero status.
    #[error("endpoint command failed with status {0}")]
    CommandFailed(u8),
    /// The endpoint can't hold any more deferred commands.
    #[error("deferred command queue is full")]
    DeferredQueueFull,
    /// Isochronous endpoints, and control endpoints other than
    /// endpoint 0, are not supported.
    #[error("unsupported endpoint type")]
    UnsupportedEndpointType,
    /// The descriptor describes a different endpoint.
    #[error("descriptor doesn't match the endpoint")]
    MismatchedDescriptor,
    /// The endpoint doesn't exist, or the operation isn't
    /// allowed on this endpoint.
    #[error("invalid endpoint")]
    InvalidEndpoint,
    /// The endpoint isn't enabled.
    #[error("endpoint is disabled")]
    EndpointDisabled,
    /// The request buffer couldn't be made visible to the controller.
    #[error("couldn't map request buffer")]
    BufferMap,
    /// The endpoint's request queue is full.
    #[error("request queue is full")]
    QueueFull,
    /// The request isn't queued on the endpoint.
    #[error("request not found")]
    RequestNotFound,
    /// The endpoint was disabled, or the controller stopped.
    #[error("endpoint shut down")]
    Shutdown,
    /// The request was cancelled, or the bus was reset.
    #[error("connection reset")]
    ConnectionReset,
    /// The control request isn't supported, and endpoint 0 stalls.
    #[error("unsupported request")]
    Unsupported,
    /// A gadget is already bound to the controller.
    #[error("gadget already bound")]
    AlreadyBound,
    /// The controller didn't finish a reset or halt in time.
    #[error("controller timed out")]
    Timeout,
}
