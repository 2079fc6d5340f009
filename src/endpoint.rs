//! Per-endpoint state
//!
//! An `Endpoint` tracks one physical endpoint: its configuration, its
//! request queue, its TRB, and the commands waiting for it to become
//! ready again.

use crate::{
    command::{self, Command, CommandKind, ConfigAction, EventEnable, Issued},
    error::Error,
    request::Request,
    trb::Trb,
    Hardware,
};
use heapless::{Deque, Vec};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Requests an endpoint can hold at once.
pub const QUEUE_CAPACITY: usize = 16;
/// Commands an endpoint can defer while it's not ready.
pub const DEFERRED_CAPACITY: usize = 8;

/// Produces the physical endpoint number.
pub fn physical(address: EndpointAddress) -> usize {
    (address.index() * 2) + (UsbDirection::In == address.direction()) as usize
}

/// Produces the endpoint address of a physical endpoint.
pub fn address(physical: usize) -> EndpointAddress {
    let direction = if physical % 2 == 1 {
        UsbDirection::In
    } else {
        UsbDirection::Out
    };
    EndpointAddress::from_parts(physical / 2, direction)
}

/// Describes how to configure an endpoint.
///
/// Build one from an endpoint descriptor, and optionally a
/// SuperSpeed endpoint companion descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet_size: u16,
    /// Polling interval, as encoded in `bInterval`.
    pub interval: u8,
    /// Packets per burst, less one. From the companion descriptor.
    pub max_burst: u8,
}

impl EndpointDescriptor {
    /// Parse a 7-byte endpoint descriptor.
    ///
    /// Returns `None` if the bytes aren't an endpoint descriptor.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        const ENDPOINT: u8 = 0x05;
        let [length, descriptor_type, address, attributes, mps_lo, mps_hi, interval, ..] = *bytes
        else {
            return None;
        };
        if usize::from(length) < 7 || descriptor_type != ENDPOINT {
            return None;
        }
        let kind = match attributes & 0b11 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous {
                synchronization: usb_device::endpoint::IsochronousSynchronizationType::NoSynchronization,
                usage: usb_device::endpoint::IsochronousUsageType::Data,
            },
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        };
        Some(EndpointDescriptor {
            address: EndpointAddress::from(address),
            kind,
            max_packet_size: u16::from_le_bytes([mps_lo, mps_hi]) & 0x7FF,
            interval,
            max_burst: 0,
        })
    }

    /// Use the burst size from a SuperSpeed endpoint companion descriptor.
    pub fn with_max_burst(self, max_burst: u8) -> Self {
        EndpointDescriptor {
            max_burst: max_burst.min(15),
            ..self
        }
    }
}

pub(crate) struct Endpoint {
    address: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet: u16,
    pub max_burst: u8,
    pub interval: u8,
    pub enabled: bool,
    pub halted: bool,
    /// Set while an End Transfer is outstanding, or after a command
    /// timed out. Commands are deferred until it clears.
    pub not_ready: bool,
    /// An End Transfer is outstanding. Its command-complete event makes
    /// the endpoint ready again.
    pub ending: bool,
    /// The request at the front of the queue is on the TRB.
    pub active: bool,
    pub queue: Vec<Request, QUEUE_CAPACITY>,
    pub deferred: Deque<Command, DEFERRED_CAPACITY>,
    pub trb: &'static Trb,
    pub resource: Option<u8>,
    /// Length of the transfer on the TRB.
    pub transfer_len: u32,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, trb: &'static Trb) -> Self {
        let control = address.index() == 0;
        Endpoint {
            address,
            kind: if control {
                EndpointType::Control
            } else {
                EndpointType::Bulk
            },
            max_packet: if control { 512 } else { 0 },
            max_burst: 0,
            interval: 0,
            enabled: false,
            halted: false,
            not_ready: false,
            ending: false,
            active: false,
            queue: Vec::new(),
            deferred: Deque::new(),
            trb,
            resource: None,
            transfer_len: 0,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn physical(&self) -> usize {
        physical(self.address)
    }

    pub fn is_in(&self) -> bool {
        self.address.is_in()
    }

    /// Record the configuration from a descriptor.
    pub fn configure(&mut self, descriptor: &EndpointDescriptor) {
        self.kind = descriptor.kind;
        self.max_packet = descriptor.max_packet_size;
        self.max_burst = descriptor.max_burst;
        self.interval = descriptor.interval;
    }

    /// Bytes to hand the controller for a `length` byte request.
    ///
    /// OUT transfers are rounded up to a whole number of packets.
    pub fn transfer_length(&self, length: usize) -> usize {
        if self.is_in() || self.max_packet == 0 {
            length
        } else {
            let max_packet = usize::from(self.max_packet);
            length.div_ceil(max_packet) * max_packet
        }
    }

    /// Parameters for a Set Endpoint Configuration command.
    pub fn config_params(&self, action: ConfigAction) -> (u32, u32) {
        let kind: u32 = match self.kind {
            EndpointType::Control => 0,
            EndpointType::Isochronous { .. } => 1,
            EndpointType::Bulk => 2,
            EndpointType::Interrupt => 3,
        };
        let mut param0 = kind << 1
            | u32::from(self.max_packet) << 3
            | u32::from(self.max_burst) << 22
            | (action as u32) << 30;
        if self.is_in() {
            // One TX FIFO per IN endpoint number
            param0 |= (self.address.index() as u32) << 17;
        }

        let events = EventEnable::TRANSFER_COMPLETE | EventEnable::TRANSFER_NOT_READY;
        let mut param1 = events.bits() | (self.physical() as u32) << 25;
        if matches!(self.kind, EndpointType::Interrupt) && self.interval > 0 {
            param1 |= u32::from(self.interval - 1) << 16;
        }
        (param0, param1)
    }

    /// Send a command to the endpoint, or defer it if the endpoint isn't ready.
    ///
    /// A timeout marks the endpoint not ready. So does an End Transfer that
    /// asks for a completion event.
    pub fn send<H: Hardware + ?Sized>(
        &mut self,
        hw: &H,
        command: Command,
        timeout_us: u32,
    ) -> Result<Issued, Error> {
        if self.not_ready {
            self.deferred
                .push_back(command)
                .map_err(|_| Error::DeferredQueueFull)?;
            debug!(
                "EP{} DEFER CMD {} ({})",
                self.physical(),
                command.kind as u32,
                self.deferred.len()
            );
            return Ok(Issued::Deferred);
        }

        match command::issue(hw, self.physical(), &command, timeout_us) {
            Ok(resource) => {
                if command.kind == CommandKind::EndTransfer && command.ioc {
                    self.not_ready = true;
                    self.ending = true;
                }
                Ok(Issued::Done { resource })
            }
            Err(Error::CommandTimeout) => {
                self.not_ready = true;
                Err(Error::CommandTimeout)
            }
            Err(err) => Err(err),
        }
    }

    /// Issue every deferred command, in order.
    ///
    /// Call this once the endpoint is ready again. Commands that make the
    /// endpoint not ready cause the rest to be deferred again.
    pub fn replay<H: Hardware + ?Sized>(&mut self, hw: &H, timeout_us: u32) {
        let mut pending = core::mem::replace(&mut self.deferred, Deque::new());
        while let Some(command) = pending.pop_front() {
            if let Err(err) = self.send(hw, command, timeout_us) {
                warn!(
                    "EP{} DEFERRED CMD {} FAILED: {}",
                    self.physical(),
                    command.kind as u32,
                    err
                );
            }
        }
    }
}
