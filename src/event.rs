//! Event buffer records
//!
//! The controller writes 4-byte records into the event buffer, and
//! reports the number of pending bytes in GEVNTCOUNT. [`Event::from`]
//! decodes one record.

use crate::state::Word;

/// An endpoint event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointEventKind {
    TransferComplete,
    TransferInProgress,
    TransferNotReady,
    FifoError,
    Stream,
    CommandComplete,
    Other(u8),
}

impl From<u32> for EndpointEventKind {
    fn from(kind: u32) -> Self {
        match kind {
            1 => Self::TransferComplete,
            2 => Self::TransferInProgress,
            3 => Self::TransferNotReady,
            4 => Self::FifoError,
            6 => Self::Stream,
            7 => Self::CommandComplete,
            other => Self::Other(other as u8),
        }
    }
}

/// The control transfer stage that the host is waiting on.
///
/// Reported with transfer-not-ready events on endpoint 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStage {
    Data,
    Status,
}

/// An event for one physical endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointEvent {
    pub physical: usize,
    pub kind: EndpointEventKind,
    pub status: u8,
    pub parameters: u16,
}

impl EndpointEvent {
    /// Returns the stage that a control endpoint is waiting on.
    pub fn control_stage(&self) -> Option<ControlStage> {
        match self.status & 0x3 {
            1 => Some(ControlStage::Data),
            2 => Some(ControlStage::Status),
            _ => None,
        }
    }
}

/// USB link state, as reported by DSTS and link state change events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    U0,
    U1,
    U2,
    U3,
    SsDisabled,
    RxDetect,
    SsInactive,
    Polling,
    Recovery,
    HotReset,
    Compliance,
    Loopback,
    Reset,
    Resume,
    Other(u8),
}

impl From<u32> for LinkState {
    fn from(state: u32) -> Self {
        match state & 0xF {
            0x0 => Self::U0,
            0x1 => Self::U1,
            0x2 => Self::U2,
            0x3 => Self::U3,
            0x4 => Self::SsDisabled,
            0x5 => Self::RxDetect,
            0x6 => Self::SsInactive,
            0x7 => Self::Polling,
            0x8 => Self::Recovery,
            0x9 => Self::HotReset,
            0xA => Self::Compliance,
            0xB => Self::Loopback,
            0xE => Self::Reset,
            0xF => Self::Resume,
            other => Self::Other(other as u8),
        }
    }
}

/// A device event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Disconnect,
    Reset,
    ConnectDone,
    LinkStateChange(LinkState),
    Wakeup,
    Hibernation,
    Suspend(LinkState),
    StartOfFrame,
    Overflow,
    Other(u8),
}

/// One decoded event record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Endpoint(EndpointEvent),
    Device(DeviceEvent),
    /// Records for other event sources; ignored.
    Unknown(u32),
}

impl From<u32> for Event {
    fn from(raw: u32) -> Self {
        if raw & 1 == 0 {
            return Event::Endpoint(EndpointEvent {
                physical: ((raw >> 1) & 0x1F) as usize,
                kind: ((raw >> 6) & 0xF).into(),
                status: ((raw >> 12) & 0xF) as u8,
                parameters: (raw >> 16) as u16,
            });
        }
        if (raw >> 1) & 0x7F != 0 {
            return Event::Unknown(raw);
        }
        let info = raw >> 16;
        Event::Device(match (raw >> 8) & 0xF {
            0 => DeviceEvent::Disconnect,
            1 => DeviceEvent::Reset,
            2 => DeviceEvent::ConnectDone,
            3 => DeviceEvent::LinkStateChange(info.into()),
            4 => DeviceEvent::Wakeup,
            5 => DeviceEvent::Hibernation,
            6 => DeviceEvent::Suspend(info.into()),
            7 => DeviceEvent::StartOfFrame,
            11 => DeviceEvent::Overflow,
            other => DeviceEvent::Other(other as u8),
        })
    }
}

/// The engine's read position in the event buffer.
pub(crate) struct EventRing {
    buffer: &'static [Word],
    cursor: usize,
}

impl EventRing {
    pub fn new(buffer: &'static [Word]) -> Self {
        EventRing { buffer, cursor: 0 }
    }

    /// Start reading from the beginning of the buffer.
    pub fn reset(&mut self) {
        self.buffer.iter().for_each(|word| word.write(0));
        self.cursor = 0;
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr().cast()
    }

    /// Buffer size, in bytes.
    pub fn size(&self) -> usize {
        self.buffer.len() * 4
    }

    /// Read the record at the cursor, and advance.
    pub fn next(&mut self) -> u32 {
        let raw = self.buffer[self.cursor].read();
        self.cursor = (self.cursor + 1) % self.buffer.len();
        raw
    }
}
