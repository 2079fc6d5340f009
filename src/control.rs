//! Endpoint 0 control transfers
//!
//! The controller keeps one SETUP read queued on endpoint 0 OUT. Each
//! SETUP packet moves the state machine through an optional data stage,
//! then a status stage that starts when the host asks for it with a
//! transfer-not-ready event. Standard requests that describe the
//! controller's own state are answered here. Everything else goes to the
//! bound [`Gadget`](crate::Gadget).

use usb_device::{
    control::{Recipient, Request as StandardRequest, RequestType},
    UsbDirection,
};

use crate::{
    command::Command,
    controller::{ep0_in, ep0_out, Controller},
    endpoint,
    error::Error,
    event::ControlStage,
    ral,
    request::{Origin, Rejected, Request},
    trb::TrbType,
    Hardware, Speed,
};

const SET_SEL: u8 = 48;
const FEATURE_U1_ENABLE: u16 = 48;
const FEATURE_U2_ENABLE: u16 = 49;

/// Endpoint 0 transfer phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No host, or the controller stopped.
    Unconnected,
    /// Waiting for a SETUP packet.
    Setup,
    /// Transferring the data stage.
    Data,
    /// Waiting for the host to ask for the status stage.
    WaitNotReady,
    /// Status stage of a two-stage transfer.
    Status2,
    /// Status stage of a three-stage transfer.
    Status3,
    Stalled,
}

impl Phase {
    /// The TRB type for a transfer started in this phase.
    pub(crate) fn trb_type(self) -> TrbType {
        match self {
            Phase::Data => TrbType::ControlData,
            Phase::Status2 => TrbType::ControlStatus2,
            Phase::Status3 => TrbType::ControlStatus3,
            _ => TrbType::ControlSetup,
        }
    }
}

/// An 8-byte SETUP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    /// Decode a SETUP packet. Multi-byte fields are little endian.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let [request_type, request, value_lo, value_hi, index_lo, index_hi, length_lo, length_hi, ..] =
            *bytes
        else {
            return None;
        };
        Some(SetupPacket {
            request_type,
            request,
            value: u16::from_le_bytes([value_lo, value_hi]),
            index: u16::from_le_bytes([index_lo, index_hi]),
            length: u16::from_le_bytes([length_lo, length_hi]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let [value_lo, value_hi] = self.value.to_le_bytes();
        let [index_lo, index_hi] = self.index.to_le_bytes();
        let [length_lo, length_hi] = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ]
    }

    /// The data stage direction.
    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }
}

/// U1 and U2 exit latencies from SET_SEL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitLatency {
    /// U1 system exit latency, in microseconds.
    pub u1_sel: u8,
    /// U1 device-to-host exit latency, in microseconds.
    pub u1_pel: u8,
    pub u2_sel: u16,
    pub u2_pel: u16,
}

/// Endpoint 0 state.
pub(crate) struct Control {
    pub phase: Phase,
    /// The current transfer has a data stage.
    pub three_stage: bool,
    pub direction: UsbDirection,
    /// Physical endpoint that carries the status stage.
    pub status_physical: usize,
    /// The reply buffer is receiving SET_SEL data.
    pub pending_sel: bool,
}

impl Control {
    pub const fn new() -> Self {
        Control {
            phase: Phase::Unconnected,
            three_stage: false,
            direction: UsbDirection::Out,
            status_physical: 1,
            pending_sel: false,
        }
    }

    pub fn reset(&mut self, phase: Phase) {
        *self = Self::new();
        self.phase = phase;
    }

    /// Move to the next phase after an endpoint 0 transfer succeeds.
    pub fn advance(&mut self) {
        self.phase = match self.phase {
            Phase::Setup => Phase::Data,
            Phase::Data => Phase::WaitNotReady,
            Phase::Status2 | Phase::Status3 => Phase::Setup,
            phase => phase,
        };
    }
}

impl<H: Hardware> Controller<H> {
    /// Queue a read for the next SETUP packet.
    pub(crate) fn queue_setup(&self) {
        let Some(buffer) = self.buffers.lock().setup.take() else {
            return;
        };
        let request = Request::internal(
            buffer,
            SetupPacket::SIZE,
            Origin::Setup,
            self.next_request_id(),
        );
        if let Err(Rejected { error, request }) = self.submit(ep0_out(), request) {
            warn!("SETUP QUEUE FAILED: {}", error);
            self.buffers.lock().setup = Some(request.into_buffer());
        }
    }

    pub(crate) fn setup_complete(&self, request: Request) {
        let result = request.result();
        let packet = SetupPacket::parse(request.data());
        self.buffers.lock().setup = Some(request.into_buffer());
        if result != Some(Ok(())) {
            return;
        }
        match packet {
            Some(packet) => self.process_control(packet),
            None => {
                warn!("SHORT SETUP");
                self.stall_ep0();
            }
        }
    }

    pub(crate) fn reply_complete(&self, request: Request) {
        let pending_sel = core::mem::take(&mut self.control.lock().pending_sel);
        if pending_sel && request.result() == Some(Ok(())) {
            if let [u1_sel, u1_pel, u2_sel_lo, u2_sel_hi, u2_pel_lo, u2_pel_hi, ..] = *request.data() {
                let latency = ExitLatency {
                    u1_sel,
                    u1_pel,
                    u2_sel: u16::from_le_bytes([u2_sel_lo, u2_sel_hi]),
                    u2_pel: u16::from_le_bytes([u2_pel_lo, u2_pel_hi]),
                };
                debug!("SEL {:?}", latency);
                self.device.lock().exit_latency = latency;
            }
        }
        self.buffers.lock().reply = Some(request.into_buffer());
    }

    pub(crate) fn status_complete(&self, request: Request) {
        if request.result() == Some(Ok(())) {
            self.queue_setup();
        }
    }

    pub(crate) fn process_control(&self, packet: SetupPacket) {
        debug!(
            "SETUP {} {} {} {} {}",
            packet.request_type,
            packet.request,
            packet.value,
            packet.index,
            packet.length
        );
        {
            let mut control = self.control.lock();
            control.three_stage = false;
            control.pending_sel = false;
            control.direction = packet.direction();
            control.status_physical = if packet.length > 0 && packet.direction() == UsbDirection::In {
                0
            } else {
                1
            };
            if packet.length == 0 {
                control.phase = Phase::WaitNotReady;
            }
        }

        let answered = match packet.kind() {
            RequestType::Standard => self.standard_request(&packet),
            _ => None,
        };
        let result = match answered {
            Some(result) => result,
            None => self.forward(&packet),
        };
        if let Err(err) = result {
            debug!("SETUP {} REJECTED: {}", packet.request, err);
            self.stall_ep0();
        }
    }

    fn forward(&self, packet: &SetupPacket) -> Result<(), Error> {
        let gadget = self.gadget().ok_or(Error::Unsupported)?;
        if packet.length > 0 {
            self.control.lock().three_stage = true;
        }
        gadget.setup(self, packet)
    }

    /// Returns `None` for requests that the gadget handles.
    fn standard_request(&self, packet: &SetupPacket) -> Option<Result<(), Error>> {
        match packet.request {
            StandardRequest::GET_STATUS => Some(self.get_status(packet)),
            StandardRequest::CLEAR_FEATURE => self.feature(packet, false),
            StandardRequest::SET_FEATURE => self.feature(packet, true),
            StandardRequest::SET_ADDRESS => Some(self.set_address(packet)),
            SET_SEL => Some(self.set_sel(packet)),
            _ => None,
        }
    }

    fn get_status(&self, packet: &SetupPacket) -> Result<(), Error> {
        if packet.length < 2 || packet.direction() != UsbDirection::In {
            return Err(Error::Unsupported);
        }
        let status: u16 = match packet.recipient() {
            Recipient::Device => {
                let device = self.device.lock();
                let mut status = u16::from(self.config.self_powered);
                status |= u16::from(device.remote_wakeup) << 1;
                if device.speed == Some(Speed::Super) {
                    status |= u16::from(device.u1_enabled) << 2;
                    status |= u16::from(device.u2_enabled) << 3;
                }
                status
            }
            Recipient::Interface => 0,
            Recipient::Endpoint => {
                let address = (packet.index as u8).into();
                let physical = self.physical(address)?;
                let ep = self.endpoints[physical].lock();
                if !ep.enabled {
                    return Err(Error::EndpointDisabled);
                }
                u16::from(ep.halted)
            }
            _ => return Err(Error::Unsupported),
        };
        self.reply(&status.to_le_bytes())
    }

    /// Send `data` in the data stage, from the reply buffer.
    fn reply(&self, data: &[u8]) -> Result<(), Error> {
        let buffer = self.buffers.lock().reply.take().ok_or(Error::QueueFull)?;
        let length = data.len().min(buffer.len());
        buffer[..length].copy_from_slice(&data[..length]);
        let request = Request::internal(buffer, length, Origin::Reply, self.next_request_id());
        self.submit(ep0_in(), request)
            .map_err(|Rejected { error, request }| {
                self.buffers.lock().reply = Some(request.into_buffer());
                error
            })
    }

    fn feature(&self, packet: &SetupPacket, set: bool) -> Option<Result<(), Error>> {
        match packet.recipient() {
            Recipient::Device => match packet.value {
                StandardRequest::FEATURE_DEVICE_REMOTE_WAKEUP => {
                    self.device.lock().remote_wakeup = set;
                    Some(Ok(()))
                }
                FEATURE_U1_ENABLE | FEATURE_U2_ENABLE => Some(self.link_power(packet.value, set)),
                _ => None,
            },
            Recipient::Endpoint if packet.value == StandardRequest::FEATURE_ENDPOINT_HALT => {
                Some(self.endpoint_halt(packet, set))
            }
            _ => None,
        }
    }

    /// The host can only halt endpoints that are enabled.
    fn endpoint_halt(&self, packet: &SetupPacket, set: bool) -> Result<(), Error> {
        let address = (packet.index as u8).into();
        let physical = self.physical(address)?;
        if !self.endpoints[physical].lock().enabled {
            return Err(Error::EndpointDisabled);
        }
        self.halt(address, set)
    }

    /// Accept (or refuse) U1 and U2 entry. SuperSpeed only.
    fn link_power(&self, feature: u16, enable: bool) -> Result<(), Error> {
        let mut device = self.device.lock();
        if device.speed != Some(Speed::Super) {
            return Err(Error::Unsupported);
        }
        let regs = ral::device(&self.hw);
        let enable_bit = u32::from(enable);
        if feature == FEATURE_U1_ENABLE {
            device.u1_enabled = enable;
            ral::modify_reg!(ral, &regs, DCTL, ACCEPTU1ENA: enable_bit, INITU1ENA: enable_bit);
        } else {
            device.u2_enabled = enable;
            ral::modify_reg!(ral, &regs, DCTL, ACCEPTU2ENA: enable_bit, INITU2ENA: enable_bit);
        }
        Ok(())
    }

    fn set_address(&self, packet: &SetupPacket) -> Result<(), Error> {
        if packet.value > 127 || packet.length != 0 || packet.recipient() != Recipient::Device {
            return Err(Error::Unsupported);
        }
        let address = packet.value as u8;
        let regs = ral::device(&self.hw);
        ral::modify_reg!(ral, &regs, DCFG, DEVADDR: u32::from(address));
        self.device.lock().address = address;
        debug!("ADDRESS {}", address);
        Ok(())
    }

    /// Receive the six bytes of exit latencies into the reply buffer.
    fn set_sel(&self, packet: &SetupPacket) -> Result<(), Error> {
        if packet.length != 6 || packet.direction() != UsbDirection::Out {
            return Err(Error::Unsupported);
        }
        let buffer = self.buffers.lock().reply.take().ok_or(Error::QueueFull)?;
        {
            let mut control = self.control.lock();
            control.pending_sel = true;
            control.three_stage = true;
        }
        let request = Request::internal(buffer, 6, Origin::Reply, self.next_request_id());
        self.submit(ep0_out(), request)
            .map_err(|Rejected { error, request }| {
                self.buffers.lock().reply = Some(request.into_buffer());
                error
            })
    }

    /// Handle a transfer-not-ready event on endpoint 0.
    pub(crate) fn ep0_not_ready(&self, physical: usize, stage: Option<ControlStage>) {
        let mut control = self.control.lock();
        match (control.phase, stage) {
            (Phase::Data, Some(ControlStage::Data)) => {
                let direction = if physical == 1 {
                    UsbDirection::In
                } else {
                    UsbDirection::Out
                };
                if direction != control.direction {
                    drop(control);
                    warn!("EP0 DATA WRONG DIRECTION");
                    self.stall_ep0();
                }
            }
            (Phase::WaitNotReady, Some(ControlStage::Status))
                if physical == control.status_physical =>
            {
                control.phase = if control.three_stage {
                    Phase::Status3
                } else {
                    Phase::Status2
                };
                drop(control);
                self.queue_status(physical);
            }
            _ => {}
        }
    }

    fn queue_status(&self, physical: usize) {
        let request = Request::internal(
            Default::default(),
            0,
            Origin::Status,
            self.next_request_id(),
        );
        if let Err(Rejected { error, .. }) = self.submit(endpoint::address(physical), request) {
            warn!("STATUS QUEUE FAILED: {}", error);
            self.stall_ep0();
        }
    }

    /// Stall endpoint 0, and wait for the next SETUP packet.
    pub(crate) fn stall_ep0(&self) {
        {
            let mut ep0 = self.endpoints[0].lock();
            match ep0.send(
                &self.hw,
                Command::set_stall(),
                self.config.command_timeout_us,
            ) {
                Ok(_) => ep0.halted = true,
                Err(err) => warn!("EP0 STALL FAILED: {}", err),
            }
        }
        self.control.lock().phase = Phase::Stalled;
        debug!("EP0 STALL");
        self.ep0_restart();
    }

    /// Drop all endpoint 0 transfers, and queue the SETUP read.
    ///
    /// A transfer that the controller still holds is ended first. The
    /// SETUP read starts once that End Transfer completes.
    pub(crate) fn ep0_restart(&self) {
        for ep in self.endpoints[..2].iter().rev() {
            let mut ep = ep.lock();
            if let Some(resource) = ep.resource.take() {
                ep.active = false;
                if let Err(err) = ep.send(
                    &self.hw,
                    Command::end_transfer(resource),
                    self.config.command_timeout_us,
                ) {
                    warn!("EP{} END TRANSFER FAILED: {}", ep.physical(), err);
                }
                ep.trb.release();
            }
        }
        self.kill_all(1, Err(Error::ConnectionReset));
        self.kill_all(0, Err(Error::ConnectionReset));
        for ep in &self.endpoints[..2] {
            // The controller clears the stall when the next SETUP arrives.
            ep.lock().halted = false;
        }
        self.control.lock().reset(Phase::Setup);
        self.queue_setup();
    }

    /// Returns `true` if endpoint 0 holds nothing but the SETUP read.
    pub(crate) fn ep0_waiting_for_setup(&self) -> bool {
        let setup_queued = {
            let ep0 = self.endpoints[0].lock();
            ep0.queue.len() == 1 && ep0.queue[0].origin == Origin::Setup
        };
        setup_queued && self.endpoints[1].lock().queue.is_empty()
    }
}
