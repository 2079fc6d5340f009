//! The device controller
//!
//! A [`Controller`] owns the endpoint state, the event buffer, and the
//! endpoint 0 state machine. All methods take `&self`; state lives behind
//! short-held spin locks, so completion callbacks and gadget upcalls can
//! call back into the controller.
//!
//! Locks are taken in this order: one endpoint, then the control or
//! device state. Callbacks run with no endpoint locked.

use core::{
    mem::size_of,
    sync::atomic::{AtomicU32, Ordering},
};

use spin::{Mutex, Once};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

use crate::{
    command::{Command, ConfigAction, Issued},
    control::{Control, ExitLatency, Phase},
    endpoint::{self, Endpoint, EndpointDescriptor},
    error::Error,
    event::{EventRing, LinkState},
    gadget::{Gadget, Udc},
    hardware, ral,
    request::{Origin, Rejected, Request, RequestId},
    state::{ControllerMemory, Memory},
    trb::{Trb, TrbType},
    Hardware, ENDPOINT_COUNT,
};

/// USB speeds.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Speed {
    Low,
    Full,
    High,
    /// SuperSpeed.
    ///
    /// A SuperSpeed device still connects to high, full, and low speed
    /// hosts, so use this setting for the most flexibility.
    #[default]
    Super,
}

impl Speed {
    pub(crate) fn from_connect_speed(speed: u32) -> Self {
        use ral::DSTS::CONNECTSPD::R;
        match speed {
            R::SUPER | R::SUPER_PLUS => Speed::Super,
            R::HIGH => Speed::High,
            R::LOW => Speed::Low,
            _ => Speed::Full,
        }
    }

    fn device_speed(self) -> u32 {
        use ral::DCFG::DEVSPD::RW;
        match self {
            Speed::Super => RW::SUPER,
            Speed::High => RW::HIGH,
            Speed::Full => RW::FULL,
            Speed::Low => RW::LOW,
        }
    }

    /// Returns the endpoint 0 max packet size, and the largest max packet
    /// size for other endpoints.
    pub fn packet_sizes(self) -> (u16, u16) {
        match self {
            Speed::Super => (512, 1024),
            Speed::High => (64, 512),
            Speed::Full => (64, 64),
            Speed::Low => (8, 8),
        }
    }
}

/// Controller configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Config {
    /// The fastest speed to offer the host.
    pub maximum_speed: Speed,
    /// Reported to the host in the device's status.
    pub self_powered: bool,
    /// How long to wait for an endpoint command.
    pub command_timeout_us: u32,
    /// How long to wait for the core soft reset.
    pub reset_timeout_us: u32,
    /// How long to wait for the controller to halt after stopping.
    pub halt_timeout_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            maximum_speed: Speed::Super,
            self_powered: false,
            command_timeout_us: 500,
            reset_timeout_us: 50_000,
            halt_timeout_us: 50_000,
        }
    }
}

/// Device-wide state, rebuilt at every bus reset.
#[derive(Default)]
pub(crate) struct DeviceState {
    pub speed: Option<Speed>,
    pub connected: bool,
    pub address: u8,
    /// A Start New Configuration was sent since the last reset.
    pub config_started: bool,
    pub remote_wakeup: bool,
    pub u1_enabled: bool,
    pub u2_enabled: bool,
    pub exit_latency: ExitLatency,
    pub link: Option<LinkState>,
    /// Mirrors DALEPENA.
    pub enabled: u32,
}

/// Engine-owned endpoint 0 buffers. `None` while queued.
pub(crate) struct Ep0Buffers {
    pub setup: Option<&'static mut [u8]>,
    pub reply: Option<&'static mut [u8]>,
}

/// Direct index to the OUT control endpoint
pub(crate) fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Direct index to the IN control endpoint
pub(crate) fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// A DWC3 device controller.
///
/// After you allocate a `Controller` with [`new()`](Controller::new), you must
///
/// - call [`initialize()`](Controller::initialize) once
/// - [`bind()`](Controller::bind) your gadget
/// - call [`start()`](Controller::start) to connect to the host
///
/// Then, call [`handle_interrupt()`](Controller::handle_interrupt) whenever
/// the controller signals an interrupt. Gadgets use the [`Udc`] interface
/// to enable endpoints and queue requests.
pub struct Controller<H> {
    pub(crate) hw: H,
    pub(crate) config: Config,
    pub(crate) endpoints: [Mutex<Endpoint>; ENDPOINT_COUNT],
    pub(crate) control: Mutex<Control>,
    pub(crate) device: Mutex<DeviceState>,
    pub(crate) events: Mutex<EventRing>,
    pub(crate) buffers: Mutex<Ep0Buffers>,
    gadget: Once<&'static dyn Gadget>,
    next_id: AtomicU32,
}

impl<H: Hardware> Controller<H> {
    /// Create a new `Controller`.
    ///
    /// Creation does nothing except assign static memory to the controller.
    /// After creating the controller, call [`initialize()`](Controller::initialize).
    ///
    /// # Panics
    ///
    /// Panics if the memory has already been assigned to another controller.
    pub fn new(hw: H, memory: &'static ControllerMemory, config: Config) -> Self {
        let Memory {
            trbs,
            events,
            setup,
            reply,
        } = memory.take().expect("Controller memory already assigned");
        Controller {
            hw,
            config,
            endpoints: core::array::from_fn(|physical| {
                Mutex::new(Endpoint::new(endpoint::address(physical), &trbs[physical]))
            }),
            control: Mutex::new(Control::new()),
            device: Mutex::new(DeviceState::default()),
            events: Mutex::new(EventRing::new(events)),
            buffers: Mutex::new(Ep0Buffers {
                setup: Some(setup),
                reply: Some(reply),
            }),
            gadget: Once::new(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Reset the controller core, and prepare endpoint 0.
    ///
    /// Assumes that clocks and the PHY are already running. The controller
    /// doesn't connect to the host until [`start()`](Controller::start).
    pub fn initialize(&self) -> Result<(), Error> {
        let regs = ral::device(&self.hw);
        ral::modify_reg!(ral, &regs, DCTL, RUN_STOP: 0, CSFTRST: 1);
        if !hardware::poll(&self.hw, self.config.reset_timeout_us, || {
            ral::read_reg!(ral, &regs, DCTL, CSFTRST == 0)
        }) {
            warn!("SOFT RESET TIMEOUT");
            return Err(Error::Timeout);
        }

        {
            let mut events = self.events.lock();
            events.reset();
            let dma = self.hw.dma_address(events.as_ptr());
            self.hw
                .sync_for_device(dma, events.size(), UsbDirection::Out);
            ral::write_reg!(ral, &regs, GEVNTADRLO, dma as u32);
            ral::write_reg!(ral, &regs, GEVNTADRHI, (dma >> 32) as u32);
            ral::write_reg!(ral, &regs, GEVNTSIZ, SIZE: events.size() as u32, INTMASK: 0);
            let stale = ral::read_reg!(ral, &regs, GEVNTCOUNT, COUNT);
            ral::write_reg!(ral, &regs, GEVNTCOUNT, stale);
        }

        let speed = self.config.maximum_speed.device_speed();
        ral::modify_reg!(ral, &regs, DCFG, DEVSPD: speed, DEVADDR: 0, LPM_CAP: 0);
        ral::write_reg!(
            ral,
            &regs,
            DEVTEN,
            DISCONNEVTEN: 1,
            USBRSTEN: 1,
            CONNECTDONEEN: 1,
            ULSTCNGEN: 1,
            WKUPEVTEN: 1
        );

        *self.device.lock() = DeviceState::default();
        ral::write_reg!(ral, &regs, DALEPENA, 0);

        self.endpoints[0].lock().send(
            &self.hw,
            Command::start_new_config(0),
            self.config.command_timeout_us,
        )?;
        let (ep0_packet, _) = self.config.maximum_speed.packet_sizes();
        for ep in &self.endpoints[..2] {
            let mut ep = ep.lock();
            ep.max_packet = ep0_packet;
            self.activate(&mut ep, ConfigAction::Init);
        }

        self.control.lock().reset(Phase::Setup);
        self.queue_setup();
        debug!("INITIALIZED");
        Ok(())
    }

    /// Bind the gadget that handles control requests and bus events.
    ///
    /// Returns [`Error::AlreadyBound`] if a gadget is already bound.
    pub fn bind(&self, gadget: &'static dyn Gadget) -> Result<(), Error> {
        let mut bound = false;
        self.gadget.call_once(|| {
            bound = true;
            gadget
        });
        if bound {
            Ok(())
        } else {
            Err(Error::AlreadyBound)
        }
    }

    /// Connect to the host.
    pub fn start(&self) {
        let regs = ral::device(&self.hw);
        ral::modify_reg!(ral, &regs, DCTL, RUN_STOP: 1);
        debug!("RUN");
    }

    /// Disconnect from the host, and complete every request with
    /// [`Error::Shutdown`].
    ///
    /// Returns [`Error::Timeout`] if the controller didn't halt in time;
    /// the requests are completed either way.
    pub fn stop(&self) -> Result<(), Error> {
        let regs = ral::device(&self.hw);
        ral::modify_reg!(ral, &regs, DCTL, RUN_STOP: 0);
        let halted = hardware::poll(&self.hw, self.config.halt_timeout_us, || {
            ral::read_reg!(ral, &regs, DSTS, DEVCTRLHLT == 1)
        });

        for physical in (0..ENDPOINT_COUNT).rev() {
            {
                let mut ep = self.endpoints[physical].lock();
                ep.not_ready = false;
                ep.ending = false;
                ep.deferred.clear();
                ep.halted = false;
                ep.active = false;
                ep.resource = None;
                if physical >= 2 {
                    ep.enabled = false;
                }
            }
            self.kill_all(physical, Err(Error::Shutdown));
        }

        {
            let mut device = self.device.lock();
            device.connected = false;
            device.speed = None;
            device.enabled &= 0b11;
            let enabled = device.enabled;
            ral::write_reg!(ral, &regs, DALEPENA, enabled);
        }
        self.control.lock().reset(Phase::Unconnected);
        debug!("STOP");

        if halted {
            Ok(())
        } else {
            warn!("HALT TIMEOUT");
            Err(Error::Timeout)
        }
    }

    /// Returns the hardware.
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Returns `true` after the host connected, until it disconnects.
    pub fn is_connected(&self) -> bool {
        self.device.lock().connected
    }

    /// The address assigned by the host.
    pub fn address(&self) -> u8 {
        self.device.lock().address
    }

    /// The exit latencies from the last SET_SEL request.
    pub fn exit_latency(&self) -> ExitLatency {
        self.device.lock().exit_latency
    }

    /// The endpoint 0 control transfer phase.
    pub fn ep0_phase(&self) -> Phase {
        self.control.lock().phase
    }

    /// Returns `true` if the endpoint is stalled.
    pub fn is_halted(&self, address: EndpointAddress) -> bool {
        self.physical(address)
            .map(|physical| self.endpoints[physical].lock().halted)
            .unwrap_or(false)
    }

    /// Returns how many commands wait for the endpoint to become ready.
    pub fn deferred_commands(&self, address: EndpointAddress) -> usize {
        self.physical(address)
            .map(|physical| self.endpoints[physical].lock().deferred.len())
            .unwrap_or(0)
    }

    pub(crate) fn gadget(&self) -> Option<&'static dyn Gadget> {
        self.gadget.get().copied()
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn physical(&self, address: EndpointAddress) -> Result<usize, Error> {
        let physical = endpoint::physical(address);
        if physical < ENDPOINT_COUNT {
            Ok(physical)
        } else {
            Err(Error::InvalidEndpoint)
        }
    }

    fn set_enabled(&self, physical: usize, enabled: bool) {
        let mut device = self.device.lock();
        if enabled {
            device.enabled |= 1 << physical;
        } else {
            device.enabled &= !(1 << physical);
        }
        let regs = ral::device(&self.hw);
        let bitmap = device.enabled;
        ral::write_reg!(ral, &regs, DALEPENA, bitmap);
    }

    /// Send the configuration for the endpoint, and enable it.
    pub(crate) fn activate(&self, ep: &mut Endpoint, action: ConfigAction) {
        let timeout = self.config.command_timeout_us;
        let (param0, param1) = ep.config_params(action);
        if let Err(err) = ep.send(&self.hw, Command::set_endpoint_config(param0, param1), timeout) {
            // The enable bit is still set below.
            warn!("EP{} CONFIG FAILED: {}", ep.physical(), err);
        }
        if action == ConfigAction::Init {
            if let Err(err) = ep.send(&self.hw, Command::set_transfer_resource(), timeout) {
                warn!("EP{} RESOURCE FAILED: {}", ep.physical(), err);
            }
        }
        ep.enabled = true;
        self.set_enabled(ep.physical(), true);
    }

    /// Stop the endpoint's transfer, if any, and disable it.
    fn deactivate(&self, ep: &mut Endpoint) {
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
        ep.enabled = false;
        self.set_enabled(ep.physical(), false);
    }

    /// Issue a Start New Configuration, once per reset, before the first
    /// non-control endpoint is configured.
    fn start_configuration(&self) {
        let first = !core::mem::replace(&mut self.device.lock().config_started, true);
        if first {
            if let Err(err) = self.endpoints[0].lock().send(
                &self.hw,
                Command::start_new_config(2),
                self.config.command_timeout_us,
            ) {
                warn!("START CONFIG FAILED: {}", err);
            }
        }
    }

    pub(crate) fn halt(&self, address: EndpointAddress, halt: bool) -> Result<(), Error> {
        let physical = self.physical(address)?;
        if address.index() == 0 {
            // The controller clears an endpoint 0 stall on the next SETUP.
            if halt {
                self.stall_ep0();
            }
            return Ok(());
        }

        {
            let mut ep = self.endpoints[physical].lock();
            let command = if halt {
                Command::set_stall()
            } else {
                Command::clear_stall()
            };
            ep.send(&self.hw, command, self.config.command_timeout_us)?;
            ep.halted = halt;
        }
        debug!("EP{} HALT {}", physical, halt);
        if !halt {
            self.kick(physical);
        }
        Ok(())
    }

    /// Queue a request, and start it if the endpoint is idle.
    pub(crate) fn submit(
        &self,
        address: EndpointAddress,
        mut request: Request,
    ) -> Result<(), Rejected> {
        let physical = match self.physical(address) {
            Ok(physical) => physical,
            Err(error) => return Err(Rejected { error, request }),
        };

        {
            let mut ep = self.endpoints[physical].lock();
            if !ep.enabled {
                return Err(Rejected {
                    error: Error::EndpointDisabled,
                    request,
                });
            }
            if ep.queue.is_full() {
                return Err(Rejected {
                    error: Error::QueueFull,
                    request,
                });
            }
            let length = ep.transfer_length(request.length());
            if let Err(error) = self.map(&mut request, length, address.direction()) {
                return Err(Rejected { error, request });
            }
            request.start();
            if let Err(mut request) = ep.queue.push(request) {
                self.unmap(address, &mut request);
                return Err(Rejected {
                    error: Error::QueueFull,
                    request,
                });
            }
        }

        self.kick(physical);
        Ok(())
    }

    /// Start the request at the front of the queue, if the endpoint can
    /// take a transfer.
    pub(crate) fn kick(&self, physical: usize) {
        let mut ep = self.endpoints[physical].lock();
        if ep.halted || ep.not_ready || ep.active || !ep.enabled {
            return;
        }
        let Some((dma, length)) = ep
            .queue
            .first()
            .and_then(|request| Some((request.dma()?, request.length())))
        else {
            return;
        };

        let length = ep.transfer_length(length);
        let kind = if physical < 2 {
            self.control.lock().phase.trb_type()
        } else {
            TrbType::Normal
        };
        let trb = self.hw.dma_address((ep.trb as *const Trb).cast());
        ep.trb.prepare(dma, length as u32, kind, !ep.is_in());
        self.hw
            .sync_for_device(trb, size_of::<Trb>(), UsbDirection::In);

        match ep.send(
            &self.hw,
            Command::start_transfer(trb),
            self.config.command_timeout_us,
        ) {
            Ok(Issued::Done { resource }) => {
                ep.resource = Some(resource);
                ep.active = true;
                ep.transfer_len = length as u32;
                debug!("EP{} START {}", physical, length);
            }
            Ok(Issued::Deferred) => {}
            Err(err) => {
                // Stays queued until the next kick.
                ep.trb.release();
                warn!("EP{} START FAILED: {}", physical, err);
            }
        }
    }

    fn map(&self, request: &mut Request, length: usize, direction: UsbDirection) -> Result<(), Error> {
        if length > request.buffer_len() {
            return Err(Error::BufferMap);
        }
        let dma = match request.dma() {
            Some(dma) if request.is_premapped() => {
                self.hw.sync_for_device(dma, length, direction);
                dma
            }
            _ => self
                .hw
                .map(request.as_ptr(), length, direction)
                .ok_or(Error::BufferMap)?,
        };
        request.set_mapped(dma, length);
        Ok(())
    }

    fn unmap(&self, address: EndpointAddress, request: &mut Request) {
        if let Some((dma, length, owned)) = request.take_mapping() {
            if owned {
                self.hw.unmap(dma, length, address.direction());
            } else {
                self.hw.sync_for_cpu(dma, length, address.direction());
            }
        }
    }

    /// Complete the request at `index` in the endpoint's queue.
    ///
    /// On success, the next request starts after the callback returns.
    pub(crate) fn complete(&self, physical: usize, index: usize, result: Result<(), Error>) {
        let (address, mut request) = {
            let mut ep = self.endpoints[physical].lock();
            if index >= ep.queue.len() {
                return;
            }
            if index == 0 && ep.active {
                ep.active = false;
                ep.resource = None;
                ep.trb.release();
            }
            let mut request = ep.queue.remove(index);
            request.finish(result);
            (ep.address(), request)
        };

        self.unmap(address, &mut request);
        if physical < 2 && result.is_ok() {
            self.control.lock().advance();
        }
        self.give_back(address, request);

        if result.is_ok() {
            self.kick(physical);
        }
    }

    /// Complete every queued request with `result`, in queue order.
    pub(crate) fn kill_all(&self, physical: usize, result: Result<(), Error>) {
        let queued = self.endpoints[physical].lock().queue.len();
        for _ in 0..queued {
            self.complete(physical, 0, result);
        }
    }

    fn give_back(&self, address: EndpointAddress, request: Request) {
        match request.origin {
            Origin::Gadget => match request.complete_fn() {
                Some(complete) => complete(self, address, request),
                None => debug!("EP{} NO CALLBACK", address.index()),
            },
            Origin::Setup => self.setup_complete(request),
            Origin::Reply => self.reply_complete(request),
            Origin::Status => self.status_complete(request),
        }
    }
}

impl<H: Hardware> Udc for Controller<H> {
    fn enable_endpoint(
        &self,
        address: EndpointAddress,
        descriptor: &EndpointDescriptor,
    ) -> Result<(), Error> {
        if descriptor.address != address {
            return Err(Error::MismatchedDescriptor);
        }
        match descriptor.kind {
            EndpointType::Isochronous { .. } => return Err(Error::UnsupportedEndpointType),
            EndpointType::Control if address.index() != 0 => {
                return Err(Error::UnsupportedEndpointType)
            }
            _ => {}
        }
        let physical = self.physical(address)?;
        if physical < 2 || descriptor.max_packet_size == 0 {
            return Err(Error::InvalidEndpoint);
        }
        if self.endpoints[physical].lock().enabled {
            debug!("EP{} ALREADY ENABLED", physical);
            return Ok(());
        }

        self.start_configuration();
        let mut ep = self.endpoints[physical].lock();
        ep.configure(descriptor);
        if let Some((_, limit)) = self.device.lock().speed.map(Speed::packet_sizes) {
            ep.max_packet = ep.max_packet.min(limit);
        }
        self.activate(&mut ep, ConfigAction::Init);
        debug!("ENABLE EP{} {:?}", physical, descriptor.kind);
        Ok(())
    }

    fn disable_endpoint(&self, address: EndpointAddress) -> Result<(), Error> {
        let physical = self.physical(address)?;
        if physical < 2 {
            return Err(Error::InvalidEndpoint);
        }
        {
            let mut ep = self.endpoints[physical].lock();
            if !ep.enabled {
                debug!("EP{} ALREADY DISABLED", physical);
                return Ok(());
            }
            self.deactivate(&mut ep);
        }
        self.kill_all(physical, Err(Error::Shutdown));
        debug!("DISABLE EP{}", physical);
        Ok(())
    }

    fn queue(&self, address: EndpointAddress, request: Request) -> Result<(), Rejected> {
        self.submit(address, request)
    }

    fn dequeue(&self, address: EndpointAddress, id: RequestId) -> Result<(), Error> {
        let physical = self.physical(address)?;
        let index = self.endpoints[physical]
            .lock()
            .queue
            .iter()
            .position(|request| request.id() == id)
            .ok_or(Error::RequestNotFound)?;
        self.complete(physical, index, Err(Error::ConnectionReset));
        Ok(())
    }

    fn set_halt(&self, address: EndpointAddress, halt: bool) -> Result<(), Error> {
        self.halt(address, halt)
    }

    fn alloc_request(&self, buffer: &'static mut [u8]) -> Request {
        Request::new(buffer, self.next_request_id())
    }

    fn free_request(&self, request: Request) -> &'static mut [u8] {
        request.into_buffer()
    }

    fn speed(&self) -> Option<Speed> {
        self.device.lock().speed
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::{Config, Controller, Speed};
    use crate::{
        command::CommandKind,
        endpoint::EndpointDescriptor,
        error::Error,
        mock::{self, completions, Completion, MockHardware},
        ral::offsets,
        state::ControllerMemory,
        Udc,
    };
    use std::{boxed::Box, vec, vec::Vec};
    use usb_device::endpoint::EndpointAddress;

    fn enable(udc: &dyn Udc, address: u8) -> EndpointAddress {
        let address = EndpointAddress::from(address);
        udc.enable_endpoint(address, &mock::bulk(address.into(), 512))
            .unwrap();
        address
    }

    #[test]
    #[should_panic(expected = "Controller memory already assigned")]
    fn memory_taken_once() {
        let memory: &'static ControllerMemory = Box::leak(Box::new(ControllerMemory::new()));
        let _first = Controller::new(MockHardware::new(), memory, Config::default());
        let _second = Controller::new(MockHardware::new(), memory, Config::default());
    }

    #[test]
    fn initialize_brings_up_ep0() {
        let udc = mock::controller();
        let hw = udc.hardware();
        let kinds: Vec<_> = hw
            .commands()
            .iter()
            .map(|command| (command.physical, command.kind))
            .collect();
        assert_eq!(
            kinds,
            [
                (0, CommandKind::StartNewConfig),
                (0, CommandKind::SetEndpointConfig),
                (0, CommandKind::SetTransferResource),
                (1, CommandKind::SetEndpointConfig),
                (1, CommandKind::SetTransferResource),
                (0, CommandKind::StartTransfer),
            ]
        );
        assert_eq!(hw.register(offsets::DALEPENA), 0b11);
        assert_eq!(hw.register(offsets::GEVNTSIZ), 4096);
        assert_eq!(hw.register(offsets::DCFG) & 0x7, 4);
        assert_eq!(hw.register(offsets::DEVTEN), 0b11111);
    }

    #[test]
    fn start_and_stop() {
        let udc = mock::controller();
        udc.start();
        assert_ne!(udc.hardware().register(offsets::DCTL) & (1 << 31), 0);
        udc.stop().unwrap();
        assert_eq!(udc.hardware().register(offsets::DCTL) & (1 << 31), 0);
        assert_eq!(udc.ep0_phase(), crate::Phase::Unconnected);
    }

    #[test]
    fn stop_shuts_down_requests() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        udc.queue(ep, mock::request(&udc, 64, 1)).unwrap();
        udc.queue(ep, mock::request(&udc, 64, 2)).unwrap();
        udc.stop().unwrap();
        let results: Vec<_> = completions().iter().map(|c| (c.context, c.result)).collect();
        assert_eq!(
            results,
            [(1, Some(Err(Error::Shutdown))), (2, Some(Err(Error::Shutdown)))]
        );
        assert!(!udc.is_connected());
    }

    #[test]
    fn bind_once() {
        let udc = mock::controller();
        let gadget = mock::gadget(true);
        assert_eq!(udc.bind(gadget), Ok(()));
        assert_eq!(udc.bind(gadget), Err(Error::AlreadyBound));
    }

    #[test]
    fn first_enable_starts_configuration() {
        let udc = mock::connected(Speed::Super);
        udc.hardware().clear_commands();
        enable(&udc, 0x81);
        enable(&udc, 0x02);
        let kinds: Vec<_> = udc
            .hardware()
            .commands()
            .iter()
            .map(|command| (command.physical, command.kind, command.word >> 16 & 0x7F))
            .collect();
        assert_eq!(
            kinds,
            [
                (0, CommandKind::StartNewConfig, 2),
                (3, CommandKind::SetEndpointConfig, 0),
                (3, CommandKind::SetTransferResource, 0),
                (4, CommandKind::SetEndpointConfig, 0),
                (4, CommandKind::SetTransferResource, 0),
            ]
        );
        assert_eq!(udc.hardware().register(offsets::DALEPENA), 0b11011);
    }

    #[test]
    fn enable_twice_is_harmless() {
        let udc = mock::connected(Speed::Super);
        enable(&udc, 0x81);
        let issued = udc.hardware().commands().len();
        enable(&udc, 0x81);
        assert_eq!(udc.hardware().commands().len(), issued);
    }

    #[test]
    fn rejected_descriptors() {
        let udc = mock::connected(Speed::Super);
        let issued = udc.hardware().commands().len();

        let iso = EndpointDescriptor::parse(&[7, 5, 0x81, 0x01, 0x00, 0x04, 1]).unwrap();
        assert_eq!(
            udc.enable_endpoint(EndpointAddress::from(0x81), &iso),
            Err(Error::UnsupportedEndpointType)
        );
        assert_eq!(
            udc.enable_endpoint(EndpointAddress::from(0x82), &mock::bulk(0x81, 512)),
            Err(Error::MismatchedDescriptor)
        );
        assert_eq!(
            udc.enable_endpoint(EndpointAddress::from(0x01), &mock::bulk(0x81, 512)),
            Err(Error::MismatchedDescriptor)
        );
        assert_eq!(
            udc.enable_endpoint(EndpointAddress::from(0x81), &mock::bulk(0x81, 0)),
            Err(Error::InvalidEndpoint)
        );
        assert_eq!(udc.hardware().commands().len(), issued);
    }

    #[test]
    fn max_packet_limited_by_speed() {
        let udc = mock::connected(Speed::High);
        let ep = EndpointAddress::from(0x81);
        udc.enable_endpoint(ep, &mock::bulk(0x81, 1024)).unwrap();
        let config = udc
            .hardware()
            .commands()
            .into_iter()
            .rfind(|command| command.kind == CommandKind::SetEndpointConfig)
            .unwrap();
        assert_eq!(config.params[0] >> 3 & 0x7FF, 512);
    }

    /// Scenario: bulk endpoint, one 1500 byte request, no bytes left over.
    #[test]
    fn bulk_transfer_completes() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        let mappings = udc.hardware().mappings();
        udc.queue(ep, mock::request(&udc, 1500, 7)).unwrap();
        assert_eq!(udc.hardware().mappings(), mappings + 1);

        let trb = udc.hardware().trb(3);
        assert!(trb.is_hardware_owned());
        assert_eq!(trb.bytes_remaining(), 1500);
        assert_eq!(trb.kind(), 1);

        udc.hardware().complete_transfer(3, 1500);
        assert!(udc.handle_interrupt());
        assert_eq!(
            completions(),
            [Completion {
                address: ep,
                context: 7,
                result: Some(Ok(())),
                actual: 1500,
            }]
        );
        assert_eq!(udc.hardware().mappings(), mappings);
    }

    #[test]
    fn fifo_completion_order() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        for context in 1..=3 {
            udc.queue(ep, mock::request(&udc, 100, context)).unwrap();
        }
        for _ in 0..3 {
            udc.hardware().complete_transfer(3, 100);
            udc.handle_interrupt();
        }
        let order: Vec<_> = completions().iter().map(|c| c.context).collect();
        assert_eq!(order, [1, 2, 3]);
    }

    #[test]
    fn one_transfer_at_a_time() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        udc.hardware().clear_commands();
        udc.queue(ep, mock::request(&udc, 10, 1)).unwrap();
        udc.queue(ep, mock::request(&udc, 10, 2)).unwrap();
        let starts = udc
            .hardware()
            .commands()
            .iter()
            .filter(|command| command.kind == CommandKind::StartTransfer)
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn out_transfers_round_up() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x01);
        let buffer = Box::leak(vec![0; 1024].into_boxed_slice());
        let mut request = udc.alloc_request(buffer);
        request.set_length(1000);
        request.set_complete(mock::record);
        udc.queue(ep, request).unwrap();

        let trb = udc.hardware().trb(2);
        assert_eq!(trb.bytes_remaining(), 1024);
        assert_ne!(trb.CTRL.read() & (1 << 10), 0, "short packet interrupt");

        udc.hardware().complete_transfer(2, 1024);
        udc.handle_interrupt();
        assert_eq!(completions()[0].actual, 1000);
    }

    #[test]
    fn short_out_transfer() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x01);
        udc.queue(ep, mock::request(&udc, 1024, 0)).unwrap();
        udc.hardware().complete_transfer(2, 13);
        udc.handle_interrupt();
        assert_eq!(completions()[0].actual, 13);
    }

    #[test]
    fn unmappable_buffers_are_rejected() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x01);

        let rejected = udc.queue(ep, mock::request(&udc, 1000, 0)).unwrap_err();
        assert_eq!(rejected.error, Error::BufferMap);
        assert_eq!(rejected.request.length(), 1000);

        udc.hardware().fail_map(true);
        let rejected = udc.queue(ep, mock::request(&udc, 1024, 0)).unwrap_err();
        assert_eq!(rejected.error, Error::BufferMap);
        assert!(completions().is_empty());
    }

    #[test]
    fn premapped_buffers_are_synchronized() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        let mappings = udc.hardware().mappings();
        let mut request = mock::request(&udc, 64, 0);
        unsafe { request.set_premapped(0x4000_0000) };
        udc.queue(ep, request).unwrap();
        assert_eq!(udc.hardware().trb(3).buffer(), 0x4000_0000);
        assert_eq!(udc.hardware().mappings(), mappings);
    }

    #[test]
    fn queue_on_disabled_endpoint() {
        let udc = mock::connected(Speed::Super);
        let rejected = udc
            .queue(EndpointAddress::from(0x83), mock::request(&udc, 8, 0))
            .unwrap_err();
        assert_eq!(rejected.error, Error::EndpointDisabled);
    }

    #[test]
    fn queue_full() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        let mappings = udc.hardware().mappings();
        for _ in 0..crate::endpoint::QUEUE_CAPACITY {
            udc.queue(ep, mock::request(&udc, 8, 0)).unwrap();
        }
        let rejected = udc.queue(ep, mock::request(&udc, 8, 0)).unwrap_err();
        assert_eq!(rejected.error, Error::QueueFull);
        assert_eq!(
            udc.hardware().mappings(),
            mappings + crate::endpoint::QUEUE_CAPACITY
        );
    }

    /// Scenario: cancelling a request queued behind the active one.
    #[test]
    fn dequeue_waiting_request() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        let a = mock::request(&udc, 10, 1);
        let b = mock::request(&udc, 10, 2);
        let b_id = b.id();
        udc.queue(ep, a).unwrap();
        udc.queue(ep, b).unwrap();

        udc.dequeue(ep, b_id).unwrap();
        assert_eq!(
            completions(),
            [Completion {
                address: ep,
                context: 2,
                result: Some(Err(Error::ConnectionReset)),
                actual: 0,
            }]
        );
        assert_eq!(udc.dequeue(ep, b_id), Err(Error::RequestNotFound));

        udc.hardware().complete_transfer(3, 10);
        udc.handle_interrupt();
        let done = completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].context, 1);
        assert_eq!(done[0].result, Some(Ok(())));
    }

    #[test]
    fn dequeue_active_request_doesnt_abort() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        let a = mock::request(&udc, 10, 1);
        let a_id = a.id();
        udc.queue(ep, a).unwrap();
        udc.hardware().clear_commands();

        udc.dequeue(ep, a_id).unwrap();
        assert_eq!(completions()[0].result, Some(Err(Error::ConnectionReset)));
        assert!(udc.hardware().commands().is_empty());
    }

    #[test]
    fn disable_twice() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        udc.queue(ep, mock::request(&udc, 10, 1)).unwrap();
        udc.queue(ep, mock::request(&udc, 10, 2)).unwrap();
        udc.hardware().clear_commands();

        udc.disable_endpoint(ep).unwrap();
        let results: Vec<_> = completions().iter().map(|c| c.result).collect();
        assert_eq!(results, [Some(Err(Error::Shutdown)); 2]);
        let commands = udc.hardware().commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind, CommandKind::EndTransfer);
        assert_eq!(udc.hardware().register(offsets::DALEPENA), 0b11);

        udc.disable_endpoint(ep).unwrap();
        assert!(completions().is_empty());
        assert_eq!(udc.hardware().commands().len(), 1);
    }

    #[test]
    fn ep0_cant_be_disabled() {
        let udc = mock::controller();
        assert_eq!(
            udc.disable_endpoint(EndpointAddress::from(0x80)),
            Err(Error::InvalidEndpoint)
        );
    }

    /// Scenario: configuration commands on a not-ready endpoint wait for
    /// the command complete event.
    #[test]
    fn commands_deferred_until_command_complete() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        udc.queue(ep, mock::request(&udc, 10, 1)).unwrap();
        udc.disable_endpoint(ep).unwrap();
        completions();

        let issued = udc.hardware().commands().len();
        assert_eq!(udc.deferred_commands(ep), 0);
        enable(&udc, 0x81);
        assert_eq!(udc.deferred_commands(ep), 2);
        assert_eq!(udc.hardware().commands().len(), issued);

        udc.hardware().push_event(mock::endpoint_event(3, 7, 0));
        udc.handle_interrupt();
        assert_eq!(udc.deferred_commands(ep), 0);
        let commands = udc.hardware().commands();
        let replayed: Vec<_> = commands[issued..].iter().map(|command| command.kind).collect();
        assert_eq!(
            replayed,
            [CommandKind::SetEndpointConfig, CommandKind::SetTransferResource]
        );

        udc.hardware().push_event(mock::endpoint_event(3, 7, 0));
        udc.handle_interrupt();
        assert_eq!(udc.hardware().commands().len(), issued + 2);
    }

    #[test]
    fn requests_wait_for_ready_endpoint() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        udc.queue(ep, mock::request(&udc, 10, 1)).unwrap();
        udc.disable_endpoint(ep).unwrap();
        enable(&udc, 0x81);
        completions();

        let starts = udc.hardware().starts(3);
        udc.queue(ep, mock::request(&udc, 10, 2)).unwrap();
        assert_eq!(udc.hardware().starts(3), starts);

        udc.hardware().push_event(mock::endpoint_event(3, 7, 0));
        udc.handle_interrupt();
        assert_eq!(udc.hardware().starts(3), starts + 1);
    }

    #[test]
    fn halt_and_resume() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        udc.set_halt(ep, true).unwrap();
        assert!(udc.is_halted(ep));

        udc.queue(ep, mock::request(&udc, 10, 1)).unwrap();
        assert_eq!(udc.hardware().starts(3), 0);

        udc.set_halt(ep, false).unwrap();
        assert!(!udc.is_halted(ep));
        let kinds: Vec<_> = udc
            .hardware()
            .commands()
            .iter()
            .rev()
            .take(2)
            .map(|command| command.kind)
            .collect();
        assert_eq!(kinds, [CommandKind::StartTransfer, CommandKind::ClearStall]);
    }

    #[test]
    fn command_timeout_marks_not_ready() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        udc.hardware().set_stuck(true);
        assert_eq!(udc.set_halt(ep, true), Err(Error::CommandTimeout));
        udc.hardware().set_stuck(false);

        udc.set_halt(ep, true).unwrap();
        assert_eq!(udc.deferred_commands(ep), 1);

        udc.hardware().push_event(mock::endpoint_event(3, 7, 0));
        udc.handle_interrupt();
        assert_eq!(udc.deferred_commands(ep), 0);
        let last = udc.hardware().commands().pop().unwrap();
        assert_eq!(last.kind, CommandKind::SetStall);
    }

    #[test]
    fn callbacks_can_queue_again() {
        let udc = mock::connected(Speed::Super);
        let ep = enable(&udc, 0x81);
        let mut request = mock::request(&udc, 10, 0);
        request.set_complete(mock::requeue_once);
        udc.queue(ep, request).unwrap();

        udc.hardware().complete_transfer(3, 10);
        udc.handle_interrupt();
        assert!(udc.hardware().trb(3).is_hardware_owned());

        udc.hardware().complete_transfer(3, 10);
        udc.handle_interrupt();
        let done = completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].context, 1);
    }

    #[test]
    fn free_request_returns_buffer() {
        let udc = mock::controller();
        let buffer = Box::leak(vec![7u8; 4].into_boxed_slice());
        let request = udc.alloc_request(buffer);
        let other = udc.alloc_request(Box::leak(vec![0u8; 4].into_boxed_slice()));
        assert_ne!(request.id(), other.id());
        assert_eq!(udc.free_request(request), &[7, 7, 7, 7]);
    }
}
