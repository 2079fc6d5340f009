//! Event dispatch
//!
//! [`Controller::handle_interrupt`] drains the event buffer, and routes
//! each record to its handler.

use usb_device::UsbDirection;

use crate::{
    command::{Command, ConfigAction},
    control::Phase,
    controller::{Controller, Speed},
    error::Error,
    event::{DeviceEvent, EndpointEvent, EndpointEventKind, Event, LinkState},
    ral,
    trb::Trb,
    Hardware, ENDPOINT_COUNT,
};

impl<H: Hardware> Controller<H> {
    /// Handle every pending event.
    ///
    /// Call this from the controller's interrupt handler. Returns `false`
    /// if there were no events, which means the interrupt came from
    /// elsewhere.
    pub fn handle_interrupt(&self) -> bool {
        let mut events = self.events.lock();
        let regs = ral::device(&self.hw);
        let pending = ral::read_reg!(ral, &regs, GEVNTCOUNT, COUNT);
        if pending == 0 {
            return false;
        }

        ral::modify_reg!(ral, &regs, GEVNTSIZ, INTMASK: 1);
        let dma = self.hw.dma_address(events.as_ptr());
        self.hw.sync_for_cpu(dma, events.size(), UsbDirection::Out);
        for _ in 0..pending / 4 {
            let event = Event::from(events.next());
            self.dispatch(event);
            ral::write_reg!(ral, &regs, GEVNTCOUNT, 4);
        }
        ral::modify_reg!(ral, &regs, GEVNTSIZ, INTMASK: 0);
        true
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::Endpoint(event) => self.endpoint_event(event),
            Event::Device(event) => self.device_event(event),
            Event::Unknown(raw) => debug!("EVENT {} IGNORED", raw),
        }
    }

    fn endpoint_event(&self, event: EndpointEvent) {
        let physical = event.physical;
        match event.kind {
            EndpointEventKind::TransferComplete => self.transfer_complete(physical),
            EndpointEventKind::TransferNotReady if physical < 2 => {
                self.ep0_not_ready(physical, event.control_stage())
            }
            EndpointEventKind::CommandComplete => self.command_complete(physical),
            kind => debug!("EP{} {:?}", physical, kind),
        }
    }

    fn transfer_complete(&self, physical: usize) {
        {
            let mut ep = self.endpoints[physical].lock();
            if !ep.active {
                debug!("EP{} COMPLETE WITHOUT TRANSFER", physical);
                return;
            }
            let trb = self.hw.dma_address((ep.trb as *const Trb).cast());
            self.hw
                .sync_for_cpu(trb, core::mem::size_of::<Trb>(), UsbDirection::Out);
            if ep.trb.is_hardware_owned() {
                warn!("EP{} TRB STILL OWNED", physical);
                return;
            }
            let transferred = ep.transfer_len.saturating_sub(ep.trb.bytes_remaining());
            if let Some(request) = ep.queue.first_mut() {
                request.set_actual(transferred as usize);
            }
            debug!("EP{} COMPLETE {}", physical, transferred);
        }
        self.complete(physical, 0, Ok(()));
    }

    /// An End Transfer finished; the endpoint takes commands again.
    fn command_complete(&self, physical: usize) {
        {
            let mut ep = self.endpoints[physical].lock();
            ep.not_ready = false;
            ep.ending = false;
            ep.replay(&self.hw, self.config.command_timeout_us);
        }
        self.kick(physical);
    }

    fn device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Disconnect => self.disconnect(),
            DeviceEvent::Reset => self.bus_reset(),
            DeviceEvent::ConnectDone => self.connect_done(),
            DeviceEvent::LinkStateChange(state) | DeviceEvent::Suspend(state) => {
                self.link_state_change(state)
            }
            DeviceEvent::Wakeup => self.link_state_change(LinkState::U0),
            event => debug!("DEVICE {:?}", event),
        }
    }

    fn bus_reset(&self) {
        debug!("RESET");
        let timeout = self.config.command_timeout_us;
        for physical in 2..ENDPOINT_COUNT {
            {
                let mut ep = self.endpoints[physical].lock();
                // Commands from before the reset are stale. An outstanding
                // End Transfer still holds the endpoint until it completes.
                ep.deferred.clear();
                ep.not_ready = ep.ending;
                if ep.halted {
                    if let Err(err) = ep.send(&self.hw, Command::clear_stall(), timeout) {
                        warn!("EP{} CLEAR STALL FAILED: {}", physical, err);
                    }
                    ep.halted = false;
                }
                if let Some(resource) = ep.resource.take() {
                    ep.active = false;
                    if let Err(err) = ep.send(&self.hw, Command::end_transfer(resource), timeout) {
                        warn!("EP{} END TRANSFER FAILED: {}", physical, err);
                    }
                    ep.trb.release();
                }
                ep.enabled = false;
            }
            self.kill_all(physical, Err(Error::ConnectionReset));
        }

        {
            let regs = ral::device(&self.hw);
            let mut device = self.device.lock();
            device.enabled &= 0b11;
            device.address = 0;
            device.config_started = false;
            device.remote_wakeup = false;
            device.u1_enabled = false;
            device.u2_enabled = false;
            let enabled = device.enabled;
            ral::write_reg!(ral, &regs, DALEPENA, enabled);
            ral::modify_reg!(ral, &regs, DCFG, DEVADDR: 0);
            ral::modify_reg!(
                ral,
                &regs,
                DCTL,
                ACCEPTU1ENA: 0,
                INITU1ENA: 0,
                ACCEPTU2ENA: 0,
                INITU2ENA: 0
            );
        }

        if let Some(gadget) = self.gadget() {
            gadget.reset(self);
        }
        if self.ep0_waiting_for_setup() {
            // The armed SETUP read takes the host's next SETUP packet.
            self.control.lock().reset(Phase::Setup);
        } else {
            self.ep0_restart();
        }
    }

    fn connect_done(&self) {
        let regs = ral::device(&self.hw);
        let speed = Speed::from_connect_speed(ral::read_reg!(ral, &regs, DSTS, CONNECTSPD));
        let (ep0_packet, limit) = speed.packet_sizes();
        {
            let mut device = self.device.lock();
            device.speed = Some(speed);
            device.connected = true;
        }
        for (physical, ep) in self.endpoints.iter().enumerate() {
            let mut ep = ep.lock();
            if physical < 2 {
                ep.max_packet = ep0_packet;
                self.activate(&mut ep, ConfigAction::Modify);
            } else if ep.max_packet > limit {
                ep.max_packet = limit;
            }
        }
        debug!("CONNECT {:?}", speed);
    }

    fn link_state_change(&self, state: LinkState) {
        let previous = self.device.lock().link.replace(state);
        debug!("LINK {:?}", state);
        let gadget = self.gadget();
        match state {
            LinkState::SsDisabled => self.disconnect(),
            LinkState::U3 if previous != Some(LinkState::U3) => {
                if let Some(gadget) = gadget {
                    gadget.suspend(self);
                }
            }
            LinkState::U0 | LinkState::Resume if previous == Some(LinkState::U3) => {
                if let Some(gadget) = gadget {
                    gadget.resume(self);
                }
            }
            _ => {}
        }
    }

    fn disconnect(&self) {
        let connected = {
            let mut device = self.device.lock();
            device.speed = None;
            core::mem::replace(&mut device.connected, false)
        };
        self.control.lock().phase = Phase::Unconnected;
        debug!("DISCONNECT");
        if connected {
            if let Some(gadget) = self.gadget() {
                gadget.disconnect(self);
            }
        }
    }
}
