//! A simulated controller for tests
//!
//! `MockHardware` keeps a register file, records endpoint commands, and
//! completes them immediately. Tests play the host by writing into the
//! event buffer and the TRBs.

extern crate std;

use core::{cell::RefCell, ptr};
use std::{boxed::Box, vec, vec::Vec};

use usb_device::{endpoint::EndpointAddress, UsbDirection};

use crate::{
    command::CommandKind,
    control::SetupPacket,
    controller::{Config, Controller, Speed},
    endpoint::EndpointDescriptor,
    error::Error,
    gadget::{Gadget, Udc},
    ral::offsets,
    request::Request,
    state::{ControllerMemory, Word},
    trb::Trb,
    Hardware, ENDPOINT_COUNT,
};

const REGISTER_WINDOW: usize = 0xd000;
const CSFTRST: u32 = 1 << 30;
const RUN_STOP: u32 = 1 << 31;
const DEVCTRLHLT: u32 = 1 << 22;
const CMDACT: u32 = 1 << 10;

/// An endpoint command, as the controller saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IssuedCommand {
    pub physical: usize,
    pub kind: CommandKind,
    /// Parameters 0, 1, and 2.
    pub params: [u32; 3],
    pub word: u32,
}

struct State {
    registers: Vec<u32>,
    commands: Vec<IssuedCommand>,
    stuck: bool,
    command_status: u32,
    now: u64,
    event_cursor: usize,
    transfers: [u64; ENDPOINT_COUNT],
    fail_map: bool,
    mappings: usize,
}

pub struct MockHardware {
    state: spin::Mutex<State>,
}

impl MockHardware {
    pub fn new() -> Self {
        let mut registers = vec![0; REGISTER_WINDOW / 4];
        registers[offsets::DSTS / 4] = DEVCTRLHLT;
        MockHardware {
            state: spin::Mutex::new(State {
                registers,
                commands: Vec::new(),
                stuck: false,
                command_status: 0,
                now: 0,
                event_cursor: 0,
                transfers: [0; ENDPOINT_COUNT],
                fail_map: false,
                mappings: 0,
            }),
        }
    }

    pub fn register(&self, offset: usize) -> u32 {
        self.state.lock().registers[offset / 4]
    }

    pub fn set_register(&self, offset: usize, value: u32) {
        self.state.lock().registers[offset / 4] = value;
    }

    pub fn commands(&self) -> Vec<IssuedCommand> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Count the Start Transfer commands sent to `physical`.
    pub fn starts(&self, physical: usize) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|command| {
                command.physical == physical && command.kind == CommandKind::StartTransfer
            })
            .count()
    }

    /// Commands never finish while stuck.
    pub fn set_stuck(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    pub fn set_command_status(&self, status: u32) {
        self.state.lock().command_status = status;
    }

    pub fn fail_map(&self, fail: bool) {
        self.state.lock().fail_map = fail;
    }

    /// Outstanding mappings made through `map`.
    pub fn mappings(&self) -> usize {
        self.state.lock().mappings
    }

    /// Write an event record, and count it in GEVNTCOUNT.
    pub fn push_event(&self, raw: u32) {
        let mut state = self.state.lock();
        let base = u64::from(state.registers[offsets::GEVNTADRLO / 4])
            | u64::from(state.registers[offsets::GEVNTADRHI / 4]) << 32;
        let words = (state.registers[offsets::GEVNTSIZ / 4] & 0xFFFF) as usize / 4;
        assert!(base != 0 && words != 0, "event buffer not set up");
        let word = unsafe { &*(base as usize as *const Word).add(state.event_cursor) };
        word.write(raw);
        state.event_cursor = (state.event_cursor + 1) % words;
        state.registers[offsets::GEVNTCOUNT / 4] += 4;
    }

    /// The TRB from the last Start Transfer on `physical`.
    pub fn trb(&self, physical: usize) -> &'static Trb {
        let dma = self.state.lock().transfers[physical];
        assert_ne!(dma, 0, "no transfer started on EP{physical}");
        unsafe { &*(dma as usize as *const Trb) }
    }

    /// Finish the transfer on `physical` after moving `transferred` bytes.
    pub fn complete_transfer(&self, physical: usize, transferred: u32) {
        let trb = self.trb(physical);
        let remaining = trb.bytes_remaining().saturating_sub(transferred);
        trb.SIZE.write(trb.SIZE.read() & !0xFF_FFFF | remaining);
        trb.release();
        self.push_event(endpoint_event(physical, 1, 0));
    }

    /// Write into the buffer of the transfer on `physical`.
    pub fn write_buffer(&self, physical: usize, data: &[u8]) {
        let buffer = self.trb(physical).buffer() as usize as *mut u8;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), buffer, data.len()) };
    }

    /// Read from the buffer of the transfer on `physical`.
    pub fn read_buffer(&self, physical: usize, len: usize) -> Vec<u8> {
        let buffer = self.trb(physical).buffer() as usize as *const u8;
        unsafe { core::slice::from_raw_parts(buffer, len) }.to_vec()
    }

    /// Deliver a SETUP packet on endpoint 0.
    pub fn setup(&self, packet: [u8; 8]) {
        self.write_buffer(0, &packet);
        self.complete_transfer(0, 8);
    }
}

impl State {
    fn command(&mut self, physical: usize, word: u32) {
        let params = [
            self.registers[offsets::depcmdpar0(physical) / 4],
            self.registers[offsets::depcmdpar1(physical) / 4],
            self.registers[offsets::depcmdpar2(physical) / 4],
        ];
        let kind = CommandKind::from_bits(word & 0xF).expect("unknown command type");
        self.commands.push(IssuedCommand {
            physical,
            kind,
            params,
            word,
        });

        let mut result = word;
        if !self.stuck {
            result &= !(CMDACT | 0xF << 12);
            result |= (self.command_status & 0xF) << 12;
            if kind == CommandKind::StartTransfer && self.command_status == 0 {
                result = result & !(0x7F << 16) | (physical as u32 + 1) << 16;
                self.transfers[physical] = u64::from(params[0]) << 32 | u64::from(params[1]);
            }
        }
        self.registers[offsets::depcmd(physical) / 4] = result;
    }
}

impl Hardware for MockHardware {
    fn read(&self, offset: usize) -> u32 {
        self.register(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        let commands = offsets::DEPCMD_BASE..offsets::depcmd(ENDPOINT_COUNT);
        match offset {
            offsets::DCTL => {
                state.registers[offset / 4] = value & !CSFTRST;
                let dsts = &mut state.registers[offsets::DSTS / 4];
                if value & RUN_STOP != 0 {
                    *dsts &= !DEVCTRLHLT;
                } else {
                    *dsts |= DEVCTRLHLT;
                }
            }
            offsets::GEVNTCOUNT => {
                let count = &mut state.registers[offset / 4];
                *count = count.saturating_sub(value & 0xFFFF);
            }
            offset if commands.contains(&offset) && offset % offsets::DEPCMD_STRIDE == 0xc => {
                let physical = (offset - offsets::DEPCMD_BASE) / offsets::DEPCMD_STRIDE;
                state.command(physical, value);
            }
            _ => state.registers[offset / 4] = value,
        }
    }

    fn now_us(&self) -> u64 {
        let mut state = self.state.lock();
        state.now += 1;
        state.now
    }

    fn map(&self, ptr: *const u8, _: usize, _: UsbDirection) -> Option<u64> {
        let mut state = self.state.lock();
        if state.fail_map {
            return None;
        }
        state.mappings += 1;
        Some(ptr as usize as u64)
    }

    fn unmap(&self, _: u64, _: usize, _: UsbDirection) {
        self.state.lock().mappings -= 1;
    }
}

/// An endpoint event record.
pub fn endpoint_event(physical: usize, kind: u32, status: u32) -> u32 {
    (physical as u32) << 1 | kind << 6 | status << 12
}

/// A device event record.
pub fn device_event(event: u32, info: u32) -> u32 {
    1 | event << 8 | info << 16
}

/// An initialized controller, not connected.
pub fn controller() -> Controller<MockHardware> {
    let memory: &'static ControllerMemory = Box::leak(Box::new(ControllerMemory::new()));
    let udc = Controller::new(MockHardware::new(), memory, Config::default());
    udc.initialize().unwrap();
    udc
}

/// A controller that the host reset and connected at `speed`.
pub fn connected(speed: Speed) -> Controller<MockHardware> {
    let udc = controller();
    udc.start();
    let code = match speed {
        Speed::Super => 4,
        Speed::High => 0,
        Speed::Full => 1,
        Speed::Low => 2,
    };
    let hw = udc.hardware();
    hw.set_register(offsets::DSTS, hw.register(offsets::DSTS) & !0x7 | code);
    hw.push_event(device_event(1, 0));
    hw.push_event(device_event(2, 0));
    assert!(udc.handle_interrupt());
    completions();
    udc
}

pub fn bulk(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address: EndpointAddress::from(address),
        kind: usb_device::endpoint::EndpointType::Bulk,
        max_packet_size,
        interval: 0,
        max_burst: 0,
    }
}

/// A request on a fresh buffer that records its completion.
pub fn request(udc: &dyn Udc, len: usize, context: usize) -> Request {
    let mut request = udc.alloc_request(Box::leak(vec![0; len].into_boxed_slice()));
    request.set_complete(record);
    request.set_context(context);
    request
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub address: EndpointAddress,
    pub context: usize,
    pub result: Option<Result<(), Error>>,
    pub actual: usize,
}

std::thread_local! {
    static COMPLETIONS: RefCell<Vec<Completion>> = const { RefCell::new(Vec::new()) };
}

pub fn record(_: &dyn Udc, address: EndpointAddress, request: Request) {
    COMPLETIONS.with(|completions| {
        completions.borrow_mut().push(Completion {
            address,
            context: request.context(),
            result: request.result(),
            actual: request.actual(),
        })
    });
}

/// Queue the request again the first time it completes.
pub fn requeue_once(udc: &dyn Udc, address: EndpointAddress, mut request: Request) {
    if request.context() == 0 {
        request.set_context(1);
        request.set_complete(record);
        if let Err(rejected) = udc.queue(address, request) {
            panic!("requeue failed: {:?}", rejected.error);
        }
    } else {
        record(udc, address, request);
    }
}

/// Take the completions recorded on this thread.
pub fn completions() -> Vec<Completion> {
    COMPLETIONS.with(RefCell::take)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upcall {
    Setup(SetupPacket),
    Disconnect,
    Reset,
    Suspend,
    Resume,
}

pub struct TestGadget {
    accept: bool,
    upcalls: spin::Mutex<Vec<Upcall>>,
}

impl TestGadget {
    pub fn upcalls(&self) -> Vec<Upcall> {
        self.upcalls.lock().clone()
    }

    fn upcall(&self, upcall: Upcall) {
        self.upcalls.lock().push(upcall);
    }
}

/// A gadget that accepts (or stalls) every control request it sees.
///
/// Accepted IN requests get a data stage of the requested length.
pub fn gadget(accept: bool) -> &'static TestGadget {
    Box::leak(Box::new(TestGadget {
        accept,
        upcalls: spin::Mutex::new(Vec::new()),
    }))
}

impl Gadget for TestGadget {
    fn setup(&self, udc: &dyn Udc, packet: &SetupPacket) -> Result<(), Error> {
        self.upcall(Upcall::Setup(*packet));
        if !self.accept {
            return Err(Error::Unsupported);
        }
        if packet.length > 0 && packet.direction() == UsbDirection::In {
            let mut data = request(udc, packet.length.into(), 0);
            data.buffer_mut().fill(0xA5);
            udc.queue(EndpointAddress::from_parts(0, UsbDirection::In), data)
                .map_err(|rejected| rejected.error)?;
        }
        Ok(())
    }

    fn disconnect(&self, _: &dyn Udc) {
        self.upcall(Upcall::Disconnect);
    }

    fn reset(&self, _: &dyn Udc) {
        self.upcall(Upcall::Reset);
    }

    fn suspend(&self, _: &dyn Udc) {
        self.upcall(Upcall::Suspend);
    }

    fn resume(&self, _: &dyn Udc) {
        self.upcall(Upcall::Resume);
    }
}
