//! Transfer Request Blocks (TRB)
//!
//! The module implements a RAL-compatible interface for working
//! with transfer request blocks. Each physical endpoint owns one TRB,
//! and the engine rewrites it for every transfer.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{ral, state::Word};

/// TRB control types used by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TrbType {
    Normal = 1,
    ControlSetup = 2,
    ControlStatus2 = 3,
    ControlStatus3 = 4,
    ControlData = 5,
}

#[repr(C, align(16))]
pub struct Trb {
    /// Buffer pointer, low word.
    pub BPL: Word,
    /// Buffer pointer, high word.
    pub BPH: Word,
    pub SIZE: Word,
    pub CTRL: Word,
}

impl Trb {
    pub const fn new() -> Self {
        Trb {
            BPL: Word::new(0),
            BPH: Word::new(0),
            SIZE: Word::new(0),
            CTRL: Word::new(0),
        }
    }

    /// Describe a single-TRB transfer of `len` bytes at `dma`, and hand
    /// the TRB to the controller.
    ///
    /// `short_packet` requests an interrupt when an OUT transfer ends
    /// with a short packet.
    pub fn prepare(&self, dma: u64, len: u32, kind: TrbType, short_packet: bool) {
        self.BPL.write(dma as u32);
        self.BPH.write((dma >> 32) as u32);
        ral::write_reg!(crate::trb, self, SIZE, BUFSIZ: len);
        ral::write_reg!(
            crate::trb,
            self,
            CTRL,
            HWO: 1,
            LST: 1,
            TRBCTL: kind as u32,
            ISP_IMI: short_packet as u32,
            IOC: 1
        );
    }

    /// Take the TRB back from the controller without a transfer.
    pub fn release(&self) {
        ral::modify_reg!(crate::trb, self, CTRL, HWO: 0);
    }

    /// Returns `true` while the controller owns the TRB.
    ///
    /// Don't trust [`bytes_remaining`](Trb::bytes_remaining) until this
    /// returns `false`.
    pub fn is_hardware_owned(&self) -> bool {
        ral::read_reg!(crate::trb, self, CTRL, HWO == 1)
    }

    /// Bytes the controller didn't transfer.
    pub fn bytes_remaining(&self) -> u32 {
        ral::read_reg!(crate::trb, self, SIZE, BUFSIZ)
    }

    /// Completion status written by the controller.
    pub fn status(&self) -> u32 {
        ral::read_reg!(crate::trb, self, SIZE, TRBSTS)
    }

    /// Returns the TRB type last written to this TRB.
    pub fn kind(&self) -> u32 {
        ral::read_reg!(crate::trb, self, CTRL, TRBCTL)
    }

    /// Returns the buffer address.
    pub fn buffer(&self) -> u64 {
        (u64::from(self.BPH.read()) << 32) | u64::from(self.BPL.read())
    }
}

pub mod SIZE {
    pub mod BUFSIZ {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF_FFFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod PCM1 {
        pub const offset: u32 = 24;
        pub const mask: u32 = 0x3 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TRBSTS {
        pub const offset: u32 = 28;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {
            pub const OK: u32 = 0;
            pub const MISSED_ISOC: u32 = 1;
            pub const SETUP_PENDING: u32 = 2;
        }
        pub mod W {}
    }
}

pub mod CTRL {
    /// Hardware owner
    pub mod HWO {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Last TRB
    pub mod LST {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Chain buffer
    pub mod CHN {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Continue on short packet
    pub mod CSP {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TRBCTL {
        pub const offset: u32 = 4;
        pub const mask: u32 = 0x3F << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Interrupt on short packet, or on missed isochronous interval
    pub mod ISP_IMI {
        pub const offset: u32 = 10;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Interrupt on complete
    pub mod IOC {
        pub const offset: u32 = 11;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Stream ID, or isochronous frame number
    pub mod SID {
        pub const offset: u32 = 14;
        pub const mask: u32 = 0xFFFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}


const _: [(); 1] = [(); (core::mem::size_of::<Trb>() == 16) as usize];
