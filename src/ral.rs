//! DWC3 registers, with a RAL-compatible interface
//!
//! Registers are reached through [`Hardware`], so each register in a view
//! is a [`Reg`] that knows its offset. The field modules follow the
//! `ral-registers` layout, so the `read_reg!`, `write_reg!`, and
//! `modify_reg!` macros work on the views.
//!
//! Use [`device`] for the global and device registers, and
//! [`endpoint_command::register`] for an endpoint's command registers.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::hardware::Hardware;

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Register offsets in the controller's window.
pub mod offsets {
    pub const GCTL: usize = 0xc110;
    pub const GEVNTADRLO: usize = 0xc400;
    pub const GEVNTADRHI: usize = 0xc404;
    pub const GEVNTSIZ: usize = 0xc408;
    pub const GEVNTCOUNT: usize = 0xc40c;
    pub const DCFG: usize = 0xc700;
    pub const DCTL: usize = 0xc704;
    pub const DEVTEN: usize = 0xc708;
    pub const DSTS: usize = 0xc70c;
    pub const DALEPENA: usize = 0xc720;

    /// Start of the per-endpoint command registers.
    pub const DEPCMD_BASE: usize = 0xc800;
    /// Stride between two physical endpoints' command registers.
    pub const DEPCMD_STRIDE: usize = 0x10;

    pub const fn depcmdpar2(physical: usize) -> usize {
        DEPCMD_BASE + physical * DEPCMD_STRIDE
    }
    pub const fn depcmdpar1(physical: usize) -> usize {
        depcmdpar2(physical) + 0x4
    }
    pub const fn depcmdpar0(physical: usize) -> usize {
        depcmdpar2(physical) + 0x8
    }
    pub const fn depcmd(physical: usize) -> usize {
        depcmdpar2(physical) + 0xc
    }
}

/// One 32-bit register in the window.
pub struct Reg<'a, H: ?Sized> {
    hw: &'a H,
    offset: usize,
}

impl<'a, H: Hardware + ?Sized> Reg<'a, H> {
    fn new(hw: &'a H, offset: usize) -> Self {
        Reg { hw, offset }
    }
    pub fn read(&self) -> u32 {
        self.hw.read(self.offset)
    }
    pub fn write(&self, value: u32) {
        self.hw.write(self.offset, value)
    }
}

/// Global and device registers.
pub struct Instance<'a, H: ?Sized> {
    pub GCTL: Reg<'a, H>,
    pub GEVNTADRLO: Reg<'a, H>,
    pub GEVNTADRHI: Reg<'a, H>,
    pub GEVNTSIZ: Reg<'a, H>,
    pub GEVNTCOUNT: Reg<'a, H>,
    pub DCFG: Reg<'a, H>,
    pub DCTL: Reg<'a, H>,
    pub DEVTEN: Reg<'a, H>,
    pub DSTS: Reg<'a, H>,
    pub DALEPENA: Reg<'a, H>,
}

/// Returns the global and device registers, using event buffer 0.
pub fn device<H: Hardware + ?Sized>(hw: &H) -> Instance<'_, H> {
    Instance {
        GCTL: Reg::new(hw, offsets::GCTL),
        GEVNTADRLO: Reg::new(hw, offsets::GEVNTADRLO),
        GEVNTADRHI: Reg::new(hw, offsets::GEVNTADRHI),
        GEVNTSIZ: Reg::new(hw, offsets::GEVNTSIZ),
        GEVNTCOUNT: Reg::new(hw, offsets::GEVNTCOUNT),
        DCFG: Reg::new(hw, offsets::DCFG),
        DCTL: Reg::new(hw, offsets::DCTL),
        DEVTEN: Reg::new(hw, offsets::DEVTEN),
        DSTS: Reg::new(hw, offsets::DSTS),
        DALEPENA: Reg::new(hw, offsets::DALEPENA),
    }
}

/// The per-endpoint command registers are identical, but live at
/// different offsets. This module hands out a view for one physical
/// endpoint.
pub mod endpoint_command {
    use super::{offsets, Hardware, Reg};

    pub struct EpCmd<'a, H: ?Sized> {
        pub DEPCMDPAR2: Reg<'a, H>,
        pub DEPCMDPAR1: Reg<'a, H>,
        pub DEPCMDPAR0: Reg<'a, H>,
        pub DEPCMD: Reg<'a, H>,
    }

    pub fn register<H: Hardware + ?Sized>(hw: &H, physical: usize) -> EpCmd<'_, H> {
        assert!(physical < crate::ENDPOINT_COUNT, "DEPCMD{} doesn't exist", physical);
        EpCmd {
            DEPCMDPAR2: Reg::new(hw, offsets::depcmdpar2(physical)),
            DEPCMDPAR1: Reg::new(hw, offsets::depcmdpar1(physical)),
            DEPCMDPAR0: Reg::new(hw, offsets::depcmdpar0(physical)),
            DEPCMD: Reg::new(hw, offsets::depcmd(physical)),
        }
    }
}

pub mod GCTL {
    pub mod CORESOFTRESET {
        pub const offset: u32 = 11;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

pub mod GEVNTSIZ {
    /// Event buffer size, in bytes.
    pub mod SIZE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFFFF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod INTMASK {
        pub const offset: u32 = 31;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

pub mod GEVNTCOUNT {
    /// Bytes of pending events. Writing a value acknowledges that many bytes.
    pub mod COUNT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFFFF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

pub mod DCFG {
    pub mod DEVSPD {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x7 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {
            pub const HIGH: u32 = 0;
            pub const FULL: u32 = 1;
            pub const LOW: u32 = 2;
            pub const SUPER: u32 = 4;
        }
    }
    pub mod DEVADDR {
        pub const offset: u32 = 3;
        pub const mask: u32 = 0x7F << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Number of receive buffers the device advertises.
    pub mod NUMP {
        pub const offset: u32 = 17;
        pub const mask: u32 = 0x1F << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod LPM_CAP {
        pub const offset: u32 = 22;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

pub mod DCTL {
    pub mod TSTCTRL {
        pub const offset: u32 = 1;
        pub const mask: u32 = 0xF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod ULSTCHNGREQ {
        pub const offset: u32 = 5;
        pub const mask: u32 = 0xF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod ACCEPTU1ENA {
        pub const offset: u32 = 9;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod INITU1ENA {
        pub const offset: u32 = 10;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod ACCEPTU2ENA {
        pub const offset: u32 = 11;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod INITU2ENA {
        pub const offset: u32 = 12;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod CSFTRST {
        pub const offset: u32 = 30;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod RUN_STOP {
        pub const offset: u32 = 31;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

pub mod DEVTEN {
    pub mod DISCONNEVTEN {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod USBRSTEN {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod CONNECTDONEEN {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod ULSTCNGEN {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod WKUPEVTEN {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

pub mod DSTS {
    pub mod CONNECTSPD {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x7 << offset;
        pub mod R {
            pub const HIGH: u32 = 0;
            pub const FULL_30_60: u32 = 1;
            pub const LOW: u32 = 2;
            pub const FULL_48: u32 = 3;
            pub const SUPER: u32 = 4;
            pub const SUPER_PLUS: u32 = 5;
        }
        pub mod W {}
        pub mod RW {}
    }
    pub mod USBLNKST {
        pub const offset: u32 = 18;
        pub const mask: u32 = 0xF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod DEVCTRLHLT {
        pub const offset: u32 = 22;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

pub mod DEPCMD {
    pub mod CMDTYP {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod CMDIOC {
        pub const offset: u32 = 8;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod CMDACT {
        pub const offset: u32 = 10;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Forces an End Transfer, or gives a Start Transfer high priority.
    pub mod HIPRI_FORCERM {
        pub const offset: u32 = 11;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    pub mod CMDSTATUS {
        pub const offset: u32 = 12;
        pub const mask: u32 = 0xF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Command parameter on write, transfer resource index on read.
    pub mod PARAM {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7F << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}
