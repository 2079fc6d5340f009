//! Endpoint commands
//!
//! The controller accepts one command per physical endpoint at a time.
//! [`issue`] writes the parameters and the command word, then polls until
//! the controller clears the active bit.

use crate::{error::Error, hardware, ral, Hardware};

/// Endpoint command types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandKind {
    SetEndpointConfig = 1,
    SetTransferResource = 2,
    GetEndpointState = 3,
    SetStall = 4,
    ClearStall = 5,
    StartTransfer = 6,
    UpdateTransfer = 7,
    EndTransfer = 8,
    StartNewConfig = 9,
}

impl CommandKind {
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            1 => Self::SetEndpointConfig,
            2 => Self::SetTransferResource,
            3 => Self::GetEndpointState,
            4 => Self::SetStall,
            5 => Self::ClearStall,
            6 => Self::StartTransfer,
            7 => Self::UpdateTransfer,
            8 => Self::EndTransfer,
            9 => Self::StartNewConfig,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Endpoint events enabled by a Set Endpoint Configuration command.
    ///
    /// Bits are positioned for parameter 1.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventEnable: u32 {
        const TRANSFER_COMPLETE = 1 << 8;
        const TRANSFER_IN_PROGRESS = 1 << 9;
        const TRANSFER_NOT_READY = 1 << 10;
        const FIFO_ERROR = 1 << 11;
        const STREAM = 1 << 13;
    }
}

/// How a Set Endpoint Configuration command treats the endpoint's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ConfigAction {
    Init = 0,
    Restore = 1,
    Modify = 2,
}

/// A command for one physical endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    /// Parameters 0, 1, and 2.
    pub params: [u32; 3],
    /// Command-specific field in the command word.
    pub param: u8,
    /// Ask for a command complete event.
    pub ioc: bool,
    pub force: bool,
}

impl Command {
    pub const fn new(kind: CommandKind) -> Self {
        Command {
            kind,
            params: [0; 3],
            param: 0,
            ioc: false,
            force: false,
        }
    }

    /// Start a new configuration. Sent to physical endpoint 0.
    ///
    /// `resource` is the first transfer resource to assign; 0 while
    /// bringing up endpoint 0, and 2 for the first other endpoint.
    pub const fn start_new_config(resource: u8) -> Self {
        Command {
            param: resource,
            ..Self::new(CommandKind::StartNewConfig)
        }
    }

    pub const fn set_endpoint_config(param0: u32, param1: u32) -> Self {
        Command {
            params: [param0, param1, 0],
            ..Self::new(CommandKind::SetEndpointConfig)
        }
    }

    /// Reserve one transfer resource for the endpoint.
    pub const fn set_transfer_resource() -> Self {
        Command {
            params: [1, 0, 0],
            ..Self::new(CommandKind::SetTransferResource)
        }
    }

    pub const fn set_stall() -> Self {
        Self::new(CommandKind::SetStall)
    }

    pub const fn clear_stall() -> Self {
        Self::new(CommandKind::ClearStall)
    }

    /// Start a transfer described by the TRB at `trb`.
    pub const fn start_transfer(trb: u64) -> Self {
        Command {
            params: [(trb >> 32) as u32, trb as u32, 0],
            ..Self::new(CommandKind::StartTransfer)
        }
    }

    /// Forcibly end the transfer using `resource`, and report completion
    /// with an event.
    pub const fn end_transfer(resource: u8) -> Self {
        Command {
            param: resource,
            ioc: true,
            force: true,
            ..Self::new(CommandKind::EndTransfer)
        }
    }
}

/// The outcome of sending a command to an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Issued {
    /// The controller completed the command.
    Done {
        /// Transfer resource index reported by the controller.
        resource: u8,
    },
    /// The endpoint wasn't ready, so the command waits for the next
    /// command complete event.
    Deferred,
}

/// Issue `command` to physical endpoint `physical`, and wait for it to
/// complete.
///
/// Returns the transfer resource index reported by the controller.
pub(crate) fn issue<H: Hardware + ?Sized>(
    hw: &H,
    physical: usize,
    command: &Command,
    timeout_us: u32,
) -> Result<u8, Error> {
    let regs = ral::endpoint_command::register(hw, physical);
    let [param0, param1, param2] = command.params;
    ral::write_reg!(ral, &regs, DEPCMDPAR2, param2);
    ral::write_reg!(ral, &regs, DEPCMDPAR1, param1);
    ral::write_reg!(ral, &regs, DEPCMDPAR0, param0);
    ral::write_reg!(
        ral,
        &regs,
        DEPCMD,
        CMDTYP: command.kind as u32,
        CMDIOC: command.ioc as u32,
        HIPRI_FORCERM: command.force as u32,
        PARAM: u32::from(command.param),
        CMDACT: 1
    );

    if !hardware::poll(hw, timeout_us, || {
        ral::read_reg!(ral, &regs, DEPCMD, CMDACT == 0)
    }) {
        warn!("EP{} CMD {} TIMEOUT", physical, command.kind as u32);
        return Err(Error::CommandTimeout);
    }

    let (status, resource) = ral::read_reg!(ral, &regs, DEPCMD, CMDSTATUS, PARAM);
    if status != 0 {
        warn!("EP{} CMD {} STATUS {}", physical, command.kind as u32, status);
        return Err(Error::CommandFailed(status as u8));
    }
    Ok(resource as u8)
}
