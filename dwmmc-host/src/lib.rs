//! # Driver core for DesignWare MMC host controllers
//!
//! This crate drives the Synopsys DesignWare Mobile Storage Host controller found in many SoCs.
//! It sits on top of the [register definitions](dwmmc) and implements everything between an
//! MMC/SD/SDIO protocol stack and the hardware:
//!
//! - a request state machine for command, data and stop phases ([Host]),
//! - internal DMA with a descriptor ring and a PIO fallback,
//! - card clock programming, card detect handling and signal voltage switching,
//! - sample phase tuning for high speed modes ([tuning]).
//!
//! The board or SoC integration is supplied through the [Board] trait, completed requests are
//! handed back through [HostNotifier]. [SharedHost] allows to share a [Host] between the
//! interrupt handler and the deferred work.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod board;
pub mod clock;
pub mod config;
pub mod dma;
pub mod error;
pub mod host;
pub mod pio;
pub mod regs;
pub mod request;
pub mod shared;
pub mod state;
pub mod time;
pub mod tuning;

#[cfg(test)]
pub(crate) mod sim;

pub use board::{Board, BusParameters, BusWidth, HostNotifier, PowerMode, SignalVoltage, Timing};
pub use clock::{ClockControl, ClockDomain, ClockGate, ClockGuard};
pub use config::{HostConfig, Quirks};
pub use dma::{Descriptor, DescriptorList, DescriptorRing};
pub use error::{DmaBuildError, Error, ProbeError, ResetTimeout, SubmitError};
pub use host::{Diagnostics, Host, InterruptResult, Submission};
pub use regs::{DataWidth, HostRegisters, MmioHost};
pub use request::{Command, Data, Direction, Request, ResponseType};
pub use shared::SharedHost;
pub use state::State;
pub use tuning::{TuningRun, TuningStart};

/// Maximum number of card slots of one controller.
pub const MAX_SLOTS: usize = 4;
/// Number of requests which can wait behind the active one.
pub const QUEUE_DEPTH: usize = 8;

/// Card slot of a controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u8);

impl SlotId {
    #[inline]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl From<u8> for SlotId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}
