//! # Platform capabilities
//!
//! Everything the driver core needs from the board or SoC: power switches, card detect and
//! write protect lines, IO timing, drive strength, timers and DMA mapping.
use embedded_hal::delay::DelayNs;

use crate::{
    SlotId,
    clock::ClockControl,
    request::{Direction, Request},
    time::{Hertz, Milliseconds},
};

/// Bus timing mode of a slot.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Timing {
    #[default]
    Legacy,
    MmcHighSpeed,
    SdHighSpeed,
    UhsSdr12,
    UhsSdr25,
    UhsSdr50,
    UhsSdr104,
    UhsDdr50,
    MmcHs200,
    /// HS200 with DDR sampling.
    MmcHs200Ddr,
}

impl Timing {
    /// Timing modes which sample data on both clock edges.
    #[inline]
    pub const fn is_ddr(self) -> bool {
        matches!(self, Timing::UhsDdr50 | Timing::MmcHs200Ddr)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SignalVoltage {
    #[default]
    V330,
    V180,
    V120,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum BusWidth {
    #[default]
    One,
    Four,
    Eight,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum PowerMode {
    #[default]
    Off,
    /// Power is being applied. The next command is preceded by initialization clocks.
    Up,
    On,
}

/// Bus settings requested for one slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusParameters {
    pub width: BusWidth,
    /// Card clock. Zero stops the clock.
    pub clock: Hertz,
    pub timing: Timing,
    pub signal_voltage: SignalVoltage,
    pub power: PowerMode,
}

impl BusParameters {
    pub const fn new(
        width: BusWidth,
        clock: Hertz,
        timing: Timing,
        signal_voltage: SignalVoltage,
        power: PowerMode,
    ) -> Self {
        Self {
            width,
            clock,
            timing,
            signal_voltage,
            power,
        }
    }
}

/// Board specific operations.
///
/// Only power switching and the two timers are mandatory. All other hooks default to the
/// behaviour of a board without the respective feature.
pub trait Board: DelayNs {
    /// Switches for the bus interface and card clock domains.
    type Clocks: ClockControl;

    fn set_power(&mut self, slot: SlotId, on: bool);

    /// Card detect line, if the board routes it outside the controller.
    fn card_detect(&mut self, _slot: SlotId) -> Option<bool> {
        None
    }

    /// Write protect switch, if the board routes it outside the controller.
    fn write_protect(&mut self, _slot: SlotId) -> Option<bool> {
        None
    }

    /// Route a shared bus to the given slot.
    fn select_slot(&mut self, _slot: SlotId) {}

    /// Apply pad and clock phase settings for a timing mode.
    fn set_io_timing(&mut self, _slot: SlotId, _timing: Timing, _tuning: bool) {}

    /// Switch the IO supply. Returns false if the board has no regulator for it, in which case
    /// the controller's own voltage select bit is used.
    fn set_signal_voltage(&mut self, _slot: SlotId, _voltage: SignalVoltage) -> bool {
        false
    }

    /// Pulse the hardware reset line of an eMMC device.
    fn hardware_reset(&mut self, _slot: SlotId) {}

    fn save_drive_strength(&mut self, _slot: SlotId) {}

    /// Change the pad drive strength before another tuning scan.
    fn tuning_drive_strength(&mut self, _slot: SlotId) {}

    /// Restore the saved drive strength. Returns a compensation in sample phase steps which is
    /// added to the tuned phase.
    fn restore_drive_strength(&mut self, _slot: SlotId) -> i8 {
        0
    }

    /// Start the request watchdog. On expiry, the board calls
    /// [crate::Host::on_request_timeout].
    fn arm_request_watchdog(&mut self, timeout: Milliseconds);
    fn disarm_request_watchdog(&mut self);

    /// Start the software data timeout monitor. On expiry, the board calls
    /// [crate::Host::on_data_timeout_tick].
    fn arm_data_timeout_monitor(&mut self, period: Milliseconds);
    fn disarm_data_timeout_monitor(&mut self);

    /// Make a buffer visible to the DMA controller and return its bus address.
    ///
    /// The default assumes an identity mapped, cache coherent 32-bit system.
    fn map_dma(&mut self, buf: &mut [u8], _direction: Direction) -> u32 {
        buf.as_mut_ptr() as usize as u32
    }

    fn unmap_dma(&mut self, _bus_addr: u32, _len: usize, _direction: Direction) {}
}

/// Completion and event callbacks towards the storage stack.
pub trait HostNotifier {
    /// Called exactly once per accepted request, in submission order per slot.
    fn request_done(&mut self, slot: SlotId, request: Request);

    fn card_detect_changed(&mut self, _slot: SlotId, _present: bool) {}

    fn sdio_interrupt(&mut self, _slot: SlotId) {}
}
