//! # Clock gating and card clock control
//!
//! The controller has two clock domains. The bus interface clock is required for any register
//! access, the card clock drives the card interface unit. Both are reference counted through
//! [ClockGuard]s on a shared [ClockGate], so several users can keep a domain running.
//!
//! This module is also the only place which writes the card clock enable register.
use core::sync::atomic::{AtomicU32, Ordering, fence};

use arbitrary_int::u5;
use dwmmc::{ClockEnable, Command, Control};
use embedded_hal::delay::DelayNs;

use crate::{
    SlotId,
    error::ResetTimeout,
    regs::{HostRegisters, poll_until, wait_reset},
    time::Hertz,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockDomain {
    /// Bus interface clock. Required to access registers.
    BusInterface = 0,
    /// Card interface unit clock.
    Card = 1,
}

/// Platform clock switch for both domains.
pub trait ClockControl {
    fn set_enabled(&self, domain: ClockDomain, enabled: bool);
}

/// Enable counted access to the two clock domains.
///
/// A domain is switched on when the first guard for it is acquired and switched off when the
/// last guard is dropped. The count and the switch are updated together inside a critical
/// section.
pub struct ClockGate<C: ClockControl> {
    control: C,
    counts: [AtomicU32; 2],
}

impl<C: ClockControl> ClockGate<C> {
    pub const fn new(control: C) -> Self {
        Self {
            control,
            counts: [AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    pub fn acquire(&self, domain: ClockDomain) -> ClockGuard<'_, C> {
        critical_section::with(|_| {
            let count = self.counts[domain as usize].load(Ordering::Relaxed);
            if count == 0 {
                self.control.set_enabled(domain, true);
            }
            self.counts[domain as usize].store(count + 1, Ordering::Relaxed);
        });
        ClockGuard { gate: self, domain }
    }

    /// Number of live guards for the given domain.
    #[inline]
    pub fn enable_count(&self, domain: ClockDomain) -> u32 {
        self.counts[domain as usize].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn control(&self) -> &C {
        &self.control
    }

    fn release(&self, domain: ClockDomain) {
        critical_section::with(|_| {
            let count = self.counts[domain as usize].load(Ordering::Relaxed);
            if count <= 1 {
                self.counts[domain as usize].store(0, Ordering::Relaxed);
                self.control.set_enabled(domain, false);
            } else {
                self.counts[domain as usize].store(count - 1, Ordering::Relaxed);
            }
        });
    }
}

/// Keeps a clock domain enabled while alive.
pub struct ClockGuard<'a, C: ClockControl> {
    gate: &'a ClockGate<C>,
    domain: ClockDomain,
}

impl<C: ClockControl> ClockGuard<'_, C> {
    #[inline]
    pub fn domain(&self) -> ClockDomain {
        self.domain
    }
}

impl<C: ClockControl> core::fmt::Debug for ClockGuard<'_, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClockGuard")
            .field("domain", &self.domain)
            .field("count", &self.gate.enable_count(self.domain))
            .finish()
    }
}

impl<C: ClockControl> Drop for ClockGuard<'_, C> {
    fn drop(&mut self) {
        self.gate.release(self.domain);
    }
}

/// Card clock divider. The card clock is `bus / (2 * divider)`, a divider of 0 bypasses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardClockDivider {
    divider: u8,
    actual: Hertz,
}

impl CardClockDivider {
    /// Calculate the divider which does not exceed the target clock, if possible.
    ///
    /// Returns [None] for a zero bus or target clock.
    pub fn calculate(bus: Hertz, target: Hertz) -> Option<Self> {
        let bus = bus.raw();
        let target = target.raw();
        if bus == 0 || target == 0 {
            return None;
        }
        let mut div = bus / target;
        if bus % target != 0 && bus > target {
            div += 1;
        }
        let div = if bus != target {
            div.div_ceil(2).min(0xFF)
        } else {
            0
        };
        let actual = if div == 0 { bus } else { (bus / div) >> 1 };
        Some(Self {
            divider: div as u8,
            actual: Hertz::from_raw(actual),
        })
    }

    #[inline]
    pub const fn divider(&self) -> u8 {
        self.divider
    }

    /// Resulting card clock.
    #[inline]
    pub const fn actual(&self) -> Hertz {
        self.actual
    }
}

/// The start bit is polled for 10 ms in 1 us steps.
const CIU_COMMAND_POLLS: u32 = 10_000;
const CIU_COMMAND_TRIES: u32 = 50;

/// Send an update-clock-only command so the card interface unit takes over the clock
/// registers.
pub(crate) fn update_clock_registers<R: HostRegisters, D: DelayNs>(
    regs: &mut R,
    delay: &mut D,
    slot: SlotId,
) -> Result<(), ResetTimeout> {
    let cmd = Command::new_with_raw_value(0)
        .with_update_clock_registers_only(true)
        .with_wait_previous_data_complete(true)
        .with_card_number(u5::new(slot.value()));
    send_ciu_command(regs, delay, cmd, 0)
}

/// Write a command and wait until the card interface unit took it over.
///
/// The start bit is polled with a bounded timeout. On timeout, the controller is reset and
/// the command is written again.
pub(crate) fn send_ciu_command<R: HostRegisters, D: DelayNs>(
    regs: &mut R,
    delay: &mut D,
    cmd: Command,
    arg: u32,
) -> Result<(), ResetTimeout> {
    let cmd = cmd.with_start(true);
    regs.write_cmdarg(arg);
    fence(Ordering::SeqCst);
    regs.write_cmd(cmd);
    for _ in 0..CIU_COMMAND_TRIES {
        if poll_until(delay, CIU_COMMAND_POLLS, 1, || !regs.read_cmd().start()) {
            return Ok(());
        }
        wait_reset(
            regs,
            delay,
            Control::new_with_raw_value(0).with_controller_reset(true),
        )?;
        regs.write_cmd(cmd);
    }
    log::error!(
        "timeout sending command (cmd {:#010x} arg {:#010x} status {:#010x})",
        cmd.raw_value(),
        arg,
        regs.read_status().raw_value()
    );
    Err(ResetTimeout(cmd.raw_value()))
}

/// Program a new card clock divider for the given slot and enable the card clock again.
pub(crate) fn program_card_clock<R: HostRegisters, D: DelayNs>(
    regs: &mut R,
    delay: &mut D,
    slot: SlotId,
    divider: CardClockDivider,
    low_power: bool,
) -> Result<(), ResetTimeout> {
    regs.write_clkena(ClockEnable::new_with_raw_value(0));
    regs.write_clksrc(0);
    update_clock_registers(regs, delay, slot)?;
    regs.write_clkdiv(divider.divider() as u32);
    update_clock_registers(regs, delay, slot)?;
    enable_card_clock(regs, delay, slot, low_power)
}

/// Enable the card clock of one slot. All other slots are switched off.
pub(crate) fn enable_card_clock<R: HostRegisters, D: DelayNs>(
    regs: &mut R,
    delay: &mut D,
    slot: SlotId,
    low_power: bool,
) -> Result<(), ResetTimeout> {
    let bit = 1 << slot.value();
    regs.write_clkena(
        ClockEnable::new_with_raw_value(0)
            .with_enable(bit)
            .with_low_power(if low_power { bit } else { 0 }),
    );
    update_clock_registers(regs, delay, slot)
}

/// Stop the card clock of one slot.
pub(crate) fn gate_card_clock<R: HostRegisters, D: DelayNs>(
    regs: &mut R,
    delay: &mut D,
    slot: SlotId,
) -> Result<(), ResetTimeout> {
    let bit = 1 << slot.value();
    let clkena = regs.read_clkena();
    regs.write_clkena(
        clkena
            .with_enable(clkena.enable() & !bit)
            .with_low_power(clkena.low_power() & !bit),
    );
    update_clock_registers(regs, delay, slot)
}

/// Restart the card clock of one slot after [gate_card_clock]. Low power mode stays off.
pub(crate) fn ungate_card_clock<R: HostRegisters, D: DelayNs>(
    regs: &mut R,
    delay: &mut D,
    slot: SlotId,
) -> Result<(), ResetTimeout> {
    let bit = 1 << slot.value();
    let clkena = regs.read_clkena();
    regs.write_clkena(clkena.with_enable(clkena.enable() | bit));
    update_clock_registers(regs, delay, slot)
}

/// Keep the card clock of one slot running while the card is idle. Required for SDIO
/// interrupts and after a controller reset with a busy card.
pub(crate) fn disable_low_power<R: HostRegisters, D: DelayNs>(
    regs: &mut R,
    delay: &mut D,
    slot: SlotId,
) -> Result<(), ResetTimeout> {
    let bit = 1 << slot.value();
    let clkena = regs.read_clkena();
    regs.write_clkena(clkena.with_low_power(clkena.low_power() & !bit));
    update_clock_registers(regs, delay, slot)
}

/// Switch off all card clocks without informing the card interface unit.
pub(crate) fn card_clocks_off<R: HostRegisters>(regs: &mut R) {
    regs.write_clkena(ClockEnable::new_with_raw_value(0));
}
