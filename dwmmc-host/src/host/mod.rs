//! # Host controller driver
//!
//! [Host] owns one controller with up to [MAX_SLOTS] card slots. Requests are submitted with
//! [Host::submit] and run through a state machine which is driven from two contexts:
//!
//! - [Host::on_interrupt] acknowledges the controller status, moves PIO data and posts events.
//!   It never blocks.
//! - [Host::run_state_machine] is the bottom half. It advances the active request on the
//!   posted events and starts the next queued request once the active one completed.
//!
//! Card presence changes are handled by [Host::handle_card_detect], and the two board timers
//! call [Host::on_request_timeout] and [Host::on_data_timeout_tick]. [crate::SharedHost] wires
//! all of these up behind a single lock.
use arbitrary_int::u12;
use dwmmc::{BurstSize, Control, FifoThreshold, Interrupts};

use crate::{
    MAX_SLOTS, QUEUE_DEPTH, SlotId,
    board::{Board, BusParameters, BusWidth, HostNotifier, PowerMode, SignalVoltage, Timing},
    clock::{
        ClockDomain, ClockGate, ClockGuard, card_clocks_off, disable_low_power, gate_card_clock,
        ungate_card_clock, update_clock_registers,
    },
    config::HostConfig,
    dma::{Descriptor, DescriptorRing, check_layout},
    error::{Error, ProbeError, ResetTimeout, SubmitError},
    regs::{DataWidth, HostRegisters, poll_until, wait_reset},
    request::{Data, Request},
    state::{EventQueue, HostState, LatchedStatus, State},
    time::{Hertz, Milliseconds},
    tuning::{TuningState, card_read_threshold},
};

mod card_detect;
mod irq;
mod issue;
mod state_machine;

pub use irq::InterruptResult;

/// Settle time after switching the signal voltage.
const VOLTAGE_SETTLE_MS: u32 = 5;
/// Data busy wait of the 1.8 V switch: 10 rounds of 10 ms.
const VOLTAGE_SWITCH_BUSY_ROUNDS: u8 = 10;
const VOLTAGE_SWITCH_BUSY_POLLS: u32 = 1_000;
/// Wait for the DMA request line after a FIFO reset, 500 ms in 1 us steps.
const DMA_IDLE_POLLS: u32 = 500_000;

/// Software data timeout monitor period and budget.
pub(crate) const DATA_TIMEOUT_PERIOD: Milliseconds = Milliseconds::from_ticks(50);
pub(crate) const DATA_TIMEOUT_LIMIT: Milliseconds = Milliseconds::from_ticks(200);

/// Result of [Host::submit].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The request is active on the bus.
    Started,
    /// The request waits behind the active one.
    Queued,
    /// The request was completed right away, typically with an error. It was handed to
    /// [HostNotifier::request_done] before this returned.
    Completed,
}

/// Counters of conditions which were recovered locally.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub completed: u32,
    pub fifo_resets: u32,
    pub controller_resets: u32,
    pub du_recoveries: u32,
    pub crc_retries: u32,
    pub tuning_retries: u32,
    pub watchdog_expiries: u32,
}

/// Per slot bus state.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Slot {
    pub width: BusWidth,
    pub clock: Hertz,
    pub timing: Timing,
    pub signal_voltage: SignalVoltage,
    pub power: PowerMode,
    pub present: bool,
    /// The next command is preceded by the initialization clock sequence.
    pub need_init: bool,
    pub tuned: bool,
    pub sdio_irq: bool,
    /// Presence reported by [Host::notify_card_change] for boards without a detect line.
    pub reported: bool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            width: BusWidth::One,
            clock: Hertz::from_raw(0),
            timing: Timing::Legacy,
            signal_voltage: SignalVoltage::V330,
            power: PowerMode::Off,
            present: false,
            need_init: true,
            tuned: false,
            sdio_irq: false,
            reported: true,
        }
    }
}

/// Software fallback for data read timeouts.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct DataTimeoutMonitor {
    /// Set after the first hardware data read timeout.
    pub enabled: bool,
    pub armed: bool,
    pub ticks: u32,
}

/// DesignWare MMC host controller.
pub struct Host<'g, R: HostRegisters, B: Board, N: HostNotifier> {
    pub(crate) regs: R,
    pub(crate) board: B,
    pub(crate) notifier: N,
    pub(crate) config: HostConfig,
    clocks: &'g ClockGate<B::Clocks>,
    _bus_clock: ClockGuard<'g, B::Clocks>,
    card_clock: Option<ClockGuard<'g, B::Clocks>>,
    pub(crate) width: DataWidth,
    pub(crate) fifo_depth: u32,
    hold_register: bool,
    pub(crate) ring: Option<DescriptorRing<'g>>,
    pub(crate) slots: heapless::Vec<Slot, MAX_SLOTS>,
    queue: heapless::Deque<(SlotId, Request), QUEUE_DEPTH>,
    pub(crate) state: HostState,
    pub(crate) events: EventQueue,
    pub(crate) latched: LatchedStatus,
    pub(crate) tuning: TuningState,
    pub(crate) data_timeout: DataTimeoutMonitor,
    crc_retries: u8,
    pub(crate) diagnostics: Diagnostics,
    current_slot: Option<SlotId>,
    /// Slot and card clock the divider was last programmed for.
    current_clock: Option<(SlotId, Hertz)>,
}

impl<'g, R: HostRegisters, B: Board, N: HostNotifier> Host<'g, R, B, N> {
    /// Probe and initialize the controller.
    ///
    /// The bus interface clock is enabled for the lifetime of the host. The internal DMA
    /// controller is used if `descriptors` are supplied, [HostConfig::use_dma] is set and the
    /// controller uses 32-bit descriptor addressing. Otherwise all transfers use PIO.
    pub fn new(
        mut regs: R,
        mut board: B,
        notifier: N,
        clocks: &'g ClockGate<B::Clocks>,
        descriptors: Option<&'g mut [Descriptor]>,
        config: HostConfig,
    ) -> Result<Self, ProbeError> {
        if config.bus_clock.raw() == 0 {
            log::error!("bus clock frequency is zero");
            return Err(ProbeError::ZeroBusClock);
        }
        let bus_clock = clocks.acquire(ClockDomain::BusInterface);
        let hcon = regs.read_hcon();
        let width = DataWidth::from_hardware_config(hcon);
        let version = regs.read_verid() & 0xFFFF;
        wait_reset(&mut regs, &mut board, full_reset())?;

        let ring = match descriptors {
            Some(list) if config.use_dma => {
                if hcon.address_config_64() {
                    log::warn!("64-bit DMA addressing is not supported, using PIO");
                    None
                } else {
                    DescriptorRing::new(list)
                }
            }
            _ => None,
        };
        if let Some(ring) = ring.as_ref() {
            ring.program(&mut regs);
        }

        regs.write_rintsts(Interrupts::new_with_raw_value(u32::MAX));
        regs.write_intmask(Interrupts::new_with_raw_value(0));
        regs.write_tmout(u32::MAX);

        let fifo_depth = config
            .fifo_depth
            .unwrap_or_else(|| regs.read_fifoth().rx_watermark().value() as u32 + 1);
        regs.write_fifoth(fifo_thresholds(width, fifo_depth));
        card_clocks_off(&mut regs);
        regs.write_clksrc(0);

        let num_slots = config
            .num_slots
            .unwrap_or(hcon.cards_minus_one().value() + 1)
            .min(MAX_SLOTS as u8);
        if num_slots == 0 {
            return Err(ProbeError::NoSlots);
        }

        let mut host = Self {
            regs,
            board,
            notifier,
            config,
            clocks,
            _bus_clock: bus_clock,
            card_clock: None,
            width,
            fifo_depth,
            hold_register: hcon.hold_register(),
            ring,
            slots: (0..num_slots).map(|_| Slot::new()).collect(),
            queue: heapless::Deque::new(),
            state: HostState::Idle,
            events: EventQueue::new(),
            latched: LatchedStatus::new(),
            tuning: TuningState::new(),
            data_timeout: DataTimeoutMonitor::default(),
            crc_retries: 0,
            diagnostics: Diagnostics::default(),
            current_slot: None,
            current_clock: None,
        };
        for idx in 0..num_slots {
            let present = host.get_card_present(SlotId::new(idx));
            host.slots[idx as usize].present = present;
        }

        host.regs.write_rintsts(Interrupts::new_with_raw_value(u32::MAX));
        host.regs.write_intmask(irq::default_interrupt_mask());
        host.regs.modify_ctrl(|ctrl| ctrl.with_interrupt_enable(true));
        log::info!(
            "DesignWare MMC host version {version:#06x}: {num_slots} slot(s), {:?} data path, \
             FIFO depth {fifo_depth}, {}",
            width,
            if host.ring.is_some() { "internal DMA" } else { "PIO" }
        );
        Ok(host)
    }

    /// Operating state of the request state machine.
    #[inline]
    pub fn state(&self) -> State {
        self.state.state()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    /// Number of requests waiting behind the active one.
    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn data_width(&self) -> DataWidth {
        self.width
    }

    /// FIFO depth in data words.
    #[inline]
    pub fn fifo_depth(&self) -> u32 {
        self.fifo_depth
    }

    #[inline]
    pub fn uses_dma(&self) -> bool {
        self.ring.is_some()
    }

    #[inline]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    #[inline]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    #[inline]
    pub fn tuning_state(&self) -> &TuningState {
        &self.tuning
    }

    /// A tuning run is active. CRC retries and DDR timing are suppressed meanwhile.
    #[inline]
    pub fn tuning_in_progress(&self) -> bool {
        self.tuning.in_progress
    }

    /// Last known card presence of a slot, as updated by [Self::handle_card_detect].
    pub fn is_card_present(&self, slot: SlotId) -> bool {
        self.slot_index(slot)
            .is_some_and(|idx| self.slots[idx].present)
    }

    #[inline]
    pub fn board(&mut self) -> &mut B {
        &mut self.board
    }

    #[inline]
    pub fn notifier(&mut self) -> &mut N {
        &mut self.notifier
    }

    #[inline]
    pub(crate) fn slot_index(&self, slot: SlotId) -> Option<usize> {
        let idx = slot.value() as usize;
        (idx < self.slots.len()).then_some(idx)
    }

    /// Submit a request for a slot.
    ///
    /// The request starts right away if the host is idle. Requests for a slot without a card
    /// and requests with an invalid scatter list are completed immediately with an error,
    /// without touching the controller.
    pub fn submit(
        &mut self,
        slot: SlotId,
        mut request: Request,
    ) -> Result<Submission, SubmitError> {
        let Some(idx) = self.slot_index(slot) else {
            return Err(SubmitError::InvalidSlot(request));
        };
        if !self.slots[idx].present {
            request.fail(Error::NoMedium);
            self.notifier.request_done(slot, request);
            return Ok(Submission::Completed);
        }
        if request.data.as_ref().is_some_and(|data| !data.is_valid()) {
            log::warn!(
                "rejecting request with invalid scatter list for CMD{}",
                request.cmd.opcode
            );
            request.fail(Error::InvalidRequest);
            self.notifier.request_done(slot, request);
            return Ok(Submission::Completed);
        }
        if self.state.is_idle() && self.queue.is_empty() {
            return Ok(if self.start_request(slot, request) {
                Submission::Started
            } else {
                Submission::Completed
            });
        }
        match self.queue.push_back((slot, request)) {
            Ok(()) => Ok(Submission::Queued),
            Err((_, request)) => Err(SubmitError::QueueFull(request)),
        }
    }

    /// Map the scatter list of a request for DMA ahead of submission.
    ///
    /// Does nothing without a descriptor ring or for a layout which will run in PIO mode.
    pub fn pre_stage(&mut self, request: &mut Request) {
        if self.ring.is_none() {
            return;
        }
        let alignment = self.dma_alignment();
        let Some(data) = request.data.as_mut() else {
            return;
        };
        if data.pre_staged || check_layout(data, alignment).is_err() {
            return;
        }
        self.map_segments(data);
        data.pre_staged = true;
    }

    /// Undo [Self::pre_stage] after the request completed.
    pub fn post_stage(&mut self, request: &mut Request) {
        if let Some(data) = request.data.as_mut()
            && data.pre_staged
        {
            self.unmap_segments(data);
            data.pre_staged = false;
        }
    }

    /// Apply the bus settings of a slot.
    ///
    /// The card clock divider and bus width are programmed lazily when the next request of
    /// the slot starts. A changed signal voltage is switched right away.
    pub fn set_bus_parameters(
        &mut self,
        slot: SlotId,
        params: BusParameters,
    ) -> Result<(), Error> {
        let idx = self.slot_index(slot).ok_or(Error::InvalidRequest)?;
        let tuning = self.tuning.in_progress;
        let bit = 1u16 << slot.value();
        let previous = self.slots[idx];
        let current = &mut self.slots[idx];
        current.width = params.width;
        current.timing = params.timing;
        current.clock = params.clock;
        current.power = params.power;

        self.regs.modify_uhs_reg(|uhs| {
            let ddr = if params.timing.is_ddr() && !tuning {
                uhs.ddr() | bit
            } else {
                uhs.ddr() & !bit
            };
            uhs.with_ddr(ddr)
        });
        if params.timing == Timing::MmcHs200Ddr && !tuning {
            self.regs.write_cdthrctl(card_read_threshold(true));
        }
        self.board.set_io_timing(slot, params.timing, tuning);

        if params.clock != previous.clock {
            self.current_clock = None;
            if params.clock.raw() == 0 {
                gate_card_clock(&mut self.regs, &mut self.board, slot)?;
            }
        }
        match params.power {
            PowerMode::Up => {
                self.slots[idx].need_init = true;
                if previous.power == PowerMode::Off {
                    self.board.set_power(slot, true);
                }
            }
            PowerMode::Off => {
                if previous.power != PowerMode::Off {
                    self.board.set_power(slot, false);
                }
                self.slots[idx].tuned = false;
            }
            PowerMode::On => (),
        }
        self.update_card_clock_guard();

        if params.signal_voltage != previous.signal_voltage {
            self.switch_signal_voltage(slot, params.signal_voltage)?;
        }
        Ok(())
    }

    /// Switch the IO signal voltage of a slot.
    ///
    /// 1.2 V signalling is only available through a board regulator.
    pub fn switch_signal_voltage(
        &mut self,
        slot: SlotId,
        voltage: SignalVoltage,
    ) -> Result<(), Error> {
        let idx = self.slot_index(slot).ok_or(Error::InvalidRequest)?;
        let bit = 1u16 << slot.value();
        match voltage {
            SignalVoltage::V330 => {
                if !self.board.set_signal_voltage(slot, voltage) {
                    self.regs
                        .modify_uhs_reg(|uhs| uhs.with_low_voltage(uhs.low_voltage() & !bit));
                }
                self.board.delay_ms(VOLTAGE_SETTLE_MS);
            }
            SignalVoltage::V180 => {
                self.reset_controller()?;
                self.wait_data_idle(
                    slot,
                    VOLTAGE_SWITCH_BUSY_ROUNDS,
                    VOLTAGE_SWITCH_BUSY_POLLS,
                    10,
                )?;
                gate_card_clock(&mut self.regs, &mut self.board, slot)?;
                if !self.board.set_signal_voltage(slot, voltage) {
                    self.regs
                        .modify_uhs_reg(|uhs| uhs.with_low_voltage(uhs.low_voltage() | bit));
                }
                self.board.delay_ms(VOLTAGE_SETTLE_MS);
                ungate_card_clock(&mut self.regs, &mut self.board, slot)?;
            }
            SignalVoltage::V120 => {
                if !self.board.set_signal_voltage(slot, voltage) {
                    log::warn!("slot {}: no regulator for 1.2 V signalling", slot.value());
                    return Err(Error::InvalidRequest);
                }
            }
        }
        self.slots[idx].signal_voltage = voltage;
        log::debug!("slot {}: signal voltage {:?}", slot.value(), voltage);
        Ok(())
    }

    /// Enable or disable the SDIO card interrupt of a slot.
    ///
    /// The card clock of the slot keeps running while the interrupt is enabled.
    pub fn enable_sdio_irq(&mut self, slot: SlotId, enable: bool) -> Result<(), Error> {
        let idx = self.slot_index(slot).ok_or(Error::InvalidRequest)?;
        self.slots[idx].sdio_irq = enable;
        let bit = 1u16 << slot.value();
        self.regs.modify_intmask(|mask| {
            let sdio = if enable {
                mask.sdio() | bit
            } else {
                mask.sdio() & !bit
            };
            mask.with_sdio(sdio)
        });
        if enable {
            disable_low_power(&mut self.regs, &mut self.board, slot)?;
        }
        Ok(())
    }

    /// Reset the whole controller and pulse the hardware reset line of every slot.
    ///
    /// The active request and all queued requests complete with [Error::NoMedium]. The host is
    /// idle afterwards.
    pub fn hardware_reset(&mut self) -> Result<(), ResetTimeout> {
        log::warn!("resetting host controller");
        self.abort_active(Error::NoMedium);
        self.fail_queued(None, Error::NoMedium);
        self.events.clear();
        self.latched.clear();
        self.stop_data_timeout_monitor();
        self.data_timeout.enabled = false;
        self.board.disarm_request_watchdog();
        self.crc_retries = 0;

        self.diagnostics.fifo_resets += 1;
        self.diagnostics.controller_resets += 1;
        wait_reset(&mut self.regs, &mut self.board, full_reset())?;
        if let Some(ring) = self.ring.as_mut() {
            ring.init_or_reset();
            ring.program(&mut self.regs);
        }
        self.regs.write_rintsts(Interrupts::new_with_raw_value(u32::MAX));
        let sdio = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.sdio_irq)
            .fold(0u16, |bits, (idx, _)| bits | (1 << idx));
        self.regs
            .write_intmask(irq::default_interrupt_mask().with_sdio(sdio));
        self.regs.modify_ctrl(|ctrl| ctrl.with_interrupt_enable(true));

        for idx in 0..self.slots.len() {
            self.board.hardware_reset(SlotId::new(idx as u8));
            self.slots[idx].need_init = true;
            self.slots[idx].tuned = false;
        }
        self.current_clock = None;
        Ok(())
    }

    /// Shut the controller down and hand back the register access, board and notifier.
    ///
    /// Pending requests complete with [Error::NoMedium]. Interrupts are masked, the card
    /// clocks are gated and all slots are powered down.
    pub fn release(mut self) -> (R, B, N) {
        self.abort_active(Error::NoMedium);
        self.fail_queued(None, Error::NoMedium);
        self.stop_data_timeout_monitor();
        self.board.disarm_request_watchdog();

        self.regs.modify_ctrl(|ctrl| ctrl.with_interrupt_enable(false));
        self.regs.write_intmask(Interrupts::new_with_raw_value(0));
        self.regs.write_rintsts(Interrupts::new_with_raw_value(u32::MAX));
        if let Some(ring) = self.ring.as_mut()
            && let Err(err) = ring.stop(&mut self.regs, &mut self.board)
        {
            log::warn!("stopping DMA on release failed: {err}");
        }
        card_clocks_off(&mut self.regs);
        for idx in 0..self.slots.len() {
            self.board.set_power(SlotId::new(idx as u8), false);
            self.slots[idx].power = PowerMode::Off;
        }
        self.card_clock = None;
        log::info!("host released");
        let Self {
            regs,
            board,
            notifier,
            ..
        } = self;
        (regs, board, notifier)
    }

    /// Log the controller state at error level.
    pub fn dump_registers(&mut self) {
        let ctrl = self.regs.read_ctrl().raw_value();
        let status = self.regs.read_status().raw_value();
        let rintsts = self.regs.read_rintsts().raw_value();
        let intmask = self.regs.read_intmask().raw_value();
        let cmd = self.regs.read_cmd().raw_value();
        let tcbcnt = self.regs.read_tcbcnt();
        let tbbcnt = self.regs.read_tbbcnt();
        log::error!(
            "ctrl {ctrl:#010x} status {status:#010x} rintsts {rintsts:#010x} \
             intmask {intmask:#010x}"
        );
        log::error!("cmd {cmd:#010x} tcbcnt {tcbcnt} tbbcnt {tbbcnt} state {:?}", self.state());
        if self.ring.is_some() {
            let idsts = self.regs.read_idsts().raw_value();
            let dscaddr = self.regs.read_dscaddr();
            let bufaddr = self.regs.read_bufaddr();
            log::error!("idsts {idsts:#010x} dscaddr {dscaddr:#010x} bufaddr {bufaddr:#010x}");
        }
    }

    /// Alignment of DMA buffers and block sizes.
    pub(crate) fn dma_alignment(&self) -> usize {
        if self.width == DataWidth::Bits64 { 8 } else { 4 }
    }

    pub(crate) fn map_segments(&mut self, data: &mut Data) {
        let direction = data.direction;
        let mut remaining = data.len();
        data.mapped.clear();
        for segment in data.segments.iter_mut() {
            if remaining == 0 {
                break;
            }
            remaining -= segment.len().min(remaining);
            let addr = self.board.map_dma(segment, direction);
            if data.mapped.push(addr).is_err() {
                break;
            }
        }
    }

    pub(crate) fn unmap_segments(&mut self, data: &mut Data) {
        for (segment, addr) in data.segments.iter().zip(data.mapped.iter()) {
            self.board.unmap_dma(*addr, segment.len(), data.direction);
        }
        data.mapped.clear();
    }

    /// Keep the card clock domain running while any slot is clocked or powered.
    fn update_card_clock_guard(&mut self) {
        let needed = self
            .slots
            .iter()
            .any(|slot| slot.clock.raw() != 0 || slot.power != PowerMode::Off);
        if needed && self.card_clock.is_none() {
            let clocks = self.clocks;
            self.card_clock = Some(clocks.acquire(ClockDomain::Card));
        } else if !needed {
            self.card_clock = None;
        }
    }

    /// Reset the FIFO and clear the data related interrupt status.
    pub(crate) fn reset_fifo(&mut self) -> Result<(), ResetTimeout> {
        self.diagnostics.fifo_resets += 1;
        wait_reset(
            &mut self.regs,
            &mut self.board,
            Control::new_with_raw_value(0).with_fifo_reset(true),
        )?;
        self.regs
            .write_rintsts(Interrupts::new_with_raw_value(0xFFFF).with_card_detect(false));
        if self.ring.is_some()
            && !poll_until(&mut self.board, DMA_IDLE_POLLS, 1, || {
                !self.regs.read_status().dma_request()
            })
        {
            log::warn!("DMA request still pending after FIFO reset");
        }
        Ok(())
    }

    /// Reset the controller state machines and hand the clock registers back to the card
    /// interface unit.
    pub(crate) fn reset_controller(&mut self) -> Result<(), ResetTimeout> {
        self.diagnostics.controller_resets += 1;
        wait_reset(
            &mut self.regs,
            &mut self.board,
            Control::new_with_raw_value(0).with_controller_reset(true),
        )?;
        if let Some(slot) = self.current_slot {
            update_clock_registers(&mut self.regs, &mut self.board, slot)?;
        }
        Ok(())
    }

    /// FIFO reset followed by a controller reset.
    pub(crate) fn reset_after_error(&mut self) {
        if let Err(err) = self.reset_fifo() {
            log::error!("FIFO reset failed: {err}");
        }
        if let Err(err) = self.reset_controller() {
            log::error!("controller reset failed: {err}");
        }
    }

    /// Poll until the card releases the data line, resetting the controller between rounds.
    ///
    /// Returns whether a reset was needed.
    pub(crate) fn wait_data_idle(
        &mut self,
        slot: SlotId,
        rounds: u8,
        polls: u32,
        interval_us: u32,
    ) -> Result<bool, Error> {
        let rounds = rounds.max(1);
        let mut reset = false;
        for round in 0..rounds {
            if poll_until(&mut self.board, polls, interval_us, || {
                !self.regs.read_status().data_busy()
            }) {
                return Ok(reset);
            }
            if round + 1 == rounds {
                break;
            }
            log::warn!("slot {}: data busy, resetting controller", slot.value());
            self.reset_controller()?;
            disable_low_power(&mut self.regs, &mut self.board, slot)?;
            reset = true;
        }
        log::error!("slot {}: data line stuck busy", slot.value());
        Err(Error::NotRecoverable)
    }
}

fn full_reset() -> Control {
    Control::new_with_raw_value(0)
        .with_controller_reset(true)
        .with_fifo_reset(true)
        .with_dma_reset(true)
}

/// DMA burst size and FIFO watermarks for a data path width.
///
/// A burst moves `2^(shift + 1)` words. The RX watermark is one below a burst and the TX
/// watermark leaves room for one burst.
fn fifo_thresholds(width: DataWidth, depth: u32) -> FifoThreshold {
    let msize = match width {
        DataWidth::Bits16 => BurstSize::Transfers4,
        DataWidth::Bits32 => BurstSize::Transfers8,
        DataWidth::Bits64 => BurstSize::Transfers16,
    };
    let burst = 1u32 << (width.shift() + 1);
    FifoThreshold::new_with_raw_value(0)
        .with_dma_multiple_transaction_size(msize)
        .with_rx_watermark(u12::new((burst - 1) as u16))
        .with_tx_watermark(u12::new(depth.saturating_sub(burst).min(0xFFF) as u16))
}
