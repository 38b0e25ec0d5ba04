//! Simulated controller, board and clock switch for the unit tests.
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::{boxed::Box, collections::VecDeque, vec::Vec};

use dwmmc::{
    BusMode, CardThresholdControl, CardType, ClockEnable, ClockSelect, Command, Control,
    FifoThreshold, HardwareConfig, IdmacInterrupts, Interrupts, Status, UhsControl,
};
use embedded_hal::delay::DelayNs;

use crate::{
    Host, SlotId,
    board::{Board, HostNotifier, SignalVoltage, Timing},
    clock::{ClockControl, ClockDomain, ClockGate},
    config::HostConfig,
    dma::Descriptor,
    regs::{DataWidth, HostRegisters},
    request::{Direction, Request},
    time::{Hertz, Milliseconds},
};

pub type SimHost = Host<'static, SimController, FakeBoard, Recorder>;

pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

pub struct FakeClocks {
    enabled: [AtomicBool; 2],
    toggles: AtomicU32,
}

impl FakeClocks {
    pub const fn new() -> Self {
        Self {
            enabled: [AtomicBool::new(false), AtomicBool::new(false)],
            toggles: AtomicU32::new(0),
        }
    }

    pub fn is_enabled(&self, domain: ClockDomain) -> bool {
        self.enabled[domain as usize].load(Ordering::Relaxed)
    }

    pub fn toggles(&self) -> u32 {
        self.toggles.load(Ordering::Relaxed)
    }
}

impl ClockControl for FakeClocks {
    fn set_enabled(&self, domain: ClockDomain, enabled: bool) {
        self.enabled[domain as usize].store(enabled, Ordering::Relaxed);
        self.toggles.fetch_add(1, Ordering::Relaxed);
    }
}

/// Ordered record of resets and card commands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimOp {
    FifoReset,
    ControllerReset,
    DmaReset,
    Command(u8),
}

/// Register file of a controller with a 32-bit data path and two slots.
pub struct SimController {
    pub ctrl: Control,
    pub pwren: u32,
    pub clkdiv: u32,
    pub clksrc: u32,
    pub clkena: ClockEnable,
    pub tmout: u32,
    pub ctype: CardType,
    pub blksiz: u32,
    pub bytcnt: u32,
    pub intmask: Interrupts,
    pub cmdarg: u32,
    pub cmd: Command,
    pub response: [u32; 4],
    pub rintsts: Interrupts,
    pub fifoth: FifoThreshold,
    pub cdetect: u32,
    pub wrtprt: u32,
    pub tbbcnt: u32,
    pub verid: u32,
    pub hcon: HardwareConfig,
    pub uhs: UhsControl,
    pub bmod: BusMode,
    pub pldmnd_writes: u32,
    pub dbaddr: u32,
    pub idsts: IdmacInterrupts,
    pub idinten: IdmacInterrupts,
    pub clksel: ClockSelect,
    pub cdthrctl: CardThresholdControl,
    pub rx_fifo: VecDeque<u64>,
    pub tx_words: Vec<u64>,
    pub command_log: Vec<(Command, u32)>,
    pub ops: Vec<SimOp>,
    pub start_bit_stuck: bool,
    /// Data commands needed before the internal DMAC leaves the suspend state.
    pub idmac_suspended_commands: u32,
    pub data_busy: bool,
    pub dma_request: bool,
    pub fifo_resets: u32,
    pub controller_resets: u32,
    pub dma_resets: u32,
}

impl SimController {
    pub fn new() -> Self {
        Self {
            ctrl: Control::new_with_raw_value(0),
            pwren: 0,
            clkdiv: 0,
            clksrc: 0,
            clkena: ClockEnable::new_with_raw_value(0),
            tmout: 0,
            ctype: CardType::new_with_raw_value(0),
            blksiz: 0,
            bytcnt: 0,
            intmask: Interrupts::new_with_raw_value(0),
            cmdarg: 0,
            cmd: Command::new_with_raw_value(0),
            response: [0; 4],
            rintsts: Interrupts::new_with_raw_value(0),
            // Power-on RX watermark of a 32 word FIFO.
            fifoth: FifoThreshold::new_with_raw_value(31 << 16),
            cdetect: 0,
            wrtprt: 0,
            tbbcnt: 0,
            verid: 0x5342_240a,
            hcon: HardwareConfig::new_with_raw_value((1 << 7) | (1 << 1)),
            uhs: UhsControl::new_with_raw_value(0),
            bmod: BusMode::new_with_raw_value(0),
            pldmnd_writes: 0,
            dbaddr: 0,
            idsts: IdmacInterrupts::new_with_raw_value(0),
            idinten: IdmacInterrupts::new_with_raw_value(0),
            clksel: ClockSelect::new_with_raw_value(0),
            cdthrctl: CardThresholdControl::new_with_raw_value(0),
            rx_fifo: VecDeque::new(),
            tx_words: Vec::new(),
            command_log: Vec::new(),
            ops: Vec::new(),
            start_bit_stuck: false,
            idmac_suspended_commands: 0,
            data_busy: false,
            dma_request: false,
            fifo_resets: 0,
            controller_resets: 0,
            dma_resets: 0,
        }
    }

    /// Queue received bytes as FIFO words of the given width.
    pub fn push_rx_bytes(&mut self, bytes: &[u8], width: DataWidth) {
        for chunk in bytes.chunks(width.bytes()) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.rx_fifo.push_back(u64::from_le_bytes(word));
        }
    }

    /// Bytes written to the FIFO, in order.
    pub fn tx_bytes(&self, width: DataWidth) -> Vec<u8> {
        self.tx_words
            .iter()
            .flat_map(|word| word.to_le_bytes()[..width.bytes()].to_vec())
            .collect()
    }

    pub fn raise(&mut self, irq: Interrupts) {
        self.rintsts = Interrupts::new_with_raw_value(self.rintsts.raw_value() | irq.raw_value());
    }

    /// Finish the command on the bus with a short response.
    pub fn complete_command(&mut self, response: u32) {
        self.response = [response, 0, 0, 0];
        self.raise(Interrupts::new_with_raw_value(0).with_command_done(true));
    }

    /// Finish a DMA transfer in the given direction.
    pub fn complete_dma(&mut self, direction: Direction) {
        let idsts = IdmacInterrupts::new_with_raw_value(self.idsts.raw_value())
            .with_normal_summary(true);
        self.idsts = match direction {
            Direction::Read => idsts.with_receive(true),
            Direction::Write => idsts.with_transmit(true),
        };
        self.raise(Interrupts::new_with_raw_value(0).with_data_over(true));
    }

    /// Opcodes of all card commands, without clock updates.
    pub fn card_commands(&self) -> Vec<u8> {
        self.command_log
            .iter()
            .filter(|(cmd, _)| !cmd.update_clock_registers_only())
            .map(|(cmd, _)| cmd.index().value())
            .collect()
    }

    pub fn last_command(&self) -> Option<(Command, u32)> {
        self.command_log
            .iter()
            .rev()
            .find(|(cmd, _)| !cmd.update_clock_registers_only())
            .copied()
    }
}

impl HostRegisters for SimController {
    fn read_ctrl(&mut self) -> Control {
        self.ctrl
    }
    fn write_ctrl(&mut self, value: Control) {
        if value.fifo_reset() {
            self.fifo_resets += 1;
            self.rx_fifo.clear();
            self.ops.push(SimOp::FifoReset);
        }
        if value.controller_reset() {
            self.controller_resets += 1;
            self.ops.push(SimOp::ControllerReset);
        }
        if value.dma_reset() {
            self.dma_resets += 1;
            self.ops.push(SimOp::DmaReset);
        }
        self.ctrl = value
            .with_fifo_reset(false)
            .with_controller_reset(false)
            .with_dma_reset(false);
    }
    fn read_pwren(&mut self) -> u32 {
        self.pwren
    }
    fn write_pwren(&mut self, value: u32) {
        self.pwren = value;
    }
    fn write_clkdiv(&mut self, value: u32) {
        self.clkdiv = value;
    }
    fn write_clksrc(&mut self, value: u32) {
        self.clksrc = value;
    }
    fn read_clkena(&mut self) -> ClockEnable {
        self.clkena
    }
    fn write_clkena(&mut self, value: ClockEnable) {
        self.clkena = value;
    }
    fn write_tmout(&mut self, value: u32) {
        self.tmout = value;
    }
    fn write_ctype(&mut self, value: CardType) {
        self.ctype = value;
    }
    fn write_blksiz(&mut self, value: u32) {
        self.blksiz = value;
    }
    fn write_bytcnt(&mut self, value: u32) {
        self.bytcnt = value;
    }
    fn read_intmask(&mut self) -> Interrupts {
        self.intmask
    }
    fn write_intmask(&mut self, value: Interrupts) {
        self.intmask = value;
    }
    fn write_cmdarg(&mut self, value: u32) {
        self.cmdarg = value;
    }
    fn read_cmd(&mut self) -> Command {
        self.cmd
    }
    fn write_cmd(&mut self, value: Command) {
        self.command_log.push((value, self.cmdarg));
        if !value.update_clock_registers_only() {
            self.ops.push(SimOp::Command(value.index().value()));
        }
        if value.data_expected() && self.idmac_suspended_commands > 0 {
            self.idmac_suspended_commands -= 1;
        }
        self.cmd = if self.start_bit_stuck {
            value
        } else {
            value.with_start(false)
        };
    }
    fn read_response(&mut self) -> [u32; 4] {
        self.response
    }
    fn read_mintsts(&mut self) -> Interrupts {
        Interrupts::new_with_raw_value(self.rintsts.raw_value() & self.intmask.raw_value())
    }
    fn read_rintsts(&mut self) -> Interrupts {
        self.rintsts
    }
    fn write_rintsts(&mut self, value: Interrupts) {
        let pending = self.rintsts.raw_value() & !value.raw_value();
        self.rintsts = Interrupts::new_with_raw_value(pending);
    }
    fn read_status(&mut self) -> Status {
        let mut raw = (self.rx_fifo.len() as u32 & 0x1FFF) << 17;
        if self.data_busy {
            raw |= 1 << 9;
        }
        if self.dma_request {
            raw |= 1 << 31;
        }
        Status::new_with_raw_value(raw)
    }
    fn read_fifoth(&mut self) -> FifoThreshold {
        self.fifoth
    }
    fn write_fifoth(&mut self, value: FifoThreshold) {
        self.fifoth = value;
    }
    fn read_cdetect(&mut self) -> u32 {
        self.cdetect
    }
    fn read_wrtprt(&mut self) -> u32 {
        self.wrtprt
    }
    fn read_tcbcnt(&mut self) -> u32 {
        0
    }
    fn read_tbbcnt(&mut self) -> u32 {
        self.tbbcnt
    }
    fn read_verid(&mut self) -> u32 {
        self.verid
    }
    fn read_hcon(&mut self) -> HardwareConfig {
        self.hcon
    }
    fn read_uhs_reg(&mut self) -> UhsControl {
        self.uhs
    }
    fn write_uhs_reg(&mut self, value: UhsControl) {
        self.uhs = value;
    }
    fn read_bmod(&mut self) -> BusMode {
        self.bmod
    }
    fn write_bmod(&mut self, value: BusMode) {
        self.bmod = value.with_software_reset(false);
    }
    fn write_pldmnd(&mut self, _value: u32) {
        self.pldmnd_writes += 1;
    }
    fn write_dbaddr(&mut self, value: u32) {
        self.dbaddr = value;
    }
    fn read_idsts(&mut self) -> IdmacInterrupts {
        let fsm = if self.idmac_suspended_commands > 0 {
            1 << 13
        } else {
            0
        };
        IdmacInterrupts::new_with_raw_value(self.idsts.raw_value() | fsm)
    }
    fn write_idsts(&mut self, value: IdmacInterrupts) {
        let clear = value.raw_value() & 0x3FF;
        self.idsts = IdmacInterrupts::new_with_raw_value(self.idsts.raw_value() & !clear);
    }
    fn read_idinten(&mut self) -> IdmacInterrupts {
        self.idinten
    }
    fn write_idinten(&mut self, value: IdmacInterrupts) {
        self.idinten = value;
    }
    fn read_dscaddr(&mut self) -> u32 {
        self.dbaddr
    }
    fn read_bufaddr(&mut self) -> u32 {
        0
    }
    fn read_clksel(&mut self) -> ClockSelect {
        self.clksel
    }
    fn write_clksel(&mut self, value: ClockSelect) {
        self.clksel = value;
    }
    fn write_cdthrctl(&mut self, value: CardThresholdControl) {
        self.cdthrctl = value;
    }
    fn read_fifo(&mut self, _width: DataWidth) -> u64 {
        self.rx_fifo.pop_front().unwrap_or(0)
    }
    fn write_fifo(&mut self, width: DataWidth, value: u64) {
        self.tx_words.push(value);
        self.tbbcnt += width.bytes() as u32;
    }
}

/// Board with switchable card detect and recording hooks.
pub struct FakeBoard {
    pub power: Vec<(SlotId, bool)>,
    pub card_present: [Option<bool>; crate::MAX_SLOTS],
    pub write_protected: [Option<bool>; crate::MAX_SLOTS],
    pub delayed_ns: u64,
    pub io_timings: Vec<(SlotId, Timing, bool)>,
    pub hw_resets: Vec<SlotId>,
    pub selected: Option<SlotId>,
    pub regulator: bool,
    pub voltages: Vec<(SlotId, SignalVoltage)>,
    pub drive_strength_saves: u32,
    pub drive_strength_tunings: u32,
    pub drive_strength_restores: u32,
    pub restore_compensation: i8,
    pub watchdog: Option<Milliseconds>,
    pub watchdog_arms: u32,
    pub data_timeout_monitor: Option<Milliseconds>,
    pub data_timeout_arms: u32,
    pub mapped: Vec<(u32, usize, Direction)>,
    pub unmapped: Vec<(u32, usize, Direction)>,
    pub next_dma_addr: u32,
    /// Hand out bus addresses which are not word aligned.
    pub misalign_dma: bool,
}

impl FakeBoard {
    pub fn new() -> Self {
        Self {
            power: Vec::new(),
            card_present: [Some(true); crate::MAX_SLOTS],
            write_protected: [None; crate::MAX_SLOTS],
            delayed_ns: 0,
            io_timings: Vec::new(),
            hw_resets: Vec::new(),
            selected: None,
            regulator: false,
            voltages: Vec::new(),
            drive_strength_saves: 0,
            drive_strength_tunings: 0,
            drive_strength_restores: 0,
            restore_compensation: 0,
            watchdog: None,
            watchdog_arms: 0,
            data_timeout_monitor: None,
            data_timeout_arms: 0,
            mapped: Vec::new(),
            unmapped: Vec::new(),
            next_dma_addr: 0x1000_0000,
            misalign_dma: false,
        }
    }
}

impl DelayNs for FakeBoard {
    fn delay_ns(&mut self, ns: u32) {
        self.delayed_ns += ns as u64;
    }
}

impl Board for FakeBoard {
    type Clocks = FakeClocks;

    fn set_power(&mut self, slot: SlotId, on: bool) {
        self.power.push((slot, on));
    }

    fn card_detect(&mut self, slot: SlotId) -> Option<bool> {
        self.card_present[slot.value() as usize]
    }

    fn write_protect(&mut self, slot: SlotId) -> Option<bool> {
        self.write_protected[slot.value() as usize]
    }

    fn select_slot(&mut self, slot: SlotId) {
        self.selected = Some(slot);
    }

    fn set_io_timing(&mut self, slot: SlotId, timing: Timing, tuning: bool) {
        self.io_timings.push((slot, timing, tuning));
    }

    fn set_signal_voltage(&mut self, slot: SlotId, voltage: SignalVoltage) -> bool {
        if self.regulator {
            self.voltages.push((slot, voltage));
        }
        self.regulator
    }

    fn hardware_reset(&mut self, slot: SlotId) {
        self.hw_resets.push(slot);
    }

    fn save_drive_strength(&mut self, _slot: SlotId) {
        self.drive_strength_saves += 1;
    }

    fn tuning_drive_strength(&mut self, _slot: SlotId) {
        self.drive_strength_tunings += 1;
    }

    fn restore_drive_strength(&mut self, _slot: SlotId) -> i8 {
        self.drive_strength_restores += 1;
        self.restore_compensation
    }

    fn arm_request_watchdog(&mut self, timeout: Milliseconds) {
        self.watchdog = Some(timeout);
        self.watchdog_arms += 1;
    }

    fn disarm_request_watchdog(&mut self) {
        self.watchdog = None;
    }

    fn arm_data_timeout_monitor(&mut self, period: Milliseconds) {
        self.data_timeout_monitor = Some(period);
        self.data_timeout_arms += 1;
    }

    fn disarm_data_timeout_monitor(&mut self) {
        self.data_timeout_monitor = None;
    }

    fn map_dma(&mut self, buf: &mut [u8], direction: Direction) -> u32 {
        let addr = if self.misalign_dma {
            self.next_dma_addr + 2
        } else {
            self.next_dma_addr
        };
        self.next_dma_addr += (buf.len() as u32).next_multiple_of(0x1000);
        self.mapped.push((addr, buf.len(), direction));
        addr
    }

    fn unmap_dma(&mut self, bus_addr: u32, len: usize, direction: Direction) {
        self.unmapped.push((bus_addr, len, direction));
    }
}

#[derive(Default)]
pub struct Recorder {
    pub done: Vec<(SlotId, Request)>,
    pub card_changes: Vec<(SlotId, bool)>,
    pub sdio: Vec<SlotId>,
}

impl HostNotifier for Recorder {
    fn request_done(&mut self, slot: SlotId, request: Request) {
        self.done.push((slot, request));
    }

    fn card_detect_changed(&mut self, slot: SlotId, present: bool) {
        self.card_changes.push((slot, present));
    }

    fn sdio_interrupt(&mut self, slot: SlotId) {
        self.sdio.push(slot);
    }
}

pub fn leak_buffer(len: usize) -> &'static mut [u8] {
    std::vec![0u8; len].leak()
}

pub fn clock_gate() -> &'static ClockGate<FakeClocks> {
    Box::leak(Box::new(ClockGate::new(FakeClocks::new())))
}

pub fn descriptors(count: usize) -> &'static mut [Descriptor] {
    (0..count)
        .map(|_| Descriptor::new())
        .collect::<Vec<_>>()
        .leak()
}

/// 100 MHz bus clock and a short data busy poll.
pub fn config() -> HostConfig {
    HostConfig::new(Hertz::MHz(100)).with_busy_poll(Milliseconds::from_ticks(1), 2)
}

/// Host with a 16 entry descriptor ring.
pub fn host(config: HostConfig) -> SimHost {
    let ring = config.use_dma.then(|| descriptors(16));
    match Host::new(
        SimController::new(),
        FakeBoard::new(),
        Recorder::default(),
        clock_gate(),
        ring,
        config,
    ) {
        Ok(host) => host,
        Err(err) => panic!("probe failed: {err}"),
    }
}

pub fn pio_host(config: HostConfig) -> SimHost {
    host(config.with_dma(false))
}
