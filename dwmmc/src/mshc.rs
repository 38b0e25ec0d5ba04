//! # Mobile storage host controller register block
use arbitrary_int::{u2, u3, u4, u5, u6, u12, u13};

/// Offset of the data FIFO for controllers older than version 2.40a.
pub const DATA_OFFSET_LEGACY: usize = 0x100;
/// Offset of the data FIFO for controllers starting with version 2.40a.
pub const DATA_OFFSET_240A: usize = 0x200;
/// First controller version using [DATA_OFFSET_240A].
pub const VERSION_240A: u16 = 0x240a;

/// Maximum number of card slots one controller can expose.
pub const MAX_CARDS: usize = 16;

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct Control {
    #[bit(25, rw)]
    use_internal_dmac: bool,
    #[bit(24, rw)]
    enable_od_pullup: bool,
    #[bits(20..=23, rw)]
    card_voltage_b: u4,
    #[bits(16..=19, rw)]
    card_voltage_a: u4,
    #[bit(11, rw)]
    ceata_device_interrupt_status: bool,
    #[bit(10, rw)]
    send_auto_stop_ccsd: bool,
    #[bit(9, rw)]
    send_ccsd: bool,
    #[bit(8, rw)]
    abort_read_data: bool,
    #[bit(7, rw)]
    send_irq_response: bool,
    #[bit(6, rw)]
    read_wait: bool,
    /// Enables the DMA handshake interface. Required for the internal DMAC as well.
    #[bit(5, rw)]
    dma_enable: bool,
    /// Global interrupt enable.
    #[bit(4, rw)]
    interrupt_enable: bool,
    /// Self-clearing.
    #[bit(2, rw)]
    dma_reset: bool,
    /// Self-clearing.
    #[bit(1, rw)]
    fifo_reset: bool,
    /// Resets the CIU and state machines. Self-clearing.
    #[bit(0, rw)]
    controller_reset: bool,
}

/// Card clock enable, one bit per card.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct ClockEnable {
    /// Stops the card clock when the card is idle.
    #[bits(16..=31, rw)]
    low_power: u16,
    #[bits(0..=15, rw)]
    enable: u16,
}

/// Card bus width, one bit per card for each field.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct CardType {
    #[bits(16..=31, rw)]
    width_8: u16,
    #[bits(0..=15, rw)]
    width_4: u16,
}

/// Layout shared by the interrupt mask, masked status and raw status registers.
///
/// The raw status register is write-one-to-clear.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct Interrupts {
    /// One bit per card.
    #[bits(16..=31, rw)]
    sdio: u16,
    #[bit(15, rw)]
    end_bit_error: bool,
    #[bit(14, rw)]
    auto_command_done: bool,
    #[bit(13, rw)]
    start_bit_error: bool,
    #[bit(12, rw)]
    hardware_locked_error: bool,
    #[bit(11, rw)]
    fifo_underrun_overrun: bool,
    /// Data starvation by host timeout. Doubles as the voltage switch interrupt.
    #[bit(10, rw)]
    host_timeout: bool,
    #[bit(9, rw)]
    data_read_timeout: bool,
    #[bit(8, rw)]
    response_timeout: bool,
    #[bit(7, rw)]
    data_crc: bool,
    #[bit(6, rw)]
    response_crc: bool,
    #[bit(5, rw)]
    rx_data_request: bool,
    #[bit(4, rw)]
    tx_data_request: bool,
    #[bit(3, rw)]
    data_over: bool,
    #[bit(2, rw)]
    command_done: bool,
    #[bit(1, rw)]
    response_error: bool,
    #[bit(0, rw)]
    card_detect: bool,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct Command {
    /// Cleared by the controller once the command was taken over by the CIU.
    #[bit(31, rw)]
    start: bool,
    #[bit(29, rw)]
    use_hold_register: bool,
    #[bit(28, rw)]
    voltage_switch: bool,
    #[bit(24, rw)]
    enable_boot: bool,
    #[bit(23, rw)]
    ccs_expected: bool,
    /// Disables the hardware data read timeout.
    #[bit(22, rw)]
    read_ceata_device: bool,
    /// Do not send a command, only update the clock registers of the CIU.
    #[bit(21, rw)]
    update_clock_registers_only: bool,
    #[bits(16..=20, rw)]
    card_number: u5,
    /// Send 80 initialization clocks before the command.
    #[bit(15, rw)]
    send_initialization: bool,
    #[bit(14, rw)]
    stop_abort: bool,
    #[bit(13, rw)]
    wait_previous_data_complete: bool,
    #[bit(12, rw)]
    send_auto_stop: bool,
    #[bit(11, rw)]
    stream_transfer: bool,
    /// 1 for a write to the card.
    #[bit(10, rw)]
    write: bool,
    #[bit(9, rw)]
    data_expected: bool,
    #[bit(8, rw)]
    check_response_crc: bool,
    #[bit(7, rw)]
    long_response: bool,
    #[bit(6, rw)]
    response_expected: bool,
    #[bits(0..=5, rw)]
    index: u6,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct Status {
    #[bit(31, r)]
    dma_request: bool,
    #[bit(30, r)]
    dma_ack: bool,
    /// FIFO fill level in data-path words.
    #[bits(17..=29, r)]
    fifo_count: u13,
    #[bits(11..=16, r)]
    response_index: u6,
    #[bit(10, r)]
    data_state_machine_busy: bool,
    /// Card busy, inverted level of DAT\[0\].
    #[bit(9, r)]
    data_busy: bool,
    #[bit(8, r)]
    data_3_present: bool,
    #[bits(4..=7, r)]
    command_fsm_state: u4,
    #[bit(3, r)]
    fifo_full: bool,
    #[bit(2, r)]
    fifo_empty: bool,
    #[bit(1, r)]
    fifo_tx_watermark: bool,
    #[bit(0, r)]
    fifo_rx_watermark: bool,
}

#[bitbybit::bitenum(u3, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum BurstSize {
    Transfers1 = 0b000,
    Transfers4 = 0b001,
    Transfers8 = 0b010,
    Transfers16 = 0b011,
    Transfers32 = 0b100,
    Transfers64 = 0b101,
    Transfers128 = 0b110,
    Transfers256 = 0b111,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct FifoThreshold {
    #[bits(28..=30, rw)]
    dma_multiple_transaction_size: BurstSize,
    #[bits(16..=27, rw)]
    rx_watermark: u12,
    #[bits(0..=11, rw)]
    tx_watermark: u12,
}

#[bitbybit::bitenum(u3, exhaustive = false)]
#[derive(Debug, PartialEq, Eq)]
pub enum HostDataWidth {
    Bits16 = 0b000,
    Bits32 = 0b001,
    Bits64 = 0b010,
}

/// Synthesis configuration of the controller.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct HardwareConfig {
    /// Internal DMAC uses 64-bit addressing.
    #[bit(27, r)]
    address_config_64: bool,
    #[bit(26, r)]
    area_optimized: bool,
    #[bits(24..=25, r)]
    clock_dividers_minus_one: u2,
    #[bit(22, r)]
    hold_register: bool,
    #[bit(21, r)]
    fifo_ram_inside: bool,
    #[bits(16..=17, r)]
    dma_interface: u2,
    #[bits(10..=15, r)]
    address_width: u6,
    #[bits(7..=9, r)]
    data_width: Option<HostDataWidth>,
    #[bits(1..=5, r)]
    cards_minus_one: u5,
}

/// UHS-1 register, one bit per card for each field.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct UhsControl {
    #[bits(16..=31, rw)]
    ddr: u16,
    /// 1.8 V signalling.
    #[bits(0..=15, rw)]
    low_voltage: u16,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct BusMode {
    #[bits(8..=10, rw)]
    programmable_burst_length: u3,
    #[bit(7, rw)]
    idmac_enable: bool,
    #[bits(2..=6, rw)]
    descriptor_skip_length: u5,
    #[bit(1, rw)]
    fixed_burst: bool,
    /// Self-clearing.
    #[bit(0, rw)]
    software_reset: bool,
}

#[bitbybit::bitenum(u4, exhaustive = false)]
#[derive(Debug, PartialEq, Eq)]
pub enum IdmacState {
    Idle = 0,
    Suspend = 1,
    DescriptorRead = 2,
    DescriptorCheck = 3,
    ReadRequestWait = 4,
    WriteRequestWait = 5,
    Read = 6,
    Write = 7,
    DescriptorClose = 8,
}

/// Layout shared by the internal DMAC status and interrupt enable registers.
///
/// The status register is write-one-to-clear for bits 0 to 9. The state and error fields only
/// exist in the status register.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct IdmacInterrupts {
    #[bits(13..=16, r)]
    fsm_state: Option<IdmacState>,
    #[bits(10..=12, r)]
    error_bits: u3,
    #[bit(9, rw)]
    abnormal_summary: bool,
    #[bit(8, rw)]
    normal_summary: bool,
    #[bit(5, rw)]
    card_error_summary: bool,
    #[bit(4, rw)]
    descriptor_unavailable: bool,
    #[bit(2, rw)]
    fatal_bus_error: bool,
    #[bit(1, rw)]
    receive: bool,
    #[bit(0, rw)]
    transmit: bool,
}

/// Vendor clock phase register. Used for sample phase tuning.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct ClockSelect {
    #[bits(24..=26, rw)]
    divider_ratio: u3,
    #[bits(16..=18, rw)]
    drive_phase: u3,
    #[bit(6, rw)]
    fine_tune: bool,
    #[bits(0..=2, rw)]
    sample_phase: u3,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct CardThresholdControl {
    /// Threshold in bytes.
    #[bits(16..=27, rw)]
    threshold: u12,
    #[bit(2, rw)]
    write_threshold_enable: bool,
    #[bit(1, rw)]
    busy_clear_interrupt: bool,
    #[bit(0, rw)]
    read_threshold_enable: bool,
}

/// Host controller register block.
#[derive(derive_mmio::Mmio)]
#[repr(C)]
pub struct Registers {
    ctrl: Control,
    /// Power enable, one bit per card.
    pwren: u32,
    /// Four 8-bit clock dividers. The card clock is `cclk_in / (2 * div)`, 0 bypasses.
    clkdiv: u32,
    /// Two bits per card selecting one of the dividers.
    clksrc: u32,
    clkena: ClockEnable,
    /// Data timeout in bits 8 to 31, response timeout in bits 0 to 7.
    tmout: u32,
    ctype: CardType,
    blksiz: u32,
    bytcnt: u32,
    intmask: Interrupts,
    cmdarg: u32,
    cmd: Command,
    #[mmio(PureRead)]
    resp0: u32,
    #[mmio(PureRead)]
    resp1: u32,
    #[mmio(PureRead)]
    resp2: u32,
    #[mmio(PureRead)]
    resp3: u32,
    #[mmio(PureRead)]
    mintsts: Interrupts,
    #[mmio(PureRead, Write)]
    rintsts: Interrupts,
    #[mmio(PureRead)]
    status: Status,
    fifoth: FifoThreshold,
    /// Card detect, active low, one bit per card.
    #[mmio(PureRead)]
    cdetect: u32,
    /// Write protect, one bit per card.
    #[mmio(PureRead)]
    wrtprt: u32,
    gpio: u32,
    /// Bytes transferred between CIU and card.
    #[mmio(PureRead)]
    tcbcnt: u32,
    /// Bytes transferred between host and FIFO.
    #[mmio(PureRead)]
    tbbcnt: u32,
    debnce: u32,
    usrid: u32,
    #[mmio(PureRead)]
    verid: u32,
    #[mmio(PureRead)]
    hcon: HardwareConfig,
    uhs_reg: UhsControl,
    /// Hardware reset line, one bit per card, active low.
    rst_n: u32,
    _reserved_0: u32,
    bmod: BusMode,
    /// Poll demand. Any write resumes a suspended internal DMAC.
    pldmnd: u32,
    dbaddr: u32,
    #[mmio(PureRead, Write)]
    idsts: IdmacInterrupts,
    idinten: IdmacInterrupts,
    #[mmio(PureRead)]
    dscaddr: u32,
    #[mmio(PureRead)]
    bufaddr: u32,
    clksel: ClockSelect,
    _reserved_1: [u32; 0x18],
    cdthrctl: CardThresholdControl,
    back_end_power: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Registers>(), 0x108);

impl Registers {
    /// Create a new MMIO instance for a controller at the given base address.
    ///
    /// # Safety
    ///
    /// The address must point to a DesignWare host controller register block. This API can be
    /// used to create multiple drivers for the same peripheral. The user must ensure that
    /// concurrent accesses are safe and do not interfere with each other.
    #[inline]
    pub const unsafe fn new_mmio_at_base(base_addr: usize) -> MmioRegisters<'static> {
        unsafe { Registers::new_mmio_at(base_addr) }
    }
}

/// Offset of the data FIFO for the given controller version.
#[inline]
pub const fn data_offset(version: u16) -> usize {
    if version < VERSION_240A {
        DATA_OFFSET_LEGACY
    } else {
        DATA_OFFSET_240A
    }
}
