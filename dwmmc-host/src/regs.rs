//! # Register access seam
//!
//! The driver core never touches the register block directly. Everything goes through
//! [HostRegisters], which is implemented by [MmioHost] for real hardware.
use dwmmc::{
    BusMode, CardThresholdControl, CardType, ClockEnable, ClockSelect, Command, Control,
    FifoThreshold, HardwareConfig, HostDataWidth, IdmacInterrupts, Interrupts, MmioRegisters,
    Status, UhsControl,
};

/// Width of the data path between the host bus and the FIFO.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataWidth {
    Bits16,
    Bits32,
    Bits64,
}

impl DataWidth {
    /// Decode the synthesis configuration. Reserved values fall back to 32 bits.
    pub fn from_hardware_config(hcon: HardwareConfig) -> Self {
        match hcon.data_width() {
            Ok(HostDataWidth::Bits16) => DataWidth::Bits16,
            Ok(HostDataWidth::Bits64) => DataWidth::Bits64,
            Ok(HostDataWidth::Bits32) => DataWidth::Bits32,
            Err(raw) => {
                log::warn!("reserved host data width {raw}, defaulting to 32 bits");
                DataWidth::Bits32
            }
        }
    }

    /// Width in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            DataWidth::Bits16 => 2,
            DataWidth::Bits32 => 4,
            DataWidth::Bits64 => 8,
        }
    }

    /// log2 of the width in bytes.
    #[inline]
    pub const fn shift(self) -> u32 {
        match self {
            DataWidth::Bits16 => 1,
            DataWidth::Bits32 => 2,
            DataWidth::Bits64 => 3,
        }
    }
}

/// Register level access to one host controller.
///
/// Method names follow the register names of the [dwmmc] register block. The raw interrupt
/// status and the internal DMAC status registers are write-one-to-clear.
pub trait HostRegisters {
    fn read_ctrl(&mut self) -> Control;
    fn write_ctrl(&mut self, value: Control);
    fn read_pwren(&mut self) -> u32;
    fn write_pwren(&mut self, value: u32);
    fn write_clkdiv(&mut self, value: u32);
    fn write_clksrc(&mut self, value: u32);
    fn read_clkena(&mut self) -> ClockEnable;
    fn write_clkena(&mut self, value: ClockEnable);
    fn write_tmout(&mut self, value: u32);
    fn write_ctype(&mut self, value: CardType);
    fn write_blksiz(&mut self, value: u32);
    fn write_bytcnt(&mut self, value: u32);
    fn read_intmask(&mut self) -> Interrupts;
    fn write_intmask(&mut self, value: Interrupts);
    fn write_cmdarg(&mut self, value: u32);
    fn read_cmd(&mut self) -> Command;
    fn write_cmd(&mut self, value: Command);
    /// Response words 0 to 3. Short responses only use word 0.
    fn read_response(&mut self) -> [u32; 4];
    fn read_mintsts(&mut self) -> Interrupts;
    fn read_rintsts(&mut self) -> Interrupts;
    fn write_rintsts(&mut self, value: Interrupts);
    fn read_status(&mut self) -> Status;
    fn read_fifoth(&mut self) -> FifoThreshold;
    fn write_fifoth(&mut self, value: FifoThreshold);
    fn read_cdetect(&mut self) -> u32;
    fn read_wrtprt(&mut self) -> u32;
    fn read_tcbcnt(&mut self) -> u32;
    fn read_tbbcnt(&mut self) -> u32;
    fn read_verid(&mut self) -> u32;
    fn read_hcon(&mut self) -> HardwareConfig;
    fn read_uhs_reg(&mut self) -> UhsControl;
    fn write_uhs_reg(&mut self, value: UhsControl);
    fn read_bmod(&mut self) -> BusMode;
    fn write_bmod(&mut self, value: BusMode);
    fn write_pldmnd(&mut self, value: u32);
    fn write_dbaddr(&mut self, value: u32);
    fn read_idsts(&mut self) -> IdmacInterrupts;
    fn write_idsts(&mut self, value: IdmacInterrupts);
    fn read_idinten(&mut self) -> IdmacInterrupts;
    fn write_idinten(&mut self, value: IdmacInterrupts);
    fn read_dscaddr(&mut self) -> u32;
    fn read_bufaddr(&mut self) -> u32;
    fn read_clksel(&mut self) -> ClockSelect;
    fn write_clksel(&mut self, value: ClockSelect);
    fn write_cdthrctl(&mut self, value: CardThresholdControl);

    /// Read one data word from the FIFO. Narrower widths use the low bits.
    fn read_fifo(&mut self, width: DataWidth) -> u64;
    /// Write one data word to the FIFO. Narrower widths only use the low bits.
    fn write_fifo(&mut self, width: DataWidth, value: u64);

    #[inline]
    fn modify_ctrl(&mut self, f: impl FnOnce(Control) -> Control) {
        let value = self.read_ctrl();
        self.write_ctrl(f(value));
    }

    #[inline]
    fn modify_intmask(&mut self, f: impl FnOnce(Interrupts) -> Interrupts) {
        let value = self.read_intmask();
        self.write_intmask(f(value));
    }

    #[inline]
    fn modify_bmod(&mut self, f: impl FnOnce(BusMode) -> BusMode) {
        let value = self.read_bmod();
        self.write_bmod(f(value));
    }

    #[inline]
    fn modify_uhs_reg(&mut self, f: impl FnOnce(UhsControl) -> UhsControl) {
        let value = self.read_uhs_reg();
        self.write_uhs_reg(f(value));
    }

    #[inline]
    fn modify_clksel(&mut self, f: impl FnOnce(ClockSelect) -> ClockSelect) {
        let value = self.read_clksel();
        self.write_clksel(f(value));
    }
}

/// Memory mapped host controller.
pub struct MmioHost {
    regs: MmioRegisters<'static>,
    fifo: *mut u8,
}

// The raw FIFO pointer is only a register address.
unsafe impl Send for MmioHost {}

impl MmioHost {
    /// Create the register access for a controller at the given base address.
    ///
    /// The data FIFO offset is derived from the version register.
    ///
    /// # Safety
    ///
    /// The address must point to a DesignWare host controller register block and its clocks
    /// must be running. This API can be used to create multiple drivers for the same
    /// peripheral. The user must ensure that concurrent accesses are safe and do not interfere
    /// with each other.
    pub unsafe fn new(base_addr: usize) -> Self {
        let mut regs = unsafe { dwmmc::Registers::new_mmio_at_base(base_addr) };
        let version = (regs.read_verid() & 0xFFFF) as u16;
        Self {
            regs,
            fifo: (base_addr + dwmmc::data_offset(version)) as *mut u8,
        }
    }

    /// Direct access to the register block.
    #[inline]
    pub fn regs(&mut self) -> &mut MmioRegisters<'static> {
        &mut self.regs
    }
}

impl HostRegisters for MmioHost {
    #[inline]
    fn read_ctrl(&mut self) -> Control {
        self.regs.read_ctrl()
    }
    #[inline]
    fn write_ctrl(&mut self, value: Control) {
        self.regs.write_ctrl(value)
    }
    #[inline]
    fn read_pwren(&mut self) -> u32 {
        self.regs.read_pwren()
    }
    #[inline]
    fn write_pwren(&mut self, value: u32) {
        self.regs.write_pwren(value)
    }
    #[inline]
    fn write_clkdiv(&mut self, value: u32) {
        self.regs.write_clkdiv(value)
    }
    #[inline]
    fn write_clksrc(&mut self, value: u32) {
        self.regs.write_clksrc(value)
    }
    #[inline]
    fn read_clkena(&mut self) -> ClockEnable {
        self.regs.read_clkena()
    }
    #[inline]
    fn write_clkena(&mut self, value: ClockEnable) {
        self.regs.write_clkena(value)
    }
    #[inline]
    fn write_tmout(&mut self, value: u32) {
        self.regs.write_tmout(value)
    }
    #[inline]
    fn write_ctype(&mut self, value: CardType) {
        self.regs.write_ctype(value)
    }
    #[inline]
    fn write_blksiz(&mut self, value: u32) {
        self.regs.write_blksiz(value)
    }
    #[inline]
    fn write_bytcnt(&mut self, value: u32) {
        self.regs.write_bytcnt(value)
    }
    #[inline]
    fn read_intmask(&mut self) -> Interrupts {
        self.regs.read_intmask()
    }
    #[inline]
    fn write_intmask(&mut self, value: Interrupts) {
        self.regs.write_intmask(value)
    }
    #[inline]
    fn write_cmdarg(&mut self, value: u32) {
        self.regs.write_cmdarg(value)
    }
    #[inline]
    fn read_cmd(&mut self) -> Command {
        self.regs.read_cmd()
    }
    #[inline]
    fn write_cmd(&mut self, value: Command) {
        self.regs.write_cmd(value)
    }
    #[inline]
    fn read_response(&mut self) -> [u32; 4] {
        [
            self.regs.read_resp0(),
            self.regs.read_resp1(),
            self.regs.read_resp2(),
            self.regs.read_resp3(),
        ]
    }
    #[inline]
    fn read_mintsts(&mut self) -> Interrupts {
        self.regs.read_mintsts()
    }
    #[inline]
    fn read_rintsts(&mut self) -> Interrupts {
        self.regs.read_rintsts()
    }
    #[inline]
    fn write_rintsts(&mut self, value: Interrupts) {
        self.regs.write_rintsts(value)
    }
    #[inline]
    fn read_status(&mut self) -> Status {
        self.regs.read_status()
    }
    #[inline]
    fn read_fifoth(&mut self) -> FifoThreshold {
        self.regs.read_fifoth()
    }
    #[inline]
    fn write_fifoth(&mut self, value: FifoThreshold) {
        self.regs.write_fifoth(value)
    }
    #[inline]
    fn read_cdetect(&mut self) -> u32 {
        self.regs.read_cdetect()
    }
    #[inline]
    fn read_wrtprt(&mut self) -> u32 {
        self.regs.read_wrtprt()
    }
    #[inline]
    fn read_tcbcnt(&mut self) -> u32 {
        self.regs.read_tcbcnt()
    }
    #[inline]
    fn read_tbbcnt(&mut self) -> u32 {
        self.regs.read_tbbcnt()
    }
    #[inline]
    fn read_verid(&mut self) -> u32 {
        self.regs.read_verid()
    }
    #[inline]
    fn read_hcon(&mut self) -> HardwareConfig {
        self.regs.read_hcon()
    }
    #[inline]
    fn read_uhs_reg(&mut self) -> UhsControl {
        self.regs.read_uhs_reg()
    }
    #[inline]
    fn write_uhs_reg(&mut self, value: UhsControl) {
        self.regs.write_uhs_reg(value)
    }
    #[inline]
    fn read_bmod(&mut self) -> BusMode {
        self.regs.read_bmod()
    }
    #[inline]
    fn write_bmod(&mut self, value: BusMode) {
        self.regs.write_bmod(value)
    }
    #[inline]
    fn write_pldmnd(&mut self, value: u32) {
        self.regs.write_pldmnd(value)
    }
    #[inline]
    fn write_dbaddr(&mut self, value: u32) {
        self.regs.write_dbaddr(value)
    }
    #[inline]
    fn read_idsts(&mut self) -> IdmacInterrupts {
        self.regs.read_idsts()
    }
    #[inline]
    fn write_idsts(&mut self, value: IdmacInterrupts) {
        self.regs.write_idsts(value)
    }
    #[inline]
    fn read_idinten(&mut self) -> IdmacInterrupts {
        self.regs.read_idinten()
    }
    #[inline]
    fn write_idinten(&mut self, value: IdmacInterrupts) {
        self.regs.write_idinten(value)
    }
    #[inline]
    fn read_dscaddr(&mut self) -> u32 {
        self.regs.read_dscaddr()
    }
    #[inline]
    fn read_bufaddr(&mut self) -> u32 {
        self.regs.read_bufaddr()
    }
    #[inline]
    fn read_clksel(&mut self) -> ClockSelect {
        self.regs.read_clksel()
    }
    #[inline]
    fn write_clksel(&mut self, value: ClockSelect) {
        self.regs.write_clksel(value)
    }
    #[inline]
    fn write_cdthrctl(&mut self, value: CardThresholdControl) {
        self.regs.write_cdthrctl(value)
    }

    fn read_fifo(&mut self, width: DataWidth) -> u64 {
        // Safety: The FIFO address was derived from the register block base address.
        unsafe {
            match width {
                DataWidth::Bits16 => core::ptr::read_volatile(self.fifo as *const u16) as u64,
                DataWidth::Bits32 => core::ptr::read_volatile(self.fifo as *const u32) as u64,
                DataWidth::Bits64 => core::ptr::read_volatile(self.fifo as *const u64),
            }
        }
    }

    fn write_fifo(&mut self, width: DataWidth, value: u64) {
        // Safety: The FIFO address was derived from the register block base address.
        unsafe {
            match width {
                DataWidth::Bits16 => core::ptr::write_volatile(self.fifo as *mut u16, value as u16),
                DataWidth::Bits32 => core::ptr::write_volatile(self.fifo as *mut u32, value as u32),
                DataWidth::Bits64 => core::ptr::write_volatile(self.fifo as *mut u64, value),
            }
        }
    }
}

/// Set the given self-clearing reset bits and wait for the controller to clear them.
pub(crate) fn wait_reset<R: HostRegisters, D: embedded_hal::delay::DelayNs>(
    regs: &mut R,
    delay: &mut D,
    reset: Control,
) -> Result<(), crate::error::ResetTimeout> {
    let mask = reset.raw_value() & RESET_MASK;
    regs.modify_ctrl(|ctrl| Control::new_with_raw_value(ctrl.raw_value() | mask));
    if poll_until(delay, RESET_POLLS, 1, || regs.read_ctrl().raw_value() & mask == 0) {
        return Ok(());
    }
    log::error!(
        "timeout resetting block (ctrl {:#010x})",
        regs.read_ctrl().raw_value()
    );
    Err(crate::error::ResetTimeout(mask))
}

/// Controller, FIFO and DMA reset bits of the control register.
pub(crate) const RESET_MASK: u32 = 0b111;
/// Reset poll budget of 500 ms in 1 us steps.
const RESET_POLLS: u32 = 500_000;

/// Poll `done` until it returns true, with `polls` attempts spaced by `interval_us`.
pub(crate) fn poll_until<D: embedded_hal::delay::DelayNs>(
    delay: &mut D,
    polls: u32,
    interval_us: u32,
    mut done: impl FnMut() -> bool,
) -> bool {
    for _ in 0..polls {
        if done() {
            return true;
        }
        delay.delay_us(interval_us);
    }
    done()
}
