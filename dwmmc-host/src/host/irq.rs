//! Interrupt handling: status acknowledge, PIO data movement and event posting.
use dwmmc::{IdmacInterrupts, Interrupts};

use super::{Host, issue::PIO_INTERRUPTS};
use crate::{
    MAX_SLOTS, SlotId,
    board::{Board, HostNotifier},
    regs::HostRegisters,
    request::Direction,
    state::{DataPath, Event, HostState},
};

/// Status bits are re-read this often before the handler gives up.
const MAX_PASSES: usize = 6;

/// Response timeout, response CRC and response error.
pub(crate) const CMD_ERRORS: Interrupts = Interrupts::new_with_raw_value(0)
    .with_response_timeout(true)
    .with_response_crc(true)
    .with_response_error(true);

/// Data read timeout, data CRC, host timeout, FIFO under/overrun, start and end bit error.
pub(crate) const DATA_ERRORS: Interrupts = Interrupts::new_with_raw_value(0)
    .with_data_read_timeout(true)
    .with_data_crc(true)
    .with_host_timeout(true)
    .with_fifo_underrun_overrun(true)
    .with_start_bit_error(true)
    .with_end_bit_error(true);

/// What the caller of [Host::on_interrupt] has to schedule.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct InterruptResult {
    /// Events were posted, run [Host::run_state_machine].
    pub bottom_half: bool,
    /// The card detect line changed, run [Host::handle_card_detect].
    pub card_detect: bool,
}

pub(crate) const fn default_interrupt_mask() -> Interrupts {
    Interrupts::new_with_raw_value(CMD_ERRORS.raw_value() | DATA_ERRORS.raw_value())
        .with_command_done(true)
        .with_data_over(true)
        .with_tx_data_request(true)
        .with_rx_data_request(true)
        .with_hardware_locked_error(true)
        .with_card_detect(true)
}

#[inline]
fn has_any(status: Interrupts, mask: Interrupts) -> bool {
    status.raw_value() & mask.raw_value() != 0
}

#[inline]
fn merge(a: Interrupts, b: Interrupts) -> Interrupts {
    Interrupts::new_with_raw_value(a.raw_value() | b.raw_value())
}

impl<R: HostRegisters, B: Board, N: HostNotifier> Host<'_, R, B, N> {
    /// Top half. Acknowledges the controller and DMA status, moves PIO data and posts events.
    ///
    /// Never blocks. Returns which deferred work has to run.
    pub fn on_interrupt(&mut self) -> InterruptResult {
        let mut result = InterruptResult::default();
        let mut handled = false;
        for _ in 0..MAX_PASSES {
            let mut pending = self.regs.read_mintsts();
            if pending.raw_value() == 0 {
                break;
            }
            handled = true;

            if pending.hardware_locked_error() {
                let hle = Interrupts::new_with_raw_value(0).with_hardware_locked_error(true);
                self.regs.write_rintsts(hle);
                self.latched.cmd = self.latched.cmd.with_hardware_locked_error(true);
                result.bottom_half = true;
            }

            if has_any(pending, CMD_ERRORS) {
                self.regs.write_rintsts(CMD_ERRORS);
                self.latched.cmd = pending;
                self.events.post(Event::CommandComplete);
            }

            // Voltage switch and clock update completion share the host timeout bit.
            if pending.host_timeout() {
                let cmd = self.regs.read_cmd();
                if cmd.voltage_switch() || cmd.update_clock_registers_only() {
                    self.regs
                        .write_rintsts(Interrupts::new_with_raw_value(0).with_host_timeout(true));
                    self.command_interrupt(pending);
                    pending = pending.with_host_timeout(false);
                }
            }

            if has_any(pending, DATA_ERRORS) {
                if pending.host_timeout() {
                    self.dump_registers();
                }
                self.regs.write_rintsts(DATA_ERRORS);
                self.latched.data = merge(self.latched.data, pending);
                self.events.post(Event::DataError);
                if pending.start_bit_error() {
                    self.events.post(Event::DataComplete);
                }
            }

            if pending.data_over() {
                self.regs
                    .write_rintsts(Interrupts::new_with_raw_value(0).with_data_over(true));
                if self.latched.data.raw_value() == 0 {
                    self.latched.data = pending;
                }
                self.pio_data_over();
                self.events.post(Event::DataComplete);
            }

            if pending.rx_data_request() {
                self.regs
                    .write_rintsts(Interrupts::new_with_raw_value(0).with_rx_data_request(true));
                self.pio_read(false);
            }

            if pending.tx_data_request() {
                self.regs
                    .write_rintsts(Interrupts::new_with_raw_value(0).with_tx_data_request(true));
                self.pio_write();
            }

            if pending.command_done() {
                self.regs
                    .write_rintsts(Interrupts::new_with_raw_value(0).with_command_done(true));
                self.command_interrupt(pending);
            }

            if pending.card_detect() {
                self.regs
                    .write_rintsts(Interrupts::new_with_raw_value(0).with_card_detect(true));
                result.card_detect = true;
            }

            let sdio = pending.sdio();
            if sdio != 0 {
                self.regs
                    .write_rintsts(Interrupts::new_with_raw_value(0).with_sdio(sdio));
                for idx in 0..MAX_SLOTS.min(self.slots.len()) {
                    if sdio & (1 << idx) != 0 {
                        self.notifier.sdio_interrupt(SlotId::new(idx as u8));
                    }
                }
            }
        }

        if self.ring.is_some() {
            handled |= self.dma_interrupt();
        }
        if !handled {
            log::warn!("spurious interrupt");
        }
        result.bottom_half |= !self.events.is_empty();
        result
    }

    fn command_interrupt(&mut self, status: Interrupts) {
        if self.latched.cmd.raw_value() == 0 {
            self.latched.cmd = status;
        }
        self.events.post(Event::CommandComplete);
    }

    fn dma_interrupt(&mut self) -> bool {
        let status = self.regs.read_idsts();
        let mut handled = false;
        if status.transmit() || status.receive() {
            self.regs.write_idsts(
                IdmacInterrupts::new_with_raw_value(0)
                    .with_transmit(true)
                    .with_receive(true),
            );
            self.regs
                .write_idsts(IdmacInterrupts::new_with_raw_value(0).with_normal_summary(true));
            if let Some(ring) = self.ring.as_mut() {
                ring.complete();
            }
            if !self.state.is_idle() {
                self.events.post(Event::TransferComplete);
            }
            handled = true;
        }
        if status.descriptor_unavailable() {
            self.regs.write_idsts(
                IdmacInterrupts::new_with_raw_value(0)
                    .with_descriptor_unavailable(true)
                    .with_abnormal_summary(true),
            );
            log::warn!("DMA descriptor unavailable");
            self.latched.dma = status;
            self.events.post(Event::DataError);
            handled = true;
        }
        handled
    }

    fn pio_read(&mut self, final_pass: bool) {
        let HostState::Busy { active, .. } = &mut self.state else {
            return;
        };
        let (DataPath::Pio(pio), Some(data)) =
            (&mut active.data_path, active.request.data.as_mut())
        else {
            return;
        };
        if data.direction == Direction::Read
            && pio.read(&mut self.regs, self.width, data, final_pass)
        {
            self.finish_pio();
        }
    }

    fn pio_write(&mut self) {
        let HostState::Busy { active, .. } = &mut self.state else {
            return;
        };
        let (DataPath::Pio(pio), Some(data)) = (&mut active.data_path, active.request.data.as_ref())
        else {
            return;
        };
        if data.direction == Direction::Write
            && pio.write(&mut self.regs, self.width, self.fifo_depth, data)
        {
            self.finish_pio();
        }
    }

    /// The controller ended the data phase. Drain a PIO read and stop the PIO engine.
    fn pio_data_over(&mut self) {
        self.pio_read(true);
        if let HostState::Busy { active, .. } = &self.state
            && matches!(active.data_path, DataPath::Pio(_))
        {
            self.finish_pio();
        }
    }

    fn finish_pio(&mut self) {
        self.regs.write_rintsts(PIO_INTERRUPTS);
        self.regs.modify_intmask(|mask| {
            Interrupts::new_with_raw_value(mask.raw_value() & !PIO_INTERRUPTS.raw_value())
        });
        if let HostState::Busy { active, .. } = &mut self.state {
            active.data_path = DataPath::None;
        }
        self.events.post(Event::TransferComplete);
    }
}
