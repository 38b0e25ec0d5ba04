//! Request start, bus setup and command issue.
use core::{
    mem,
    sync::atomic::{Ordering, fence},
};

use arbitrary_int::{u5, u6};
use dwmmc::{CardType, Interrupts};

use super::Host;
use crate::{
    SlotId,
    board::{Board, BusWidth, HostNotifier, Timing},
    clock::{CardClockDivider, enable_card_clock, program_card_clock},
    dma::{DescriptorChain, check_layout},
    error::{DmaBuildError, Error, ResetTimeout},
    pio::PioTransfer,
    regs::HostRegisters,
    request::{CCCR_ABORT, Command, Data, Direction, Request, ResponseType, opcode},
    state::{ActiveRequest, DataPath, HostState, Issued, Phase},
};

/// RX and TX data request interrupts used by the PIO engine.
pub(crate) const PIO_INTERRUPTS: Interrupts = Interrupts::new_with_raw_value(0)
    .with_rx_data_request(true)
    .with_tx_data_request(true);

/// Stop or abort command issued when the caller supplied none.
///
/// Block reads and writes get CMD12. An SDIO extended transfer is aborted by a CMD52 write to
/// the CCCR abort register with the function number of the transfer.
pub(crate) fn generated_stop(request: &Request) -> Option<Command> {
    if request.data.is_none() || request.stop.is_some() {
        return None;
    }
    match request.cmd.opcode {
        opcode::READ_SINGLE_BLOCK
        | opcode::READ_MULTIPLE_BLOCK
        | opcode::WRITE_BLOCK
        | opcode::WRITE_MULTIPLE_BLOCK => Some(Command::new(
            opcode::STOP_TRANSMISSION,
            0,
            ResponseType::R1b,
        )),
        opcode::IO_RW_EXTENDED => {
            let function = (request.cmd.arg >> 28) & 0x7;
            Some(Command::new(
                opcode::IO_RW_DIRECT,
                (1 << 31) | (CCCR_ABORT << 9) | function,
                ResponseType::R5,
            ))
        }
        _ => None,
    }
}

impl<R: HostRegisters, B: Board, N: HostNotifier> Host<'_, R, B, N> {
    /// Put a request on the bus. Returns false if it was completed right away.
    pub(crate) fn start_request(&mut self, slot: SlotId, mut request: Request) -> bool {
        let Some(idx) = self.slot_index(slot) else {
            request.fail(Error::InvalidRequest);
            self.notifier.request_done(slot, request);
            return false;
        };
        if !self.slots[idx].present {
            request.fail(Error::NoMedium);
            self.notifier.request_done(slot, request);
            return false;
        }
        request.clear_results();
        let first = request.sbc.as_ref().unwrap_or(&request.cmd);
        let skip_busy_wait = first.is_abort() || first.opcode == opcode::SEND_STATUS;

        self.current_slot = Some(slot);
        self.board.select_slot(slot);
        if !skip_busy_wait && let Err(err) = self.wait_data_busy(slot) {
            request.fail(err);
            self.notifier.request_done(slot, request);
            return false;
        }
        if let Err(err) = self.setup_bus(slot) {
            log::error!("slot {}: bus setup failed: {err}", slot.value());
            request.fail(Error::Timeout);
            self.notifier.request_done(slot, request);
            return false;
        }

        self.board
            .arm_request_watchdog(self.config.watchdog_timeout(request.cmd.opcode));
        self.events.clear();
        self.latched.clear();
        let mut active = ActiveRequest::new(slot, request);
        active.generated_stop = generated_stop(&active.request);
        let first = if active.request.sbc.is_some() {
            Issued::Sbc
        } else {
            Issued::Main
        };
        self.issue(&mut active, first);
        self.state = HostState::Busy {
            active,
            phase: Phase::SendingCommand,
        };
        true
    }

    /// Wait until the card releases the data line before a command which needs it.
    ///
    /// The card clock is switched back on after the controller had to be reset.
    fn wait_data_busy(&mut self, slot: SlotId) -> Result<(), Error> {
        let polls = self.config.busy_polls_per_round();
        let interval = self.config.busy_poll_interval.to_micros();
        if self.wait_data_idle(slot, self.config.busy_retries, polls, interval)? {
            let low_power = !self.slots[slot.value() as usize].sdio_irq;
            enable_card_clock(&mut self.regs, &mut self.board, slot, low_power)?;
        }
        Ok(())
    }

    /// Program the card clock and the bus width of a slot.
    ///
    /// The clock divider is only reprogrammed if the slot or its clock changed since the last
    /// request.
    fn setup_bus(&mut self, slot: SlotId) -> Result<(), ResetTimeout> {
        let state = self.slots[slot.value() as usize];
        if state.clock.raw() != 0 && self.current_clock != Some((slot, state.clock)) {
            if let Some(divider) = CardClockDivider::calculate(self.config.bus_clock, state.clock)
            {
                if divider.actual() > state.clock {
                    log::warn!(
                        "slot {}: card clock {} Hz above requested {} Hz, using legacy timing",
                        slot.value(),
                        divider.actual().raw(),
                        state.clock.raw()
                    );
                    self.board
                        .set_io_timing(slot, Timing::Legacy, self.tuning.in_progress);
                }
                program_card_clock(
                    &mut self.regs,
                    &mut self.board,
                    slot,
                    divider,
                    !state.sdio_irq,
                )?;
                log::info!(
                    "slot {}: card clock {} Hz (requested {} Hz, divider {})",
                    slot.value(),
                    divider.actual().raw(),
                    state.clock.raw(),
                    divider.divider()
                );
            }
            self.current_clock = Some((slot, state.clock));
        }

        let ctype = self
            .slots
            .iter()
            .enumerate()
            .fold(CardType::new_with_raw_value(0), |ctype, (idx, entry)| {
                let bit = 1u16 << idx;
                match entry.width {
                    BusWidth::One => ctype,
                    BusWidth::Four => ctype.with_width_4(ctype.width_4() | bit),
                    BusWidth::Eight => ctype.with_width_8(ctype.width_8() | bit),
                }
            });
        self.regs.write_ctype(ctype);
        Ok(())
    }

    /// Write the selected command of the active request to the controller.
    ///
    /// The main command of a data request also sets up the transfer size and the data path.
    pub(crate) fn issue(&mut self, active: &mut ActiveRequest, which: Issued) {
        active.issued = which;
        let slot = active.slot;
        let need_init = self
            .slot_index(slot)
            .is_some_and(|idx| mem::take(&mut self.slots[idx].need_init));
        let mut direction = None;
        if which == Issued::Main
            && let Some(data) = active.request.data.as_ref()
        {
            direction = Some(data.direction);
            self.regs.write_tmout(u32::MAX);
            self.regs.write_bytcnt(data.len() as u32);
            self.regs.write_blksiz(data.block_size);
            self.prepare_data(active);
        }
        let Some(cmd) = active.issued_command() else {
            return;
        };
        let flags = self.command_flags(slot, cmd, direction, need_init);
        let arg = cmd.arg;
        self.start_command(flags, arg);
    }

    fn command_flags(
        &self,
        slot: SlotId,
        cmd: &Command,
        data: Option<Direction>,
        need_init: bool,
    ) -> dwmmc::Command {
        let mut flags = dwmmc::Command::new_with_raw_value(0)
            .with_index(u6::new(cmd.opcode & 0x3F))
            .with_card_number(u5::new(slot.value()))
            .with_use_hold_register(self.hold_register);
        if cmd.opcode == opcode::VOLTAGE_SWITCH {
            flags = flags.with_voltage_switch(true);
        }
        if cmd.is_abort() {
            flags = flags.with_stop_abort(true);
        } else if cmd.opcode != opcode::SEND_STATUS {
            flags = flags.with_wait_previous_data_complete(true);
        }
        if cmd.response_type.expects_response() {
            flags = flags
                .with_response_expected(true)
                .with_long_response(cmd.response_type.is_long())
                .with_check_response_crc(cmd.response_type.has_crc());
        }
        match data {
            Some(Direction::Write) => flags = flags.with_data_expected(true).with_write(true),
            // The hardware read timeout is replaced by the software monitor.
            Some(Direction::Read) => {
                flags = flags
                    .with_data_expected(true)
                    .with_read_ceata_device(self.data_timeout.enabled)
            }
            None => (),
        }
        if need_init {
            flags = flags.with_send_initialization(true);
        }
        flags
    }

    fn start_command(&mut self, flags: dwmmc::Command, arg: u32) {
        self.regs
            .write_rintsts(Interrupts::new_with_raw_value(0).with_end_bit_error(true));
        self.regs.write_cmdarg(arg);
        fence(Ordering::SeqCst);
        self.regs.write_cmd(flags.with_start(true));
        log::trace!(
            "CMD{} arg {arg:#010x} flags {:#010x}",
            flags.index().value(),
            flags.raw_value()
        );
    }

    /// Choose the data path of the active request. DMA is tried first, any layout or ring
    /// problem falls back to PIO.
    fn prepare_data(&mut self, active: &mut ActiveRequest) {
        let Some(data) = active.request.data.as_mut() else {
            return;
        };
        if self.ring.is_some() {
            match self.start_dma(data, &mut active.mapped_here) {
                Ok(chain) => {
                    active.data_path = DataPath::Dma(chain);
                    return;
                }
                Err(err) => log::debug!(
                    "CMD{}: {err}, using PIO for {} bytes",
                    active.request.cmd.opcode,
                    data.len()
                ),
            }
        }

        if self.regs.read_status().fifo_count().value() > 0
            && let Err(err) = self.reset_fifo()
        {
            log::error!("FIFO reset before PIO transfer failed: {err}");
        }
        self.regs.write_rintsts(PIO_INTERRUPTS);
        self.regs.modify_intmask(|mask| {
            Interrupts::new_with_raw_value(mask.raw_value() | PIO_INTERRUPTS.raw_value())
        });
        self.regs.modify_ctrl(|ctrl| ctrl.with_dma_enable(false));
        active.data_path = DataPath::Pio(PioTransfer::new());
    }

    fn start_dma(
        &mut self,
        data: &mut Data,
        mapped_here: &mut bool,
    ) -> Result<DescriptorChain, DmaBuildError> {
        let alignment = self.dma_alignment();
        check_layout(data, alignment)?;
        if !data.pre_staged {
            self.map_segments(data);
            *mapped_here = true;
        }
        let built = match self.ring.as_mut() {
            Some(ring) => ring.build(data, alignment),
            None => Err(DmaBuildError::RingOverflow),
        };
        let chain = match built {
            Ok(chain) => chain,
            Err(err) => {
                if *mapped_here {
                    self.unmap_segments(data);
                    *mapped_here = false;
                }
                return Err(err);
            }
        };

        self.regs.modify_ctrl(|ctrl| ctrl.with_dma_enable(true));
        self.regs.write_rintsts(PIO_INTERRUPTS);
        self.regs.modify_intmask(|mask| {
            Interrupts::new_with_raw_value(mask.raw_value() & !PIO_INTERRUPTS.raw_value())
        });
        if let Some(ring) = self.ring.as_mut() {
            ring.start(&mut self.regs, &chain);
        }
        log::trace!(
            "DMA transfer of {} bytes in {} descriptors",
            chain.len(),
            chain.descriptor_count()
        );
        Ok(chain)
    }

    /// Issue the stop of the active request. The caller's stop is preferred over a generated
    /// one. Returns false if the request has neither.
    pub(crate) fn send_stop(&mut self, active: &mut ActiveRequest) -> bool {
        let which = if active.request.stop.is_some() {
            Issued::Stop
        } else if active.generated_stop.is_some() {
            Issued::GeneratedStop
        } else {
            return false;
        };
        active.stop_sent = true;
        self.issue(active, which);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        board::{BusParameters, PowerMode, SignalVoltage},
        host::Submission,
        sim::{self, leak_buffer},
        time::Hertz,
    };

    fn power_up(host: &mut sim::SimHost, slot: SlotId, clock: Hertz, width: BusWidth) {
        let params = BusParameters::new(
            width,
            clock,
            Timing::Legacy,
            SignalVoltage::V330,
            PowerMode::Up,
        );
        host.set_bus_parameters(slot, params).unwrap();
    }

    fn finish_command(host: &mut sim::SimHost) {
        host.regs.complete_command(0x900);
        host.on_interrupt();
        host.run_state_machine();
    }

    #[test]
    fn first_command_sends_initialization() {
        let mut host = sim::host(sim::config());
        let slot = SlotId::new(0);
        power_up(&mut host, slot, Hertz::kHz(400), BusWidth::Four);
        let idle = Request::new(Command::new(opcode::GO_IDLE_STATE, 0, ResponseType::None));
        assert_eq!(host.submit(slot, idle).unwrap(), Submission::Started);
        let (flags, _) = host.regs.last_command().unwrap();
        assert!(flags.send_initialization() && flags.stop_abort());
        assert!(!flags.wait_previous_data_complete() && !flags.response_expected());
        assert_eq!(host.regs.clkdiv, 125);
        assert_eq!(host.regs.ctype.width_4(), 0b01);
        finish_command(&mut host);
        assert!(host.is_idle());

        let status = Request::new(Command::new(opcode::SEND_STATUS, 1 << 16, ResponseType::R1));
        host.submit(slot, status).unwrap();
        let (flags, arg) = host.regs.last_command().unwrap();
        assert_eq!(arg, 1 << 16);
        assert!(!flags.send_initialization() && !flags.wait_previous_data_complete());
        assert!(flags.response_expected() && flags.check_response_crc());
        assert_eq!(flags.index().value(), opcode::SEND_STATUS);
    }

    #[test]
    fn clock_divider_programmed_once_per_rate() {
        let mut host = sim::host(sim::config());
        let slot = SlotId::new(0);
        power_up(&mut host, slot, Hertz::MHz(25), BusWidth::One);
        for _ in 0..2 {
            let status = Request::new(Command::new(opcode::SEND_STATUS, 0, ResponseType::R1));
            host.submit(slot, status).unwrap();
            finish_command(&mut host);
        }
        let clock_updates = host
            .regs
            .command_log
            .iter()
            .filter(|(cmd, _)| cmd.update_clock_registers_only())
            .count();
        assert_eq!(clock_updates, 3);
        assert_eq!(host.regs.clkdiv, 2);
    }

    #[test]
    fn clock_above_request_resets_timing() {
        let mut host = sim::host(sim::config());
        let slot = SlotId::new(1);
        power_up(&mut host, slot, Hertz::kHz(100), BusWidth::One);
        let status = Request::new(Command::new(opcode::SEND_STATUS, 0, ResponseType::R1));
        host.submit(slot, status).unwrap();
        assert_eq!(host.regs.clkdiv, 255);
        assert_eq!(host.board.io_timings.last(), Some(&(slot, Timing::Legacy, false)));
    }

    #[test]
    fn generated_stops() {
        let data = || Data::new(Direction::Read, 512, 1).with_segment(leak_buffer(512)).unwrap();
        let read = Request::new(Command::new(opcode::READ_MULTIPLE_BLOCK, 0, ResponseType::R1))
            .with_data(data());
        let stop = generated_stop(&read).unwrap();
        assert_eq!(stop.opcode, opcode::STOP_TRANSMISSION);
        assert!(stop.is_abort());

        let extended =
            Request::new(Command::new(opcode::IO_RW_EXTENDED, 2 << 28, ResponseType::R5))
                .with_data(data());
        let abort = generated_stop(&extended).unwrap();
        assert_eq!(abort.opcode, opcode::IO_RW_DIRECT);
        assert_eq!(abort.arg, 0x8000_0000 | (CCCR_ABORT << 9) | 2);
        assert!(abort.is_cccr_abort_write());

        let tuning = Request::new(Command::new(opcode::SEND_TUNING_BLOCK, 0, ResponseType::R1))
            .with_data(data());
        assert!(generated_stop(&tuning).is_none());
        let with_stop = Request::new(Command::new(opcode::READ_SINGLE_BLOCK, 0, ResponseType::R1))
            .with_data(data())
            .with_stop(Command::new(opcode::STOP_TRANSMISSION, 0, ResponseType::R1b));
        assert!(generated_stop(&with_stop).is_none());
    }

    #[test]
    fn misaligned_buffer_falls_back_to_pio() {
        let mut host = sim::host(sim::config());
        host.board.misalign_dma = true;
        let data = Data::new(Direction::Read, 512, 1).with_segment(leak_buffer(512)).unwrap();
        let read = Request::new(Command::new(opcode::READ_SINGLE_BLOCK, 0, ResponseType::R1))
            .with_data(data);
        host.submit(SlotId::new(0), read).unwrap();
        let HostState::Busy { active, .. } = &host.state else {
            panic!("request must be active");
        };
        assert!(matches!(active.data_path, DataPath::Pio(_)));
        assert!(!active.mapped_here);
        assert_eq!(host.board.mapped.len(), 1);
        assert_eq!(host.board.unmapped.len(), 1);
        assert!(host.regs.intmask.rx_data_request());
        assert!(!host.regs.ctrl.dma_enable());
        assert_eq!(host.regs.bytcnt, 512);
        let (flags, _) = host.regs.last_command().unwrap();
        assert!(flags.data_expected() && !flags.write());
    }

    #[test]
    fn data_command_waits_for_busy_card() {
        let mut host = sim::host(sim::config());
        host.regs.data_busy = true;
        let data = Data::new(Direction::Write, 512, 1).with_segment(leak_buffer(512)).unwrap();
        let write =
            Request::new(Command::new(opcode::WRITE_BLOCK, 0, ResponseType::R1)).with_data(data);
        let submission = host.submit(SlotId::new(0), write).unwrap();
        assert_eq!(submission, Submission::Completed);
        let (_, request) = host.notifier.done.pop().unwrap();
        assert_eq!(request.outcome(), Err(Error::NotRecoverable));
        assert!(host.regs.card_commands().is_empty());
        assert!(host.is_idle());

        // Status commands never wait.
        let status = Request::new(Command::new(opcode::SEND_STATUS, 0, ResponseType::R1));
        assert_eq!(host.submit(SlotId::new(0), status).unwrap(), Submission::Started);
    }
}
