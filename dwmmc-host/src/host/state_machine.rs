//! Bottom half: the request state machine and its timeouts.
use core::mem;

use dwmmc::Interrupts;

use super::{DATA_TIMEOUT_LIMIT, DATA_TIMEOUT_PERIOD, Host, issue::PIO_INTERRUPTS};
use crate::{
    SlotId,
    board::{Board, HostNotifier},
    error::Error,
    regs::HostRegisters,
    request::Direction,
    state::{ActiveRequest, DataPath, Event, HostState, Issued, Phase, State},
};

/// Consecutive data CRC errors marked for retry.
const CRC_RETRY_LIMIT: u8 = 5;
/// Delay after a failed command on controllers which need it before a retry.
const RETRY_DELAY_MS: u32 = 20;

impl<R: HostRegisters, B: Board, N: HostNotifier> Host<'_, R, B, N> {
    /// Advance the active request on the posted events.
    ///
    /// Runs phases until one has to wait for an event. A completed request is handed to the
    /// notifier and the next queued request is started.
    pub fn run_state_machine(&mut self) {
        let HostState::Busy { mut active, mut phase } =
            mem::replace(&mut self.state, HostState::Idle)
        else {
            self.events.clear();
            return;
        };
        if self.latched.cmd.hardware_locked_error() {
            self.events.take(Event::CommandComplete);
            self.latched.cmd = self.latched.cmd.with_hardware_locked_error(false);
            log::error!("hardware locked write error, command not accepted");
            self.state = HostState::Busy { active, phase };
            return;
        }
        loop {
            match self.step(&mut active, phase) {
                Some(next) if next == phase => {
                    self.state = HostState::Busy { active, phase };
                    return;
                }
                Some(next) => {
                    log::trace!("{:?} -> {:?}", State::from(phase), State::from(next));
                    phase = next;
                }
                None => {
                    self.request_end(active);
                    return;
                }
            }
        }
    }

    /// Run one phase. Returns the next phase or [None] once the request is complete.
    fn step(&mut self, active: &mut ActiveRequest, phase: Phase) -> Option<Phase> {
        match phase {
            Phase::SendingCommand => {
                if !self.events.take(Event::CommandComplete) {
                    return Some(phase);
                }
                let err = self.command_complete(active);
                if active.issued == Issued::Sbc {
                    if err.is_some() {
                        return None;
                    }
                    self.issue(active, Issued::Main);
                    return Some(Phase::SendingCommand);
                }
                if err.is_some() {
                    if !active.has_data() {
                        return None;
                    }
                    self.stop_data_path(active);
                    self.reset_once(active);
                    return self.send_stop(active).then_some(Phase::SendingStop);
                }
                let read = active
                    .request
                    .data
                    .as_ref()
                    .map(|data| data.direction == Direction::Read)?;
                if read && self.data_timeout.enabled {
                    self.start_data_timeout_monitor();
                }
                Some(Phase::SendingData)
            }
            Phase::SendingData => {
                if self.events.take(Event::DataError) {
                    self.events.post(Event::TransferComplete);
                    return Some(Phase::DataError);
                }
                if self.events.take(Event::TransferComplete) {
                    return Some(Phase::DataBusy);
                }
                Some(phase)
            }
            Phase::DataError => {
                if !self.events.take(Event::TransferComplete) {
                    return Some(phase);
                }
                self.recover_descriptor_unavailable(active);
                self.stop_data_path(active);
                self.reset_once(active);
                if !active.stop_sent {
                    self.send_stop(active);
                }
                self.events.post(Event::DataComplete);
                Some(Phase::DataBusy)
            }
            Phase::DataBusy => {
                if !self.events.take(Event::DataComplete) {
                    return Some(phase);
                }
                self.stop_data_timeout_monitor();
                let err = self.data_error(active);
                if let Some(data) = active.request.data.as_mut() {
                    data.error = err;
                    data.bytes_transferred = if err.is_some() { 0 } else { data.len() };
                }
                if err.is_some() {
                    self.stop_data_path(active);
                    self.reset_once(active);
                    if active.stop_sent || self.send_stop(active) {
                        return Some(Phase::SendingStop);
                    }
                    return None;
                }
                self.crc_retries = 0;
                if active.request.stop.is_none() || active.request.sbc.is_some() {
                    return None;
                }
                self.send_stop(active).then_some(Phase::SendingStop)
            }
            Phase::SendingStop => {
                if !self.events.take(Event::CommandComplete) {
                    return Some(phase);
                }
                self.command_complete(active);
                if active.request.cmd.error.is_some() && active.has_data() {
                    self.stop_data_path(active);
                    self.reset_once(active);
                }
                None
            }
        }
    }

    /// Record the response and status of the command on the bus.
    fn command_complete(&mut self, active: &mut ActiveRequest) -> Option<Error> {
        let status = mem::replace(&mut self.latched.cmd, Interrupts::new_with_raw_value(0));
        let response = self.regs.read_response();
        let cmd = active.issued_command_mut()?;
        if cmd.response_type.is_long() {
            cmd.response = [response[3], response[2], response[1], response[0]];
        } else if cmd.response_type.expects_response() {
            cmd.response = [response[0], 0, 0, 0];
        }
        let err = if status.response_timeout() {
            Some(Error::Timeout)
        } else if status.response_crc() && cmd.response_type.has_crc() {
            Some(Error::CrcError)
        } else if status.response_error() {
            Some(Error::ResponseError)
        } else {
            None
        };
        cmd.error = err;
        if let Some(err) = err {
            log::debug!("CMD{} failed: {err}", cmd.opcode);
            if self.config.quirks.retry_delay {
                self.board.delay_ms(RETRY_DELAY_MS);
            }
        }
        err
    }

    /// Classify the latched data status of a finished transfer.
    fn data_error(&mut self, active: &mut ActiveRequest) -> Option<Error> {
        let status = self.latched.data;
        if self.latched.dma.descriptor_unavailable() {
            return Some(Error::DmaDescriptorUnavailable);
        }
        if status.data_read_timeout() {
            if !self.data_timeout.enabled {
                log::warn!("data read timeout, enabling software timeout monitor");
                self.data_timeout.enabled = true;
                active.request.cmd.retries = 1;
            }
            return Some(Error::Timeout);
        }
        if status.data_crc() {
            if self.config.quirks.retry_crc_error
                && !self.tuning.in_progress
                && self.crc_retries < CRC_RETRY_LIMIT
            {
                self.crc_retries += 1;
                self.diagnostics.crc_retries += 1;
                active.request.cmd.retries = 1;
            }
            return Some(Error::CrcError);
        }
        let write = active
            .request
            .data
            .as_ref()
            .is_some_and(|data| data.direction == Direction::Write);
        if status.end_bit_error() && write {
            // No CRC status token from the card.
            return Some(Error::Timeout);
        }
        if status.raw_value() & super::irq::DATA_ERRORS.raw_value() != 0 {
            return Some(Error::FifoError);
        }
        None
    }

    fn recover_descriptor_unavailable(&mut self, active: &ActiveRequest) {
        if !self.config.quirks.dma_suspend_recovery
            || !self.latched.dma.descriptor_unavailable()
        {
            return;
        }
        if let Some(ring) = self.ring.as_mut()
            && ring
                .recover_descriptor_unavailable(
                    &mut self.regs,
                    &mut self.board,
                    active.slot,
                    self.config.du_recovery_budget,
                )
                .is_some()
        {
            self.diagnostics.du_recoveries += 1;
        }
    }

    /// FIFO and controller reset, at most once per request.
    fn reset_once(&mut self, active: &mut ActiveRequest) {
        if !active.reset_done {
            self.reset_after_error();
            active.reset_done = true;
        }
    }

    /// Stop whichever data path is running.
    pub(crate) fn stop_data_path(&mut self, active: &mut ActiveRequest) {
        match mem::replace(&mut active.data_path, DataPath::None) {
            DataPath::Dma(_) => {
                if let Some(ring) = self.ring.as_mut()
                    && let Err(err) = ring.stop(&mut self.regs, &mut self.board)
                {
                    log::error!("stopping DMA failed: {err}");
                }
            }
            DataPath::Pio(_) => self.mask_pio_interrupts(),
            DataPath::None => (),
        }
    }

    pub(crate) fn mask_pio_interrupts(&mut self) {
        self.regs.write_rintsts(PIO_INTERRUPTS);
        self.regs.modify_intmask(|mask| {
            Interrupts::new_with_raw_value(mask.raw_value() & !PIO_INTERRUPTS.raw_value())
        });
    }

    /// Hand a request back to the notifier. The host must already be idle.
    pub(crate) fn finish_request(&mut self, mut active: ActiveRequest) {
        self.board.disarm_request_watchdog();
        self.stop_data_timeout_monitor();
        if active.mapped_here
            && let Some(data) = active.request.data.as_mut()
        {
            self.unmap_segments(data);
        }
        if matches!(active.data_path, DataPath::Pio(_)) {
            self.mask_pio_interrupts();
        }
        self.events.clear();
        self.latched.clear();
        self.diagnostics.completed += 1;
        match active.request.outcome() {
            Ok(bytes) => log::trace!(
                "slot {}: CMD{} done, {bytes} bytes",
                active.slot.value(),
                active.request.cmd.opcode
            ),
            Err(err) => log::debug!(
                "slot {}: CMD{} failed: {err}",
                active.slot.value(),
                active.request.cmd.opcode
            ),
        }
        self.notifier.request_done(active.slot, active.request);
    }

    fn request_end(&mut self, active: ActiveRequest) {
        self.finish_request(active);
        self.start_next();
    }

    /// Start queued requests until one is on the bus.
    pub(crate) fn start_next(&mut self) {
        while self.state.is_idle() {
            let Some((slot, request)) = self.queue.pop_front() else {
                break;
            };
            if self.start_request(slot, request) {
                break;
            }
        }
    }

    /// Complete the active request with an error, without waiting for the hardware.
    ///
    /// Returns false if the host was idle.
    pub(crate) fn abort_active(&mut self, err: Error) -> bool {
        let HostState::Busy { mut active, phase } = mem::replace(&mut self.state, HostState::Idle)
        else {
            return false;
        };
        self.fail_in_phase(&mut active, phase, err);
        self.finish_request(active);
        true
    }

    /// Attach an error to the part of the request the phase belongs to and stop the data path.
    fn fail_in_phase(&mut self, active: &mut ActiveRequest, phase: Phase, err: Error) {
        match phase {
            Phase::SendingCommand | Phase::SendingStop => {
                if let Some(cmd) = active.issued_command_mut() {
                    cmd.error = Some(err);
                }
            }
            Phase::SendingData | Phase::DataBusy | Phase::DataError => {
                if let Some(data) = active.request.data.as_mut() {
                    data.error = Some(err);
                }
            }
        }
        if phase != Phase::SendingStop
            && let Some(data) = active.request.data.as_mut()
        {
            data.bytes_transferred = 0;
        }
        self.stop_data_path(active);
    }

    /// Complete all queued requests, or those of one slot, with an error. The order of the
    /// remaining requests is kept.
    pub(crate) fn fail_queued(&mut self, slot: Option<SlotId>, err: Error) {
        for _ in 0..self.queue.len() {
            let Some((queued_slot, mut request)) = self.queue.pop_front() else {
                break;
            };
            if slot.is_none_or(|slot| slot == queued_slot) {
                request.fail(err);
                self.notifier.request_done(queued_slot, request);
            } else if let Err((queued_slot, mut request)) =
                self.queue.push_back((queued_slot, request))
            {
                request.fail(err);
                self.notifier.request_done(queued_slot, request);
            }
        }
    }

    /// The request watchdog expired.
    ///
    /// The active request completes with [Error::Timeout]. FIFO and controller are reset
    /// before the next request starts.
    pub fn on_request_timeout(&mut self) {
        if self.state.is_idle() {
            return;
        }
        self.diagnostics.watchdog_expiries += 1;
        log::error!("request timeout in state {:?}", self.state());
        self.dump_registers();
        let HostState::Busy { mut active, phase } = mem::replace(&mut self.state, HostState::Idle)
        else {
            return;
        };
        self.fail_in_phase(&mut active, phase, Error::Timeout);
        self.reset_once(&mut active);
        self.request_end(active);
    }

    pub(crate) fn start_data_timeout_monitor(&mut self) {
        self.data_timeout.armed = true;
        self.data_timeout.ticks = 0;
        self.board.arm_data_timeout_monitor(DATA_TIMEOUT_PERIOD);
    }

    pub(crate) fn stop_data_timeout_monitor(&mut self) {
        if self.data_timeout.armed {
            self.data_timeout.armed = false;
            self.data_timeout.ticks = 0;
            self.board.disarm_data_timeout_monitor();
        }
    }

    /// Period of the software data timeout monitor elapsed.
    ///
    /// Returns true if a data read timeout was raised and the bottom half has to run.
    pub fn on_data_timeout_tick(&mut self) -> bool {
        if !self.data_timeout.armed {
            return false;
        }
        if self.events.is_pending(Event::DataComplete)
            || self.regs.read_status().fifo_count().value() > 0
        {
            self.stop_data_timeout_monitor();
            return false;
        }
        self.data_timeout.ticks += 1;
        let limit = DATA_TIMEOUT_LIMIT.ticks() / DATA_TIMEOUT_PERIOD.ticks();
        if self.data_timeout.ticks < limit {
            self.board.arm_data_timeout_monitor(DATA_TIMEOUT_PERIOD);
            return false;
        }
        self.data_timeout.armed = false;
        self.data_timeout.ticks = 0;
        log::warn!("no data within {} ms, raising data read timeout", DATA_TIMEOUT_LIMIT.ticks());
        self.latched.data = self.latched.data.with_data_read_timeout(true);
        self.events.post(Event::DataError);
        self.events.post(Event::DataComplete);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{
        host::Submission,
        request::{Command, Data, Request, ResponseType, opcode},
        sim::{self, SimOp, leak_buffer},
    };

    fn read_request(blocks: u32) -> Request {
        let opcode = if blocks > 1 {
            opcode::READ_MULTIPLE_BLOCK
        } else {
            opcode::READ_SINGLE_BLOCK
        };
        let data = Data::new(Direction::Read, 512, blocks)
            .with_segment(leak_buffer(512 * blocks as usize))
            .unwrap();
        Request::new(Command::new(opcode, 0, ResponseType::R1)).with_data(data)
    }

    fn status_request() -> Request {
        Request::new(Command::new(opcode::SEND_STATUS, 1 << 16, ResponseType::R1))
    }

    fn command_done(host: &mut sim::SimHost) {
        host.regs.complete_command(0x900);
        host.on_interrupt();
        host.run_state_machine();
    }

    fn raise(host: &mut sim::SimHost, irq: Interrupts) {
        host.regs.raise(irq);
        host.on_interrupt();
        host.run_state_machine();
    }

    fn no_irq() -> Interrupts {
        Interrupts::new_with_raw_value(0)
    }

    #[test]
    fn dma_read_completes() {
        let mut host = sim::host(sim::config());
        let slot = SlotId::new(0);
        assert_eq!(host.submit(slot, read_request(1)).unwrap(), Submission::Started);
        assert!(host.board.watchdog.is_some());
        command_done(&mut host);
        assert_eq!(host.state(), State::SendingData);
        host.regs.complete_dma(Direction::Read);
        host.on_interrupt();
        host.run_state_machine();

        assert!(host.is_idle());
        assert_eq!(host.notifier.done.len(), 1);
        let (done_slot, request) = &host.notifier.done[0];
        assert_eq!(*done_slot, slot);
        assert_eq!(request.outcome(), Ok(512));
        assert_eq!(request.cmd.response[0], 0x900);
        assert!(host.board.watchdog.is_none());
        assert_eq!(host.board.unmapped.len(), 1);
        assert_eq!(host.diagnostics().completed, 1);
    }

    #[test]
    fn command_without_data_completes_on_command_done() {
        let mut host = sim::host(sim::config());
        host.submit(SlotId::new(1), status_request()).unwrap();
        command_done(&mut host);
        assert!(host.is_idle());
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Ok(0));
        assert_eq!(request.cmd.response, [0x900, 0, 0, 0]);
    }

    #[test]
    fn long_response_word_order() {
        let mut host = sim::host(sim::config());
        let request = Request::new(Command::new(2, 0, ResponseType::R2));
        host.submit(SlotId::new(0), request).unwrap();
        host.regs.response = [1, 2, 3, 4];
        raise(&mut host, no_irq().with_command_done(true));
        assert_eq!(host.notifier.done[0].1.cmd.response, [4, 3, 2, 1]);
    }

    #[test]
    fn requests_complete_in_submission_order() {
        let mut host = sim::host(sim::config());
        let slot = SlotId::new(0);
        let first = Request::new(Command::new(opcode::SEND_STATUS, 1, ResponseType::R1));
        let second = Request::new(Command::new(opcode::SEND_STATUS, 2, ResponseType::R1));
        assert_eq!(host.submit(slot, first).unwrap(), Submission::Started);
        assert_eq!(host.submit(slot, second).unwrap(), Submission::Queued);
        assert_eq!(host.regs.card_commands().len(), 1);

        command_done(&mut host);
        assert_eq!(host.notifier.done.len(), 1);
        assert_eq!(host.regs.card_commands().len(), 2);
        assert_eq!(host.regs.last_command().unwrap().1, 2);
        command_done(&mut host);
        let args: Vec<u32> = host.notifier.done.iter().map(|(_, r)| r.cmd.arg).collect();
        assert_eq!(args, [1, 2]);
        assert!(host.is_idle());
    }

    #[test]
    fn set_block_count_precedes_main_command() {
        let mut host = sim::host(sim::config());
        let request = read_request(2)
            .with_sbc(Command::new(opcode::SET_BLOCK_COUNT, 2, ResponseType::R1));
        host.submit(SlotId::new(0), request).unwrap();
        assert_eq!(host.regs.card_commands(), [opcode::SET_BLOCK_COUNT]);
        command_done(&mut host);
        assert_eq!(
            host.regs.card_commands(),
            [opcode::SET_BLOCK_COUNT, opcode::READ_MULTIPLE_BLOCK]
        );
        command_done(&mut host);
        host.regs.complete_dma(Direction::Read);
        host.on_interrupt();
        host.run_state_machine();
        // No stop after a counted transfer.
        assert_eq!(host.regs.card_commands().len(), 2);
        assert_eq!(host.notifier.done[0].1.outcome(), Ok(1024));
    }

    #[test]
    fn set_block_count_timeout() {
        let mut host = sim::host(sim::config());
        let request = read_request(2)
            .with_sbc(Command::new(opcode::SET_BLOCK_COUNT, 2, ResponseType::R1));
        host.submit(SlotId::new(0), request).unwrap();
        raise(
            &mut host,
            no_irq().with_command_done(true).with_response_timeout(true),
        );
        assert!(host.is_idle());
        assert_eq!(host.regs.card_commands(), [opcode::SET_BLOCK_COUNT]);
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Err(Error::Timeout));
        assert!(request.cmd.error.is_none());
    }

    #[test]
    fn caller_stop_follows_open_ended_read() {
        let mut host = sim::host(sim::config());
        let request = read_request(2)
            .with_stop(Command::new(opcode::STOP_TRANSMISSION, 0, ResponseType::R1b));
        host.submit(SlotId::new(0), request).unwrap();
        command_done(&mut host);
        host.regs.complete_dma(Direction::Read);
        host.on_interrupt();
        host.run_state_machine();
        assert_eq!(host.state(), State::SendingStop);
        let (flags, _) = host.regs.last_command().unwrap();
        assert!(flags.stop_abort());
        command_done(&mut host);
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Ok(1024));
        assert_eq!(request.stop.as_ref().unwrap().response[0], 0x900);
    }

    #[test]
    fn command_error_with_data_sends_stop() {
        let mut host = sim::host(sim::config());
        host.submit(SlotId::new(0), read_request(2)).unwrap();
        let resets = host.diagnostics().controller_resets;
        raise(
            &mut host,
            no_irq().with_command_done(true).with_response_crc(true),
        );
        assert_eq!(host.state(), State::SendingStop);
        assert_eq!(host.diagnostics().controller_resets, resets + 1);
        assert_eq!(host.regs.last_command().unwrap().0.index().value(), 12);
        command_done(&mut host);
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Err(Error::CrcError));
        assert_eq!(host.diagnostics().controller_resets, resets + 1);
    }

    #[test]
    fn data_crc_error_is_marked_for_retry() {
        let quirks = crate::config::Quirks {
            retry_crc_error: true,
            ..crate::config::Quirks::new()
        };
        let mut host = sim::host(sim::config().with_quirks(quirks));
        host.submit(SlotId::new(0), read_request(1)).unwrap();
        command_done(&mut host);
        raise(&mut host, no_irq().with_data_crc(true));
        assert_eq!(host.state(), State::SendingStop);
        command_done(&mut host);
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Err(Error::CrcError));
        assert!(request.needs_retry());
        assert_eq!(request.data.as_ref().unwrap().bytes_transferred, 0);
        assert_eq!(host.diagnostics().crc_retries, 1);
    }

    #[test]
    fn write_without_crc_status_times_out() {
        let mut host = sim::pio_host(sim::config());
        let data = Data::new(Direction::Write, 512, 1).with_segment(leak_buffer(512)).unwrap();
        let request =
            Request::new(Command::new(opcode::WRITE_BLOCK, 0, ResponseType::R1)).with_data(data);
        host.submit(SlotId::new(0), request).unwrap();
        command_done(&mut host);
        raise(&mut host, no_irq().with_tx_data_request(true));
        assert_eq!(host.regs.tx_words.len(), 128);
        raise(
            &mut host,
            no_irq().with_end_bit_error(true).with_data_over(true),
        );
        command_done(&mut host);
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Err(Error::Timeout));
    }

    #[test]
    fn watchdog_in_sending_data() {
        let mut host = sim::host(sim::config());
        host.submit(SlotId::new(0), read_request(1)).unwrap();
        command_done(&mut host);
        assert_eq!(host.state(), State::SendingData);
        let fifo_resets = host.regs.fifo_resets;
        let controller_resets = host.regs.controller_resets;
        let dma_resets = host.regs.dma_resets;

        host.on_request_timeout();
        assert!(host.is_idle());
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Err(Error::Timeout));
        assert_eq!(host.regs.fifo_resets, fifo_resets + 1);
        assert_eq!(host.regs.controller_resets, controller_resets + 1);
        assert_eq!(host.regs.dma_resets, dma_resets + 1);
        assert!(!host.regs.ctrl.use_internal_dmac());
        assert!(!host.regs.bmod.idmac_enable());
        assert_eq!(host.diagnostics().watchdog_expiries, 1);

        // A late interrupt finds nothing to do.
        host.regs.complete_dma(Direction::Read);
        host.on_interrupt();
        host.run_state_machine();
        assert_eq!(host.notifier.done.len(), 1);
    }

    #[test]
    fn watchdog_after_data_error_resets_once() {
        let mut host = sim::host(sim::config());
        host.submit(SlotId::new(0), read_request(1)).unwrap();
        command_done(&mut host);
        let fifo_resets = host.regs.fifo_resets;
        let controller_resets = host.regs.controller_resets;
        raise(&mut host, no_irq().with_data_crc(true));
        assert_eq!(host.state(), State::SendingStop);
        assert_eq!(host.regs.fifo_resets, fifo_resets + 1);
        assert_eq!(host.regs.controller_resets, controller_resets + 1);

        // The stop never completes.
        host.on_request_timeout();
        assert!(host.is_idle());
        assert_eq!(host.notifier.done[0].1.outcome(), Err(Error::CrcError));
        assert_eq!(host.regs.fifo_resets, fifo_resets + 1);
        assert_eq!(host.regs.controller_resets, controller_resets + 1);
        assert_eq!(host.diagnostics().watchdog_expiries, 1);
    }

    #[test]
    fn watchdog_starts_next_request_after_reset() {
        let mut host = sim::host(sim::config());
        host.submit(SlotId::new(0), read_request(1)).unwrap();
        host.submit(SlotId::new(1), status_request()).unwrap();
        host.on_request_timeout();
        let ops = &host.regs.ops;
        let last_reset = ops
            .iter()
            .rposition(|op| *op == SimOp::ControllerReset)
            .unwrap();
        let next = ops
            .iter()
            .rposition(|op| *op == SimOp::Command(opcode::SEND_STATUS))
            .unwrap();
        assert!(last_reset < next);
        assert_eq!(host.state(), State::SendingCommand);
        assert_eq!(host.notifier.done[0].1.outcome(), Err(Error::Timeout));
    }

    #[test]
    fn data_read_timeout_enables_software_monitor() {
        let mut host = sim::host(sim::config());
        host.submit(SlotId::new(0), read_request(1)).unwrap();
        command_done(&mut host);
        raise(&mut host, no_irq().with_data_read_timeout(true));
        assert_eq!(host.state(), State::SendingStop);
        command_done(&mut host);
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Err(Error::Timeout));
        assert!(request.needs_retry());

        host.submit(SlotId::new(0), read_request(1)).unwrap();
        let (flags, _) = host.regs.last_command().unwrap();
        assert!(flags.read_ceata_device());
        command_done(&mut host);
        assert_eq!(host.board.data_timeout_monitor, Some(DATA_TIMEOUT_PERIOD));
        let ticks = DATA_TIMEOUT_LIMIT.ticks() / DATA_TIMEOUT_PERIOD.ticks();
        for _ in 1..ticks {
            assert!(!host.on_data_timeout_tick());
        }
        assert!(host.on_data_timeout_tick());
        host.run_state_machine();
        command_done(&mut host);
        let (_, request) = &host.notifier.done[1];
        assert_eq!(request.outcome(), Err(Error::Timeout));
        // Retry marking only on the first occurrence.
        assert!(!request.needs_retry());
        assert!(!host.on_data_timeout_tick());
    }

    #[test]
    fn data_arrival_stops_software_monitor() {
        let mut host = sim::host(sim::config());
        host.data_timeout.enabled = true;
        host.submit(SlotId::new(0), read_request(1)).unwrap();
        command_done(&mut host);
        assert!(host.data_timeout.armed);
        host.regs.push_rx_bytes(&[0; 8], host.data_width());
        assert!(!host.on_data_timeout_tick());
        assert!(host.board.data_timeout_monitor.is_none());
    }

    #[test]
    fn descriptor_unavailable_recovery() {
        let quirks = crate::config::Quirks {
            dma_suspend_recovery: true,
            ..crate::config::Quirks::new()
        };
        let mut host = sim::host(sim::config().with_quirks(quirks));
        host.submit(SlotId::new(0), read_request(1)).unwrap();
        command_done(&mut host);
        host.regs.idmac_suspended_commands = 2;
        host.regs.idsts = dwmmc::IdmacInterrupts::new_with_raw_value(0)
            .with_descriptor_unavailable(true)
            .with_abnormal_summary(true);
        host.on_interrupt();
        host.run_state_machine();
        assert_eq!(host.diagnostics().du_recoveries, 1);
        assert_eq!(host.state(), State::SendingStop);
        command_done(&mut host);
        let (_, request) = &host.notifier.done[0];
        assert_eq!(request.outcome(), Err(Error::DmaDescriptorUnavailable));
    }

    #[test]
    fn hardware_locked_error_keeps_state() {
        let mut host = sim::host(sim::config());
        host.submit(SlotId::new(0), status_request()).unwrap();
        raise(&mut host, no_irq().with_hardware_locked_error(true));
        assert_eq!(host.state(), State::SendingCommand);
        assert!(host.notifier.done.is_empty());
        command_done(&mut host);
        assert!(host.is_idle());
    }
}
