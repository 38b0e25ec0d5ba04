//! # Request state
//!
//! Bookkeeping of the request state machine: the state of the host, the active request with
//! its data path, the coalescing event queue and the status bits latched by the interrupt
//! handler for the bottom half.
use dwmmc::{IdmacInterrupts, Interrupts};

use crate::{
    SlotId,
    dma::DescriptorChain,
    pio::PioTransfer,
    request::{Command, Request},
};

/// Operating state of a host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    SendingCommand,
    SendingData,
    /// Waiting for the end of the data transfer on the card side.
    DataBusy,
    SendingStop,
    DataError,
}

/// State of a busy host. There is no idle phase, an idle host carries no request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    SendingCommand,
    SendingData,
    DataBusy,
    SendingStop,
    DataError,
}

impl From<Phase> for State {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::SendingCommand => State::SendingCommand,
            Phase::SendingData => State::SendingData,
            Phase::DataBusy => State::DataBusy,
            Phase::SendingStop => State::SendingStop,
            Phase::DataError => State::DataError,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    CommandComplete = 0,
    /// The data path moved all bytes. Posted by DMA completion or the PIO engine.
    TransferComplete = 1,
    /// The controller reported the end of the data phase.
    DataComplete = 2,
    DataError = 3,
}

/// Pending events, at most one per kind.
///
/// Posting an event which is already pending is a no-op, so the queue can never overflow.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EventQueue {
    pending: u8,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self { pending: 0 }
    }

    #[inline]
    pub fn post(&mut self, event: Event) {
        self.pending |= 1 << event as u8;
    }

    /// Consume an event. Returns whether it was pending.
    #[inline]
    pub fn take(&mut self, event: Event) -> bool {
        let pending = self.is_pending(event);
        self.pending &= !(1 << event as u8);
        pending
    }

    #[inline]
    pub fn is_pending(&self, event: Event) -> bool {
        self.pending & (1 << event as u8) != 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.pending = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }
}

/// Command of the active request which is currently on the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Issued {
    Sbc,
    Main,
    /// Stop command supplied with the request.
    Stop,
    /// Stop or abort command generated by the driver.
    GeneratedStop,
}

#[derive(Debug)]
pub(crate) enum DataPath {
    None,
    Dma(DescriptorChain),
    Pio(PioTransfer),
}

#[derive(Debug)]
pub(crate) struct ActiveRequest {
    pub slot: SlotId,
    pub request: Request,
    pub issued: Issued,
    /// Stop used when the request carries none of its own.
    pub generated_stop: Option<Command>,
    pub stop_sent: bool,
    pub data_path: DataPath,
    /// The scatter list was mapped at submission and is unmapped on completion.
    pub mapped_here: bool,
    /// FIFO and controller were already reset after an error of this request.
    pub reset_done: bool,
}

impl ActiveRequest {
    pub fn new(slot: SlotId, request: Request) -> Self {
        Self {
            slot,
            request,
            issued: Issued::Main,
            generated_stop: None,
            stop_sent: false,
            data_path: DataPath::None,
            mapped_here: false,
            reset_done: false,
        }
    }

    pub fn issued_command(&self) -> Option<&Command> {
        match self.issued {
            Issued::Sbc => self.request.sbc.as_ref(),
            Issued::Main => Some(&self.request.cmd),
            Issued::Stop => self.request.stop.as_ref(),
            Issued::GeneratedStop => self.generated_stop.as_ref(),
        }
    }

    pub fn issued_command_mut(&mut self) -> Option<&mut Command> {
        match self.issued {
            Issued::Sbc => self.request.sbc.as_mut(),
            Issued::Main => Some(&mut self.request.cmd),
            Issued::Stop => self.request.stop.as_mut(),
            Issued::GeneratedStop => self.generated_stop.as_mut(),
        }
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        self.request.data.is_some()
    }
}

/// At most one request is active. It lives inside the busy state.
#[derive(Debug)]
pub(crate) enum HostState {
    Idle,
    Busy { active: ActiveRequest, phase: Phase },
}

impl HostState {
    pub fn state(&self) -> State {
        match self {
            HostState::Idle => State::Idle,
            HostState::Busy { phase, .. } => (*phase).into(),
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        matches!(self, HostState::Idle)
    }

    pub fn active_slot(&self) -> Option<SlotId> {
        match self {
            HostState::Idle => None,
            HostState::Busy { active, .. } => Some(active.slot),
        }
    }
}

/// Status bits collected by the interrupt handler for the bottom half.
#[derive(Debug, Copy, Clone)]
pub(crate) struct LatchedStatus {
    pub cmd: Interrupts,
    pub data: Interrupts,
    pub dma: IdmacInterrupts,
}

impl LatchedStatus {
    pub const fn new() -> Self {
        Self {
            cmd: Interrupts::new_with_raw_value(0),
            data: Interrupts::new_with_raw_value(0),
            dma: IdmacInterrupts::new_with_raw_value(0),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ResponseType, opcode};

    #[test]
    fn events_coalesce() {
        let mut events = EventQueue::new();
        assert!(events.is_empty());
        events.post(Event::DataComplete);
        events.post(Event::DataComplete);
        events.post(Event::CommandComplete);
        assert!(events.take(Event::DataComplete));
        assert!(!events.take(Event::DataComplete));
        assert!(events.is_pending(Event::CommandComplete));
        events.clear();
        assert!(events.is_empty());
    }

    #[test]
    fn issued_command_selection() {
        let request = Request::new(Command::new(opcode::READ_MULTIPLE_BLOCK, 8, ResponseType::R1))
            .with_sbc(Command::new(opcode::SET_BLOCK_COUNT, 4, ResponseType::R1));
        let mut active = ActiveRequest::new(SlotId::new(0), request);
        active.issued = Issued::Sbc;
        assert_eq!(active.issued_command_mut().unwrap().opcode, opcode::SET_BLOCK_COUNT);
        active.issued = Issued::Stop;
        assert!(active.issued_command_mut().is_none());
        let stop = Command::new(opcode::STOP_TRANSMISSION, 0, ResponseType::R1b);
        active.generated_stop = Some(stop);
        active.issued = Issued::GeneratedStop;
        assert_eq!(active.issued_command_mut().unwrap().opcode, opcode::STOP_TRANSMISSION);
    }

    #[test]
    fn host_state_reports_phase() {
        let mut state = HostState::Idle;
        assert_eq!(state.state(), State::Idle);
        assert!(state.active_slot().is_none());
        let request = Request::new(Command::new(opcode::SEND_STATUS, 0, ResponseType::R1));
        state = HostState::Busy {
            active: ActiveRequest::new(SlotId::new(1), request),
            phase: Phase::DataBusy,
        };
        assert_eq!(state.state(), State::DataBusy);
        assert_eq!(state.active_slot(), Some(SlotId::new(1)));
        assert!(!state.is_idle());
    }
}
