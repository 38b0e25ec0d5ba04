//! # Requests
//!
//! A [Request] is a command with an optional set-block-count command in front, an optional
//! data transfer and an optional stop command. The caller owns it until submission and gets it
//! back exactly once through [crate::HostNotifier::request_done], with the results filled in.
use crate::error::Error;

/// Maximum number of buffers in one scatter list.
pub const MAX_SEGMENTS: usize = 32;

/// Command opcodes the driver core treats specially.
pub mod opcode {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const VOLTAGE_SWITCH: u8 = 11;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SEND_STATUS: u8 = 13;
    pub const GO_INACTIVE_STATE: u8 = 15;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const SEND_TUNING_BLOCK: u8 = 19;
    pub const SEND_TUNING_BLOCK_HS200: u8 = 21;
    pub const SET_BLOCK_COUNT: u8 = 23;
    pub const WRITE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const IO_RW_DIRECT: u8 = 52;
    pub const IO_RW_EXTENDED: u8 = 53;
}

/// CCCR register used to abort an SDIO function transfer.
pub const CCCR_ABORT: u32 = 0x06;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseType {
    None,
    R1,
    /// R1 with busy signalling on DAT0.
    R1b,
    /// 136-bit response.
    R2,
    /// OCR, no CRC.
    R3,
    /// SDIO OCR, no CRC.
    R4,
    R5,
    R6,
    R7,
}

impl ResponseType {
    #[inline]
    pub const fn expects_response(self) -> bool {
        !matches!(self, ResponseType::None)
    }

    #[inline]
    pub const fn is_long(self) -> bool {
        matches!(self, ResponseType::R2)
    }

    #[inline]
    pub const fn has_crc(self) -> bool {
        !matches!(
            self,
            ResponseType::None | ResponseType::R3 | ResponseType::R4
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub arg: u32,
    pub response_type: ResponseType,
    /// Response words. Word 0 holds the most significant bits of a long response.
    pub response: [u32; 4],
    pub error: Option<Error>,
    /// Set by the driver if the request should be retried by the caller.
    pub retries: u8,
}

impl Command {
    pub const fn new(opcode: u8, arg: u32, response_type: ResponseType) -> Self {
        Self {
            opcode,
            arg,
            response_type,
            response: [0; 4],
            error: None,
            retries: 0,
        }
    }

    /// Commands which abort an ongoing transfer or reset the card state. They are sent with the
    /// stop/abort flag and never wait for the data line.
    pub fn is_abort(&self) -> bool {
        match self.opcode {
            opcode::STOP_TRANSMISSION | opcode::GO_IDLE_STATE | opcode::GO_INACTIVE_STATE => true,
            opcode::IO_RW_DIRECT => self.is_cccr_abort_write(),
            _ => false,
        }
    }

    /// CMD52 write to the CCCR abort register.
    pub fn is_cccr_abort_write(&self) -> bool {
        self.opcode == opcode::IO_RW_DIRECT
            && (self.arg >> 31) == 1
            && ((self.arg >> 9) & 0x1FFFF) == CCCR_ABORT
    }

    pub(crate) fn clear_result(&mut self) {
        self.response = [0; 4];
        self.error = None;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// Data transfer of a request.
pub struct Data {
    pub direction: Direction,
    pub block_size: u32,
    pub block_count: u32,
    /// Buffers of the scatter list, filled or drained in order.
    pub segments: heapless::Vec<&'static mut [u8], MAX_SEGMENTS>,
    pub bytes_transferred: usize,
    pub error: Option<Error>,
    /// Bus addresses of the mapped segments.
    pub(crate) mapped: heapless::Vec<u32, MAX_SEGMENTS>,
    pub(crate) pre_staged: bool,
}

impl Data {
    pub const fn new(direction: Direction, block_size: u32, block_count: u32) -> Self {
        Self {
            direction,
            block_size,
            block_count,
            segments: heapless::Vec::new(),
            bytes_transferred: 0,
            error: None,
            mapped: heapless::Vec::new(),
            pre_staged: false,
        }
    }

    /// Append a buffer to the scatter list. The buffer is handed back if the list is full.
    pub fn push_segment(&mut self, segment: &'static mut [u8]) -> Result<(), &'static mut [u8]> {
        self.segments.push(segment)
    }

    pub fn with_segment(mut self, segment: &'static mut [u8]) -> Result<Self, &'static mut [u8]> {
        self.push_segment(segment)?;
        Ok(self)
    }

    /// Requested transfer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total capacity of the scatter list.
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(|seg| seg.len()).sum()
    }

    /// Whether the segments are currently mapped for DMA by [crate::Host::pre_stage].
    #[inline]
    pub fn is_pre_staged(&self) -> bool {
        self.pre_staged
    }

    /// Take the buffers back.
    pub fn into_segments(self) -> heapless::Vec<&'static mut [u8], MAX_SEGMENTS> {
        self.segments
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.block_size != 0 && self.block_count != 0 && self.capacity() >= self.len()
    }
}

impl core::fmt::Debug for Data {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Data")
            .field("direction", &self.direction)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("segments", &self.segments.len())
            .field("bytes_transferred", &self.bytes_transferred)
            .field("error", &self.error)
            .field("pre_staged", &self.pre_staged)
            .finish()
    }
}

#[derive(Debug)]
pub struct Request {
    /// Set block count command sent ahead of the main command.
    pub sbc: Option<Command>,
    pub cmd: Command,
    pub data: Option<Data>,
    /// Stop command sent after the data transfer.
    pub stop: Option<Command>,
}

impl Request {
    pub const fn new(cmd: Command) -> Self {
        Self {
            sbc: None,
            cmd,
            data: None,
            stop: None,
        }
    }

    pub fn with_sbc(mut self, sbc: Command) -> Self {
        self.sbc = Some(sbc);
        self
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_stop(mut self, stop: Command) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Final result of the request: the number of bytes transferred or the most specific error.
    ///
    /// A set block count error wins over a command error, which wins over a data error. The
    /// result of the stop command is not part of the outcome.
    pub fn outcome(&self) -> Result<usize, Error> {
        if let Some(err) = self.sbc.as_ref().and_then(|sbc| sbc.error) {
            return Err(err);
        }
        if let Some(err) = self.cmd.error {
            return Err(err);
        }
        match &self.data {
            Some(data) => match data.error {
                Some(err) => Err(err),
                None => Ok(data.bytes_transferred),
            },
            None => Ok(0),
        }
    }

    /// The driver asks the caller to submit the request again.
    #[inline]
    pub fn needs_retry(&self) -> bool {
        self.cmd.retries > 0
    }

    pub(crate) fn clear_results(&mut self) {
        if let Some(sbc) = self.sbc.as_mut() {
            sbc.clear_result();
        }
        self.cmd.clear_result();
        self.cmd.retries = 0;
        if let Some(data) = self.data.as_mut() {
            data.bytes_transferred = 0;
            data.error = None;
        }
        if let Some(stop) = self.stop.as_mut() {
            stop.clear_result();
        }
    }

    /// Fail the request without touching the hardware.
    pub(crate) fn fail(&mut self, err: Error) {
        self.cmd.error = Some(err);
        if let Some(data) = self.data.as_mut() {
            data.error = Some(err);
            data.bytes_transferred = 0;
        }
    }
}
