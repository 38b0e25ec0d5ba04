//! # Programmed I/O data path
//!
//! Used when no descriptor ring is available or a transfer does not qualify for DMA. Data
//! moves between the scatter list and the FIFO in units of the host data width. Bytes of a
//! word which straddles two buffers are kept in a [CarryBuffer].
use dwmmc::Interrupts;

use crate::{
    regs::{DataWidth, HostRegisters},
    request::Data,
};

/// Bytes of a partially consumed or partially filled FIFO word.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CarryBuffer {
    word: [u8; 8],
    start: usize,
    len: usize,
}

impl CarryBuffer {
    pub const fn new() -> Self {
        Self {
            word: [0; 8],
            start: 0,
            len: 0,
        }
    }

    /// Number of buffered bytes. Never exceeds the data width.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Move buffered bytes of a received word into `dst`.
    fn drain(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len);
        dst[..count].copy_from_slice(&self.word[self.start..self.start + count]);
        self.start += count;
        self.len -= count;
        count
    }

    /// Store a freshly received word, hand the first `dst.len()` bytes out and keep the rest.
    fn split_word(&mut self, word: u64, width: DataWidth, dst: &mut [u8]) {
        self.word = word.to_le_bytes();
        let count = dst.len();
        dst.copy_from_slice(&self.word[..count]);
        self.start = count;
        self.len = width.bytes() - count;
    }

    /// Append bytes of a word to be sent. Returns the number of bytes taken.
    fn fill(&mut self, src: &[u8], width: DataWidth) -> usize {
        let count = src.len().min(width.bytes() - self.len);
        self.word[self.len..self.len + count].copy_from_slice(&src[..count]);
        self.len += count;
        count
    }

    /// Take the buffered bytes of a word to be sent. Unused bytes are zero.
    fn take_word(&mut self) -> u64 {
        let mut bytes = [0; 8];
        bytes[..self.len].copy_from_slice(&self.word[..self.len]);
        self.len = 0;
        self.start = 0;
        u64::from_le_bytes(bytes)
    }
}

/// Read whole words from the FIFO into `buf`.
fn read_words<R: HostRegisters>(regs: &mut R, width: DataWidth, buf: &mut [u8]) {
    let bytes = width.bytes();
    for chunk in buf.chunks_exact_mut(bytes) {
        let word = regs.read_fifo(width).to_le_bytes();
        chunk.copy_from_slice(&word[..bytes]);
    }
}

fn write_words<R: HostRegisters>(regs: &mut R, width: DataWidth, buf: &[u8]) {
    let bytes = width.bytes();
    for chunk in buf.chunks_exact(bytes) {
        let mut word = [0; 8];
        word[..bytes].copy_from_slice(chunk);
        regs.write_fifo(width, u64::from_le_bytes(word));
    }
}

/// Progress of one PIO transfer through the scatter list.
#[derive(Debug, Default)]
pub struct PioTransfer {
    segment: usize,
    offset: usize,
    /// Bytes moved between the scatter list and the FIFO.
    moved: usize,
    carry: CarryBuffer,
}

impl PioTransfer {
    pub const fn new() -> Self {
        Self {
            segment: 0,
            offset: 0,
            moved: 0,
            carry: CarryBuffer::new(),
        }
    }

    #[inline]
    pub fn bytes_moved(&self) -> usize {
        self.moved
    }

    #[inline]
    pub fn carry(&self) -> &CarryBuffer {
        &self.carry
    }

    /// Usable part of the current segment, limited by the requested transfer length. Advances
    /// past exhausted segments. Returns [None] once the transfer is complete.
    fn current(&mut self, data: &Data) -> Option<(usize, usize)> {
        let total = data.len();
        loop {
            if self.moved >= total {
                return None;
            }
            let segment = data.segments.get(self.segment)?;
            let usable = segment.len().min(self.offset + total - self.moved);
            if self.offset < usable {
                return Some((self.segment, usable - self.offset));
            }
            self.segment += 1;
            self.offset = 0;
        }
    }

    /// Pull `count` bytes: drain the carry first, then read whole words and capture the bytes
    /// of a trailing partial word.
    fn pull<R: HostRegisters>(&mut self, regs: &mut R, width: DataWidth, buf: &mut [u8]) {
        let drained = self.carry.drain(buf);
        let rest = &mut buf[drained..];
        let whole = rest.len() - rest.len() % width.bytes();
        let (words, tail) = rest.split_at_mut(whole);
        read_words(regs, width, words);
        if !tail.is_empty() {
            let word = regs.read_fifo(width);
            self.carry.split_word(word, width, tail);
        }
    }

    /// Push `buf`: complete a pending carry word first, then write whole words. A trailing
    /// partial word is kept in the carry, unless it is the last word of the transfer.
    fn push<R: HostRegisters>(
        &mut self,
        regs: &mut R,
        width: DataWidth,
        buf: &[u8],
        byte_count: usize,
    ) {
        let mut buf = buf;
        if !self.carry.is_empty() {
            let taken = self.carry.fill(buf, width);
            buf = &buf[taken..];
            let tbb = regs.read_tbbcnt() as usize;
            if tbb + self.carry.len() == byte_count || self.carry.len() == width.bytes() {
                let word = self.carry.take_word();
                regs.write_fifo(width, word);
            }
        }
        let whole = buf.len() - buf.len() % width.bytes();
        write_words(regs, width, &buf[..whole]);
        let tail = &buf[whole..];
        if !tail.is_empty() {
            self.carry.fill(tail, width);
            let tbb = regs.read_tbbcnt() as usize;
            if tbb + tail.len() == byte_count {
                let word = self.carry.take_word();
                regs.write_fifo(width, word);
            }
        }
    }

    /// Move received data from the FIFO into the scatter list.
    ///
    /// Called on RX data request and, with `final_pass` set, on data transfer over to drain
    /// the FIFO. Returns true once all requested bytes were received.
    pub fn read<R: HostRegisters>(
        &mut self,
        regs: &mut R,
        width: DataWidth,
        data: &mut Data,
        final_pass: bool,
    ) -> bool {
        let shift = width.shift();
        loop {
            while let Some((segment, remain)) = self.current(data) {
                let fifo_count = regs.read_status().fifo_count().value() as usize;
                let fifo_bytes = (fifo_count << shift) + self.carry.len();
                let len = remain.min(fifo_bytes);
                if len == 0 {
                    break;
                }
                let offset = self.offset;
                self.pull(regs, width, &mut data.segments[segment][offset..offset + len]);
                self.offset += len;
                self.moved += len;
            }
            if self.current(data).is_none() {
                return true;
            }
            let status = regs.read_mintsts();
            regs.write_rintsts(Interrupts::new_with_raw_value(0).with_rx_data_request(true));
            let fifo_count = regs.read_status().fifo_count().value();
            if !(status.rx_data_request() || (final_pass && fifo_count > 0)) {
                return false;
            }
        }
    }

    /// Move data from the scatter list into the FIFO.
    ///
    /// Called on TX data request. Returns true once all bytes were handed to the FIFO.
    pub fn write<R: HostRegisters>(
        &mut self,
        regs: &mut R,
        width: DataWidth,
        fifo_depth: u32,
        data: &Data,
    ) -> bool {
        let shift = width.shift();
        let byte_count = data.len();
        loop {
            while let Some((segment, remain)) = self.current(data) {
                let fifo_count = regs.read_status().fifo_count().value() as usize;
                let free = ((fifo_depth as usize).saturating_sub(fifo_count) << shift)
                    .saturating_sub(self.carry.len());
                let len = remain.min(free);
                if len == 0 {
                    break;
                }
                let offset = self.offset;
                let buf = &data.segments[segment][offset..offset + len];
                self.push(regs, width, buf, byte_count);
                self.offset += len;
                self.moved += len;
            }
            if self.current(data).is_none() {
                return true;
            }
            let status = regs.read_mintsts();
            regs.write_rintsts(Interrupts::new_with_raw_value(0).with_tx_data_request(true));
            if !status.tx_data_request() {
                return false;
            }
        }
    }
}
