//! # Sample phase tuning
//!
//! High speed bus modes need the card interface unit to sample data at the right phase of the
//! card clock. A [TuningRun] reads a known tuning block once per candidate phase, records
//! which phases returned the block intact and commits the middle of the widest passing window.
//!
//! The run is resumable. [TuningRun::next_request] produces the next tuning read, the caller
//! submits it like any other request and hands the completed request back with
//! [TuningRun::record].
use arbitrary_int::{u3, u12};
use dwmmc::{CardThresholdControl, ClockSelect};

use crate::{
    Host, SlotId,
    board::{Board, BusWidth, HostNotifier},
    error::Error,
    regs::HostRegisters,
    request::{Command, Data, Direction, Request, ResponseType, opcode},
};

/// Tuning block returned on a 4-bit bus.
pub const TUNING_BLOCK_4BIT: [u8; 64] = [
    0xff, 0x0f, 0xff, 0x00, 0xff, 0xcc, 0xc3, 0xcc, 0xc3, 0x3c, 0xcc, 0xff, 0xfe, 0xff, 0xfe, 0xef,
    0xff, 0xdf, 0xff, 0xdd, 0xff, 0xfb, 0xff, 0xfb, 0xbf, 0xff, 0x7f, 0xff, 0x77, 0xf7, 0xbd, 0xef,
    0xff, 0xf0, 0xff, 0xf0, 0x0f, 0xfc, 0xcc, 0x3c, 0xcc, 0x33, 0xcc, 0xcf, 0xff, 0xef, 0xff, 0xee,
    0xff, 0xfd, 0xff, 0xfd, 0xdf, 0xff, 0xbf, 0xff, 0xbb, 0xff, 0xf7, 0xff, 0xf7, 0x7f, 0x7b, 0xde,
];

/// Tuning block returned by an eMMC device on an 8-bit bus.
pub const TUNING_BLOCK_8BIT: [u8; 128] = [
    0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, 0x00, 0xff, 0xff, 0xcc, 0xcc, 0xcc, 0x33, 0xcc, 0xcc,
    0xcc, 0x33, 0x33, 0xcc, 0xcc, 0xcc, 0xff, 0xff, 0xff, 0xee, 0xff, 0xff, 0xff, 0xee, 0xee, 0xff,
    0xff, 0xff, 0xdd, 0xff, 0xff, 0xff, 0xdd, 0xdd, 0xff, 0xff, 0xff, 0xbb, 0xff, 0xff, 0xff, 0xbb,
    0xbb, 0xff, 0xff, 0xff, 0x77, 0xff, 0xff, 0xff, 0x77, 0x77, 0xff, 0x77, 0xbb, 0xdd, 0xee, 0xff,
    0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, 0x00, 0xff, 0xff, 0xcc, 0xcc, 0xcc, 0x33, 0xcc,
    0xcc, 0xcc, 0x33, 0x33, 0xcc, 0xcc, 0xcc, 0xff, 0xff, 0xff, 0xee, 0xff, 0xff, 0xff, 0xee, 0xee,
    0xff, 0xff, 0xff, 0xdd, 0xff, 0xff, 0xff, 0xdd, 0xdd, 0xff, 0xff, 0xff, 0xbb, 0xff, 0xff, 0xff,
    0xbb, 0xbb, 0xff, 0xff, 0xff, 0x77, 0xff, 0xff, 0xff, 0x77, 0x77, 0xff, 0x77, 0xbb, 0xdd, 0xee,
];

/// Card read threshold in bytes used while tuning and in HS200 DDR mode.
pub const CARD_READ_THRESHOLD: u16 = 512;

/// Number of tuning maps kept for diagnostics.
pub const MAP_HISTORY: usize = 4;

const PHASES: u8 = 8;

/// Expected tuning block for a tuning command on a bus of the given width.
pub fn tuning_pattern(opcode: u8, width: BusWidth) -> Result<&'static [u8], Error> {
    match (opcode, width) {
        (opcode::SEND_TUNING_BLOCK_HS200, BusWidth::Eight) => Ok(&TUNING_BLOCK_8BIT),
        (opcode::SEND_TUNING_BLOCK_HS200, BusWidth::Four) => Ok(&TUNING_BLOCK_4BIT),
        (opcode::SEND_TUNING_BLOCK, _) => Ok(&TUNING_BLOCK_4BIT),
        _ => Err(Error::InvalidRequest),
    }
}

/// Scan the circular `bits` for a run of `width` passing phases, starting at bit 0.
///
/// Returns the bit offset of the first matching window.
fn find_window(bits: u32, width: u32, positions: u32) -> Option<u32> {
    let mask = (1u32 << width) - 1;
    (0..positions).find(|&offset| (bits >> offset) & mask == mask)
}

/// Middle phase of the widest passing window of an 8 phase map.
///
/// Windows of 7, 5 and 3 phases are tried in that order. With a clock divider ratio of one,
/// only every fourth phase is distinct. The map is folded first and only 3 phase windows are
/// searched, followed by a two phase fallback if `extra_tuning` is set.
///
/// An all-ones map passes everywhere and says nothing about the window, so it yields [None].
pub fn find_median_of_bits(map: u8, divratio_one: bool, extra_tuning: bool) -> Option<u8> {
    if map == 0xFF {
        return None;
    }
    if divratio_one {
        let folded = map & (map >> 4);
        let folded = folded | (folded << 4);
        if let Some(offset) = find_window(folded as u32, 3, PHASES as u32) {
            return Some(((offset + 1) % PHASES as u32) as u8);
        }
        if extra_tuning {
            return narrow_window(folded);
        }
        return None;
    }
    let bits = map as u32 | ((map as u32) << 8);
    for width in [7, 5, 3] {
        if let Some(offset) = find_window(bits, width, PHASES as u32) {
            return Some(((offset + width / 2) % PHASES as u32) as u8);
        }
    }
    None
}

/// Two phase fallback for a folded map.
fn narrow_window(folded: u8) -> Option<u8> {
    if folded & 0x03 == 0x03 {
        Some(0)
    } else if folded & 0x0c == 0x0c {
        Some(3)
    } else if folded & 0x06 == 0x06 {
        Some(2)
    } else {
        None
    }
}

/// Middle pass index of the widest passing window of a 16 entry fine tuning map.
///
/// Pass index `2 * phase + fine` covers every phase with and without the fine tuning delay.
/// Windows of 15, 11, 9, 7, 5, 4 and 3 entries are tried in that order. With a clock divider
/// ratio of one the map is folded onto itself first.
pub fn find_median_of_16bits(map: u16, divratio_one: bool, _extra_tuning: bool) -> Option<u8> {
    if map == 0xFFFF {
        return None;
    }
    let mut bits = map as u32 | ((map as u32) << 16);
    if divratio_one {
        bits &= bits >> 8;
    }
    for width in [15, 11, 9, 7, 5, 4, 3] {
        if let Some(offset) = find_window(bits, width, 16) {
            return Some(((offset + width / 2) % 16) as u8);
        }
    }
    None
}

/// Read the current sample phase.
pub(crate) fn sample_phase<R: HostRegisters>(regs: &mut R) -> u8 {
    regs.read_clksel().sample_phase().value()
}

/// Program a sample phase.
pub(crate) fn set_sample_phase<R: HostRegisters>(regs: &mut R, phase: u8) {
    regs.modify_clksel(|clksel| clksel.with_sample_phase(u3::new(phase % PHASES)));
}

/// Step to the next sample phase, skipping ignored phases.
fn next_sample_phase<R: HostRegisters>(regs: &mut R, ignore_phase: u8) -> u8 {
    let mut phase = (sample_phase(regs) + 1) % PHASES;
    if ignore_phase & (1 << phase) != 0 {
        phase = (phase + 1) % PHASES;
    }
    set_sample_phase(regs, phase);
    phase
}

pub(crate) fn set_fine_tune<R: HostRegisters>(regs: &mut R, fine: bool) {
    regs.modify_clksel(|clksel| clksel.with_fine_tune(fine));
}

fn divider_ratio_one(clksel: ClockSelect) -> bool {
    clksel.divider_ratio().value() == 1
}

pub(crate) fn card_read_threshold(enabled: bool) -> CardThresholdControl {
    if enabled {
        CardThresholdControl::new_with_raw_value(0)
            .with_threshold(u12::new(CARD_READ_THRESHOLD))
            .with_read_threshold_enable(true)
    } else {
        CardThresholdControl::new_with_raw_value(0)
    }
}

/// Tuning results of a host.
pub struct TuningState {
    pub(crate) sample: u8,
    pub(crate) fine: bool,
    pub(crate) in_progress: bool,
    maps: heapless::HistoryBuffer<u16, MAP_HISTORY>,
}

impl TuningState {
    pub const fn new() -> Self {
        Self {
            sample: 0,
            fine: false,
            in_progress: false,
            maps: heapless::HistoryBuffer::new(),
        }
    }

    /// Committed sample phase.
    #[inline]
    pub fn sample_phase(&self) -> u8 {
        self.sample
    }

    #[inline]
    pub fn fine_tuned(&self) -> bool {
        self.fine
    }

    #[inline]
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Tuning maps of the most recent scans, oldest first.
    pub fn maps(&self) -> impl Iterator<Item = &u16> {
        self.maps.oldest_ordered()
    }
}

impl Default for TuningState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [Host::begin_tuning].
#[derive(Debug)]
pub enum TuningStart {
    /// The slot was tuned before and the stored phase was applied again. The scratch buffer
    /// is handed back.
    AlreadyTuned(&'static mut [u8]),
    Run(TuningRun),
}

/// One tuning procedure in progress.
#[derive(Debug)]
pub struct TuningRun {
    slot: SlotId,
    opcode: u8,
    pattern: &'static [u8],
    scratch: Option<&'static mut [u8]>,
    start_phase: u8,
    phase: u8,
    /// Fine tuning doubles the map, every phase is read with and without the fine delay.
    fine_tuning: bool,
    fine: bool,
    pass_index: u8,
    map: u16,
    retries: u8,
    steps_left: u32,
    ignore_phase: u8,
    finished: bool,
}

impl<R: HostRegisters, B: Board, N: HostNotifier> Host<'_, R, B, N> {
    /// Start tuning the sample phase of a slot.
    ///
    /// `scratch` receives the tuning blocks and must hold at least the pattern for the given
    /// opcode and the current bus width. With once-only tuning enabled, a slot which was tuned
    /// before gets its stored phase back without a new scan.
    pub fn begin_tuning(
        &mut self,
        slot: SlotId,
        opcode: u8,
        scratch: &'static mut [u8],
    ) -> Result<TuningStart, Error> {
        let idx = self.slot_index(slot).ok_or(Error::InvalidRequest)?;
        let pattern = tuning_pattern(opcode, self.slots[idx].width)?;
        if scratch.len() < pattern.len() {
            return Err(Error::InvalidRequest);
        }
        if self.tuning.in_progress {
            return Err(Error::InvalidRequest);
        }
        if self.slots[idx].tuned {
            set_sample_phase(&mut self.regs, self.tuning.sample);
            set_fine_tune(&mut self.regs, self.tuning.fine);
            self.regs.write_cdthrctl(card_read_threshold(true));
            return Ok(TuningStart::AlreadyTuned(scratch));
        }

        let start_phase = sample_phase(&mut self.regs);
        self.regs.write_cdthrctl(card_read_threshold(true));
        self.board.save_drive_strength(slot);
        self.tuning.in_progress = true;
        let retries = self.config.tuning_retries;
        let fine_tuning = self.config.quirks.fine_tuning;
        log::debug!("tuning slot {} with CMD{opcode}, start phase {start_phase}", slot.value());
        Ok(TuningStart::Run(TuningRun {
            slot,
            opcode,
            pattern,
            scratch: Some(scratch),
            start_phase,
            phase: start_phase,
            fine_tuning,
            fine: false,
            pass_index: 0,
            map: 0,
            retries,
            steps_left: (retries as u32 + 1) * PHASES as u32 * 2,
            ignore_phase: self.config.ignore_phase,
            finished: false,
        }))
    }
}

impl TuningRun {
    #[inline]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Passing phases of the current scan, one bit per pass index.
    #[inline]
    pub fn map(&self) -> u16 {
        self.map
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Program the next candidate phase and build the tuning read for it.
    ///
    /// Returns [None] once the run is finished, while the previous read was not recorded or
    /// when the scratch buffer handed back was too short for the pattern.
    pub fn next_request<R: HostRegisters, B: Board, N: HostNotifier>(
        &mut self,
        host: &mut Host<'_, R, B, N>,
    ) -> Option<Request> {
        if self.finished || self.steps_left == 0 {
            return None;
        }
        let len = self.pattern.len();
        if self.scratch.as_ref().is_none_or(|scratch| scratch.len() < len) {
            return None;
        }
        let scratch = self.scratch.take()?;
        if self.fine_tuning {
            set_fine_tune(&mut host.regs, self.fine);
            self.pass_index = self.phase * 2 + self.fine as u8;
        } else {
            self.phase = next_sample_phase(&mut host.regs, self.ignore_phase);
            self.pass_index = self.phase;
        }

        scratch[..len].fill(0);
        let data = match Data::new(Direction::Read, len as u32, 1).with_segment(scratch) {
            Ok(data) => data,
            Err(scratch) => {
                self.scratch = Some(scratch);
                return None;
            }
        };
        Some(
            Request::new(Command::new(self.opcode, 0, ResponseType::R1))
                .with_data(data)
                .with_stop(Command::new(
                    opcode::STOP_TRANSMISSION,
                    0,
                    ResponseType::R1b,
                )),
        )
    }

    /// Feed back a completed tuning read.
    ///
    /// Returns `Ok(None)` while more reads are needed, `Ok(Some(phase))` with the committed
    /// sample phase once tuning succeeded and [Error::TuningFailed] once the retries are
    /// exhausted. On failure, the phase active before tuning is restored.
    pub fn record<R: HostRegisters, B: Board, N: HostNotifier>(
        &mut self,
        host: &mut Host<'_, R, B, N>,
        request: Request,
    ) -> Result<Option<u8>, Error> {
        if self.finished || self.scratch.is_some() {
            return Err(Error::InvalidRequest);
        }
        let outcome = request.outcome();
        let mut segments = match request.data {
            Some(data) => data.into_segments(),
            None => return Err(Error::InvalidRequest),
        };
        let Some(scratch) = segments.pop() else {
            return Err(Error::InvalidRequest);
        };
        let len = self.pattern.len();
        if scratch.len() < len {
            self.scratch = Some(scratch);
            return Err(Error::InvalidRequest);
        }
        if outcome.is_ok() && scratch[..len] == *self.pattern {
            self.map |= 1 << self.pass_index;
        } else {
            log::trace!("tuning read at index {} failed: {outcome:?}", self.pass_index);
        }
        self.scratch = Some(scratch);

        if self.fine_tuning {
            if self.fine {
                self.phase = next_sample_phase(&mut host.regs, self.ignore_phase);
            }
            self.fine = !self.fine;
        }
        self.steps_left = self.steps_left.saturating_sub(1);

        if self.phase == self.start_phase && !self.fine {
            let divratio_one = divider_ratio_one(host.regs.read_clksel());
            let extra = host.config.extra_tuning;
            let mid = if self.fine_tuning {
                find_median_of_16bits(self.map, divratio_one, extra)
            } else {
                find_median_of_bits(self.map as u8, divratio_one, extra)
            };
            log::info!("tuning map {:#06x}, middle {mid:?}", self.map);
            host.tuning.maps.write(self.map);
            if let Some(mid) = mid {
                return self.finish(host, Some(mid)).map(Some);
            }
            if self.retries == 0 {
                return self.finish(host, None).map(Some);
            }
            self.retries -= 1;
            host.diagnostics.tuning_retries += 1;
            host.board.tuning_drive_strength(self.slot);
            self.map = 0;
        }
        if self.steps_left == 0 {
            return self.finish(host, None).map(Some);
        }
        Ok(None)
    }

    /// Take the scratch buffer back. Only available between reads and after the run.
    pub fn into_scratch(self) -> Option<&'static mut [u8]> {
        self.scratch
    }

    fn finish<R: HostRegisters, B: Board, N: HostNotifier>(
        &mut self,
        host: &mut Host<'_, R, B, N>,
        mid: Option<u8>,
    ) -> Result<u8, Error> {
        self.finished = true;
        host.tuning.in_progress = false;
        let compensation = host.board.restore_drive_strength(self.slot) as i16;
        let Some(mid) = mid else {
            host.regs.write_cdthrctl(card_read_threshold(false));
            set_sample_phase(&mut host.regs, self.start_phase);
            log::warn!("tuning slot {} failed", self.slot.value());
            return Err(Error::TuningFailed);
        };
        let (phase, fine) = if self.fine_tuning {
            // Middle indices outside 3..=5 fall back to index 4.
            let mid = if (3..=5).contains(&mid) { mid } else { 4 };
            (mid / 2, mid % 2 == 1)
        } else {
            (mid, false)
        };
        let phase = (phase as i16 + compensation).rem_euclid(PHASES as i16) as u8;
        set_fine_tune(&mut host.regs, fine);
        set_sample_phase(&mut host.regs, phase);
        host.tuning.sample = phase;
        host.tuning.fine = fine;
        if host.config.only_once_tune
            && let Some(idx) = host.slot_index(self.slot)
        {
            host.slots[idx].tuned = true;
        }
        log::info!(
            "slot {} tuned to sample phase {phase}{}",
            self.slot.value(),
            if fine { " with fine tuning" } else { "" }
        );
        Ok(phase)
    }
}
