//! Card presence and write protection.
use dwmmc::Interrupts;

use super::Host;
use crate::{
    SlotId,
    board::{Board, HostNotifier, PowerMode},
    error::Error,
    regs::HostRegisters,
};

impl<R: HostRegisters, B: Board, N: HostNotifier> Host<'_, R, B, N> {
    /// Read the current card presence of a slot.
    ///
    /// The board hook wins over the controller detect line, which is active low. With broken
    /// card detection, the last state passed to [Self::notify_card_change] is used.
    pub(crate) fn get_card_present(&mut self, slot: SlotId) -> bool {
        if self.config.quirks.broken_card_detection {
            return self
                .slot_index(slot)
                .is_none_or(|idx| self.slots[idx].reported);
        }
        if let Some(present) = self.board.card_detect(slot) {
            return present;
        }
        self.regs.read_cdetect() & (1 << slot.value()) == 0
    }

    /// Whether the card in a slot is write protected.
    pub fn get_write_protected(&mut self, slot: SlotId) -> bool {
        self.board
            .write_protect(slot)
            .unwrap_or_else(|| self.regs.read_wrtprt() & (1 << slot.value()) != 0)
    }

    /// Process card presence changes of all slots.
    ///
    /// A removed card fails the active and queued requests of its slot with
    /// [Error::NoMedium]. FIFO and controller are reset and the slot is powered down before the
    /// next request starts.
    pub fn handle_card_detect(&mut self) {
        for idx in 0..self.slots.len() {
            let slot = SlotId::new(idx as u8);
            let mut present = self.get_card_present(slot);
            while present != self.slots[idx].present {
                log::info!(
                    "slot {idx}: card {}",
                    if present { "inserted" } else { "removed" }
                );
                if present {
                    self.board.set_power(slot, true);
                }
                self.slots[idx].present = present;

                if !present {
                    if self.state.active_slot() == Some(slot) {
                        self.abort_active(Error::NoMedium);
                    }
                    self.fail_queued(Some(slot), Error::NoMedium);
                    self.reset_after_error();
                    if let Some(ring) = self.ring.as_mut() {
                        ring.reset(&mut self.regs);
                    }
                    let state = &mut self.slots[idx];
                    state.tuned = false;
                    state.need_init = true;
                    state.power = PowerMode::Off;
                    self.board.set_power(slot, false);
                } else if self.current_slot.is_some() {
                    if let Err(err) = self.reset_controller() {
                        log::error!("controller reset after card insertion failed: {err}");
                    }
                    self.regs
                        .write_rintsts(Interrupts::new_with_raw_value(u32::MAX));
                }

                self.notifier.card_detect_changed(slot, present);
                present = self.get_card_present(slot);
            }
        }
        self.start_next();
    }

    /// Report a presence change on a slot without a working detect line.
    pub fn notify_card_change(&mut self, slot: SlotId, present: bool) {
        if let Some(idx) = self.slot_index(slot) {
            self.slots[idx].reported = present;
        }
        self.handle_card_detect();
    }
}
