//! # Host configuration
use crate::time::{Hertz, Microseconds, Milliseconds};

/// Watchdog timeout for regular requests.
pub const DEFAULT_REQUEST_TIMEOUT: Milliseconds = Milliseconds::from_ticks(10_000);
/// Watchdog timeout for tuning block reads.
pub const DEFAULT_TUNING_TIMEOUT: Milliseconds = Milliseconds::from_ticks(500);
pub const DEFAULT_BUSY_TIMEOUT: Milliseconds = Milliseconds::from_ticks(500);
pub const DEFAULT_BUSY_POLL_INTERVAL: Microseconds = Microseconds::from_ticks(10);
pub const DEFAULT_BUSY_RETRIES: u8 = 6;
pub const DEFAULT_DU_RECOVERY_BUDGET: u32 = 256;
pub const DEFAULT_TUNING_RETRIES: u8 = 3;

/// Controller and board specific deviations from the standard behaviour.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Quirks {
    /// The card detect signal is not wired. The card is reported present, and presence changes
    /// are only picked up through [crate::Host::notify_card_change].
    pub broken_card_detection: bool,
    /// Mark requests failing with a data CRC error for retry, up to five times in a row.
    pub retry_crc_error: bool,
    /// Newer IP versions need a 20 ms delay after a failed command before it can be retried.
    pub retry_delay: bool,
    /// The clock select register has a fine tuning bit, doubling the tuning resolution.
    pub fine_tuning: bool,
    /// Recover a suspended internal DMAC after a descriptor unavailable error.
    pub dma_suspend_recovery: bool,
}

impl Quirks {
    pub const fn new() -> Self {
        Self {
            broken_card_detection: false,
            retry_crc_error: false,
            retry_delay: false,
            fine_tuning: false,
            dma_suspend_recovery: false,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct HostConfig {
    /// Clock feeding the card interface unit. All card clocks are divided from it.
    pub bus_clock: Hertz,
    /// FIFO depth in data words. Read from the power-on RX watermark if not provided, which
    /// is only correct if no bootloader changed it.
    pub fifo_depth: Option<u32>,
    /// Number of slots, overrides the synthesis configuration.
    pub num_slots: Option<u8>,
    pub request_timeout: Milliseconds,
    pub tuning_timeout: Milliseconds,
    /// Replaces both watchdog timeouts if set.
    pub sw_request_timeout: Option<Milliseconds>,
    /// Budget of one data-not-busy poll round before the controller is reset.
    pub busy_timeout: Milliseconds,
    pub busy_poll_interval: Microseconds,
    pub busy_retries: u8,
    /// Use the internal DMA controller when a descriptor ring is supplied.
    pub use_dma: bool,
    /// Maximum number of status commands issued while recovering from a descriptor
    /// unavailable condition.
    pub du_recovery_budget: u32,
    /// Full tuning scans attempted before giving up.
    pub tuning_retries: u8,
    /// Sample phases which are never selected, one bit per phase.
    pub ignore_phase: u8,
    /// Only tune once per slot and reuse the result afterwards.
    pub only_once_tune: bool,
    /// Search for a narrow passing window first when the divider ratio is 1.
    pub extra_tuning: bool,
    pub quirks: Quirks,
}

impl HostConfig {
    pub const fn new(bus_clock: Hertz) -> Self {
        Self {
            bus_clock,
            fifo_depth: None,
            num_slots: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tuning_timeout: DEFAULT_TUNING_TIMEOUT,
            sw_request_timeout: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            busy_poll_interval: DEFAULT_BUSY_POLL_INTERVAL,
            busy_retries: DEFAULT_BUSY_RETRIES,
            use_dma: true,
            du_recovery_budget: DEFAULT_DU_RECOVERY_BUDGET,
            tuning_retries: DEFAULT_TUNING_RETRIES,
            ignore_phase: 0,
            only_once_tune: false,
            extra_tuning: false,
            quirks: Quirks::new(),
        }
    }

    pub const fn with_fifo_depth(mut self, depth: u32) -> Self {
        self.fifo_depth = Some(depth);
        self
    }

    pub const fn with_num_slots(mut self, slots: u8) -> Self {
        self.num_slots = Some(slots);
        self
    }

    pub const fn with_request_timeout(mut self, timeout: Milliseconds) -> Self {
        self.sw_request_timeout = Some(timeout);
        self
    }

    pub const fn with_busy_poll(mut self, timeout: Milliseconds, retries: u8) -> Self {
        self.busy_timeout = timeout;
        self.busy_retries = retries;
        self
    }

    pub const fn with_dma(mut self, use_dma: bool) -> Self {
        self.use_dma = use_dma;
        self
    }

    pub const fn with_du_recovery_budget(mut self, budget: u32) -> Self {
        self.du_recovery_budget = budget;
        self
    }

    pub const fn with_tuning(
        mut self,
        retries: u8,
        ignore_phase: u8,
        only_once: bool,
        extra_tuning: bool,
    ) -> Self {
        self.tuning_retries = retries;
        self.ignore_phase = ignore_phase;
        self.only_once_tune = only_once;
        self.extra_tuning = extra_tuning;
        self
    }

    pub const fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }

    /// Watchdog timeout for a request with the given main command.
    pub fn watchdog_timeout(&self, opcode: u8) -> Milliseconds {
        if let Some(timeout) = self.sw_request_timeout {
            return timeout;
        }
        match opcode {
            crate::request::opcode::SEND_TUNING_BLOCK
            | crate::request::opcode::SEND_TUNING_BLOCK_HS200
            | crate::request::opcode::VOLTAGE_SWITCH => self.tuning_timeout,
            _ => self.request_timeout,
        }
    }

    /// Number of polls in one data-not-busy round.
    pub(crate) fn busy_polls_per_round(&self) -> u32 {
        let interval = self.busy_poll_interval.to_micros().max(1);
        (self.busy_timeout.to_micros() / interval).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::opcode;

    #[test]
    fn watchdog_defaults() {
        let config = HostConfig::new(Hertz::MHz(100));
        assert_eq!(config.watchdog_timeout(opcode::READ_SINGLE_BLOCK).to_millis(), 10_000);
        assert_eq!(config.watchdog_timeout(opcode::SEND_TUNING_BLOCK).to_millis(), 500);
        assert_eq!(config.watchdog_timeout(opcode::SEND_TUNING_BLOCK_HS200).to_millis(), 500);
        assert_eq!(config.watchdog_timeout(opcode::VOLTAGE_SWITCH).to_millis(), 500);
    }

    #[test]
    fn watchdog_override() {
        let config =
            HostConfig::new(Hertz::MHz(100)).with_request_timeout(Milliseconds::from_ticks(250));
        assert_eq!(config.watchdog_timeout(opcode::SEND_TUNING_BLOCK).to_millis(), 250);
        assert_eq!(config.watchdog_timeout(opcode::WRITE_BLOCK).to_millis(), 250);
    }

    #[test]
    fn busy_poll_rounds() {
        let config = HostConfig::new(Hertz::MHz(100));
        assert_eq!(config.busy_polls_per_round(), 50_000);
        assert_eq!(config.busy_retries, 6);
    }
}
