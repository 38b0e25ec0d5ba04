//! # Interrupt context sharing
//!
//! [SharedHost] puts a [Host] behind a critical section so the interrupt handler, the two board
//! timers and the deferred work can reach it from different contexts. The interrupt handler
//! only flags deferred work and wakes its task. The state machine and card detect processing
//! run from [SharedHost::run_bottom_half] and [SharedHost::run_card_detect] or, without an
//! executor, from [SharedHost::run_pending].
use core::{
    cell::RefCell,
    future::poll_fn,
    sync::atomic::{AtomicBool, Ordering},
    task::Poll,
};

use critical_section::Mutex;
use embassy_sync::waitqueue::AtomicWaker;

use crate::{
    board::{Board, HostNotifier},
    host::{Host, InterruptResult},
    regs::HostRegisters,
};

pub struct SharedHost<'g, R: HostRegisters, B: Board, N: HostNotifier> {
    host: Mutex<RefCell<Option<Host<'g, R, B, N>>>>,
    // Kept outside of the host so the flags can be set without nesting critical sections.
    bottom_half: AtomicBool,
    card_detect: AtomicBool,
    bottom_half_waker: AtomicWaker,
    card_detect_waker: AtomicWaker,
}

impl<'g, R: HostRegisters, B: Board, N: HostNotifier> SharedHost<'g, R, B, N> {
    pub const fn new() -> Self {
        Self {
            host: Mutex::new(RefCell::new(None)),
            bottom_half: AtomicBool::new(false),
            card_detect: AtomicBool::new(false),
            bottom_half_waker: AtomicWaker::new(),
            card_detect_waker: AtomicWaker::new(),
        }
    }

    /// Install the host. It is handed back if one is already installed.
    pub fn init(&self, host: Host<'g, R, B, N>) -> Result<(), Host<'g, R, B, N>> {
        critical_section::with(|cs| {
            let mut slot = self.host.borrow_ref_mut(cs);
            if slot.is_some() {
                return Err(host);
            }
            *slot = Some(host);
            Ok(())
        })
    }

    /// Remove the host, for example to call [Host::release].
    pub fn take(&self) -> Option<Host<'g, R, B, N>> {
        critical_section::with(|cs| self.host.borrow_ref_mut(cs).take())
    }

    /// Run a closure on the host inside a critical section. Returns [None] if no host is
    /// installed.
    pub fn with<T>(&self, f: impl FnOnce(&mut Host<'g, R, B, N>) -> T) -> Option<T> {
        critical_section::with(|cs| self.host.borrow_ref_mut(cs).as_mut().map(f))
    }

    /// Call this from the controller interrupt handler.
    pub fn on_interrupt(&self) -> InterruptResult {
        let result = self.with(|host| host.on_interrupt()).unwrap_or_default();
        if result.bottom_half {
            self.bottom_half.store(true, Ordering::Release);
            self.bottom_half_waker.wake();
        }
        if result.card_detect {
            self.card_detect.store(true, Ordering::Release);
            self.card_detect_waker.wake();
        }
        result
    }

    /// Call this when the request watchdog armed through [Board::arm_request_watchdog] fires.
    pub fn on_request_timeout(&self) {
        self.with(|host| host.on_request_timeout());
    }

    /// Call this when the monitor period armed through [Board::arm_data_timeout_monitor]
    /// elapsed.
    pub fn on_data_timeout_tick(&self) {
        if self
            .with(|host| host.on_data_timeout_tick())
            .unwrap_or(false)
        {
            self.bottom_half.store(true, Ordering::Release);
            self.bottom_half_waker.wake();
        }
    }

    /// Run flagged deferred work right away.
    pub fn run_pending(&self) {
        if self.card_detect.swap(false, Ordering::AcqRel) {
            self.with(|host| host.handle_card_detect());
        }
        if self.bottom_half.swap(false, Ordering::AcqRel) {
            self.with(|host| host.run_state_machine());
        }
    }

    /// Wait until the interrupt handler flagged state machine work.
    pub async fn bottom_half_event(&self) {
        poll_fn(|cx| {
            self.bottom_half_waker.register(cx.waker());
            if self.bottom_half.swap(false, Ordering::AcqRel) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Wait until the interrupt handler flagged a card detect change.
    pub async fn card_detect_event(&self) {
        poll_fn(|cx| {
            self.card_detect_waker.register(cx.waker());
            if self.card_detect.swap(false, Ordering::AcqRel) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Bottom half task body.
    pub async fn run_bottom_half(&self) -> ! {
        loop {
            self.bottom_half_event().await;
            self.with(|host| host.run_state_machine());
        }
    }

    /// Card detect task body.
    pub async fn run_card_detect(&self) -> ! {
        loop {
            self.card_detect_event().await;
            self.with(|host| host.handle_card_detect());
        }
    }
}

impl<R: HostRegisters, B: Board, N: HostNotifier> Default for SharedHost<'_, R, B, N> {
    fn default() -> Self {
        Self::new()
    }
}
