//! # Internal DMAC descriptors
use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, Ordering},
};

use arbitrary_int::u13;
use vcell::VolatileCell;

/// Largest buffer one descriptor transfers.
pub const MAX_DESCRIPTOR_BUFFER: usize = 4096;

/// Size of one descriptor in memory.
pub const DESCRIPTOR_SIZE: usize = 16;

#[bitbybit::bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum Ownership {
    Software = 0,
    /// The internal DMAC owns the descriptor. Cleared by the DMAC once the buffer was
    /// transferred.
    Hardware = 1,
}

#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct DescriptorControl {
    #[bit(31, rw)]
    ownership: Ownership,
    /// Set by the DMAC if the card reported an error for this transfer.
    #[bit(30, rw)]
    card_error_summary: bool,
    /// The next descriptor is at the base address again.
    #[bit(5, rw)]
    end_of_ring: bool,
    /// The fourth word holds the address of the next descriptor.
    #[bit(4, rw)]
    chained: bool,
    #[bit(3, rw)]
    first: bool,
    #[bit(2, rw)]
    last: bool,
    /// Do not raise the transmit/receive interrupt when this descriptor completes.
    #[bit(1, rw)]
    disable_interrupt: bool,
}

#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct BufferSizes {
    #[bits(13..=25, rw)]
    buffer_2_size: u13,
    #[bits(0..=12, rw)]
    buffer_1_size: u13,
}

/// Internal DMAC descriptor.
///
/// The user should declare an array of this structure inside uncached memory, for example
/// with a [DescriptorList].
#[repr(C, align(16))]
pub struct Descriptor {
    pub control: VolatileCell<DescriptorControl>,
    pub sizes: VolatileCell<BufferSizes>,
    /// Bus address of the data buffer.
    pub buffer: VolatileCell<u32>,
    /// Bus address of the next descriptor in chained mode.
    pub next: VolatileCell<u32>,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Descriptor>(), DESCRIPTOR_SIZE);

impl Descriptor {
    #[inline]
    pub const fn new() -> Self {
        Self {
            control: VolatileCell::new(DescriptorControl::new_with_raw_value(0)),
            sizes: VolatileCell::new(BufferSizes::new_with_raw_value(0)),
            buffer: VolatileCell::new(0),
            next: VolatileCell::new(0),
        }
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.control.get().ownership()
    }

    #[inline]
    pub fn read_control(&self) -> DescriptorControl {
        self.control.get()
    }

    #[inline]
    pub fn set_control(&self, control: DescriptorControl) {
        self.control.set(control);
    }

    /// Describe one buffer of a chain. Interrupts stay disabled for it until it is marked as
    /// the last descriptor. The descriptor stays software owned until it is handed over.
    pub fn setup_buffer(&self, addr: u32, len: u13, end_of_ring: bool) {
        self.sizes.set(BufferSizes::new_with_raw_value(0).with_buffer_1_size(len));
        self.buffer.set(addr);
        self.set_control(
            DescriptorControl::new_with_raw_value(0)
                .with_ownership(Ownership::Software)
                .with_chained(true)
                .with_disable_interrupt(true)
                .with_end_of_ring(end_of_ring),
        );
    }

    /// Return the descriptor to software, keeping only the end-of-ring marker.
    pub fn release(&self) {
        let end_of_ring = self.read_control().end_of_ring();
        self.set_control(
            DescriptorControl::new_with_raw_value(0)
                .with_ownership(Ownership::Software)
                .with_end_of_ring(end_of_ring),
        );
    }
}

impl Default for Descriptor {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// This is a low level wrapper to simplify declaring a static descriptor list.
///
/// It allows placing the descriptor structure statically in memory which might not
/// be zero-initialized.
pub struct DescriptorList<const SLOTS: usize> {
    descr: UnsafeCell<MaybeUninit<[Descriptor; SLOTS]>>,
    taken: AtomicBool,
}

unsafe impl<const SLOTS: usize> Sync for DescriptorList<SLOTS> {}

impl<const SLOTS: usize> DescriptorList<SLOTS> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            descr: UnsafeCell::new(MaybeUninit::uninit()),
            taken: AtomicBool::new(false),
        }
    }

    /// Initializes the descriptors and returns a mutable reference to them. Only the first
    /// call returns the list.
    #[allow(clippy::mut_from_ref)]
    pub fn take(&self) -> Option<&mut [Descriptor; SLOTS]> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        // Safety: The taken flag guarantees this is the only reference handed out.
        let descr = unsafe { &mut *self.descr.get() };
        descr.write([const { Descriptor::new() }; SLOTS]);
        Some(unsafe { descr.assume_init_mut() })
    }
}

impl<const SLOTS: usize> Default for DescriptorList<SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}
