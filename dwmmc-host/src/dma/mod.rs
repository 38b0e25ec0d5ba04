//! # Internal DMA controller
//!
//! The internal DMAC walks a ring of chained [Descriptor]s. The ring never owns the data
//! buffers, it only describes the mapped scatter list of the active transfer. Completion is
//! reported through the DMAC status register, separately from the command and data interrupts.
use core::sync::atomic::{Ordering, fence};

use arbitrary_int::{u5, u6, u13};
use dwmmc::{Command, Control, IdmacInterrupts, IdmacState};
use embedded_hal::delay::DelayNs;

use crate::{
    SlotId,
    clock::send_ciu_command,
    error::{DmaBuildError, ResetTimeout},
    regs::{HostRegisters, wait_reset},
    request::{Data, opcode},
};

pub mod descr;

pub use descr::{
    DESCRIPTOR_SIZE, Descriptor, DescriptorControl, DescriptorList, MAX_DESCRIPTOR_BUFFER,
    Ownership,
};

/// Transfers shorter than this always use PIO.
pub const DMA_THRESHOLD: usize = 4;

/// Position of a descriptor inside the ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorHandle(usize);

impl DescriptorHandle {
    #[inline]
    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Descriptors describing one transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    first: usize,
    count: usize,
    len: usize,
}

impl DescriptorChain {
    #[inline]
    pub const fn descriptor_count(&self) -> usize {
        self.count
    }

    /// Bytes described by the chain.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Check whether a transfer qualifies for DMA before its buffers are mapped.
///
/// Short transfers and transfers with a block size or buffer length which is not a multiple of
/// `alignment` are handled with PIO.
pub fn check_layout(data: &Data, alignment: usize) -> Result<(), DmaBuildError> {
    let total = data.len();
    if total < DMA_THRESHOLD {
        return Err(DmaBuildError::BelowThreshold);
    }
    let align_mask = alignment - 1;
    if data.block_size as usize & align_mask != 0 {
        return Err(DmaBuildError::Misaligned);
    }
    let mut remaining = total;
    for segment in data.segments.iter() {
        if remaining == 0 {
            break;
        }
        let used = segment.len().min(remaining);
        if used & align_mask != 0 {
            return Err(DmaBuildError::Misaligned);
        }
        remaining -= used;
    }
    Ok(())
}

/// Ring of internal DMAC descriptors.
pub struct DescriptorRing<'a> {
    list: &'a mut [Descriptor],
    next: usize,
}

impl core::fmt::Debug for DescriptorRing<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DescriptorRing")
            .field("next", &self.next)
            .field("list_len", &self.list.len())
            .finish()
    }
}

impl<'a> DescriptorRing<'a> {
    /// Create the ring and link the descriptors.
    ///
    /// Returns [None] for an empty list.
    pub fn new(list: &'a mut [Descriptor]) -> Option<Self> {
        if list.is_empty() {
            return None;
        }
        let mut ring = Self { list, next: 0 };
        ring.init_or_reset();
        Some(ring)
    }
}

impl DescriptorRing<'_> {
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn base_ptr(&self) -> *const Descriptor {
        self.list.as_ptr()
    }

    #[inline]
    pub fn base_addr(&self) -> u32 {
        self.base_ptr() as usize as u32
    }

    /// Forward link all descriptors. The last one points back to the base and carries the
    /// end-of-ring marker. Every descriptor is software owned afterwards.
    pub fn init_or_reset(&mut self) {
        self.next = 0;
        let base = self.base_addr();
        let last = self.list.len() - 1;
        for (idx, descr) in self.list.iter().enumerate() {
            descr.set_control(
                DescriptorControl::new_with_raw_value(0)
                    .with_ownership(Ownership::Software)
                    .with_end_of_ring(idx == last),
            );
            descr.sizes.set(descr::BufferSizes::new_with_raw_value(0));
            descr.buffer.set(0);
            descr.next.set(if idx == last {
                base
            } else {
                base + ((idx + 1) * DESCRIPTOR_SIZE) as u32
            });
        }
    }

    /// Next free descriptor, counted from the start of the ring.
    pub fn acquire_next(&mut self) -> Option<DescriptorHandle> {
        if self.next >= self.list.len() || self.list[self.next].ownership() == Ownership::Hardware
        {
            return None;
        }
        let handle = DescriptorHandle(self.next);
        self.next += 1;
        Some(handle)
    }

    #[inline]
    pub fn descriptor(&self, handle: DescriptorHandle) -> &Descriptor {
        &self.list[handle.0]
    }

    /// Terminate a chain at the given descriptor. Its completion raises an interrupt.
    pub fn mark_last(&mut self, handle: DescriptorHandle) {
        let descr = &self.list[handle.0];
        let mut control = descr.read_control();
        control.set_chained(false);
        control.set_disable_interrupt(false);
        control.set_last(true);
        descr.set_control(control);
    }

    /// Describe a mapped scatter list with descriptors of at most [MAX_DESCRIPTOR_BUFFER] bytes.
    ///
    /// The descriptors stay software owned until [Self::start].
    pub fn build(
        &mut self,
        data: &Data,
        alignment: usize,
    ) -> Result<DescriptorChain, DmaBuildError> {
        check_layout(data, alignment)?;
        let align_mask = (alignment - 1) as u32;
        let total = data.len();
        let mut remaining = total;
        let mut needed = 0;
        for (segment, addr) in data.segments.iter().zip(data.mapped.iter()) {
            if remaining == 0 {
                break;
            }
            if addr & align_mask != 0 {
                return Err(DmaBuildError::Misaligned);
            }
            let used = segment.len().min(remaining);
            needed += used.div_ceil(MAX_DESCRIPTOR_BUFFER);
            remaining -= used;
        }
        // Every used segment must be mapped.
        if remaining != 0 {
            return Err(DmaBuildError::Misaligned);
        }
        if needed > self.list.len() {
            return Err(DmaBuildError::RingOverflow);
        }

        self.next = 0;
        let last_idx = self.list.len() - 1;
        let mut remaining = total;
        let mut first = None;
        let mut count = 0;
        for (segment, addr) in data.segments.iter().zip(data.mapped.iter()) {
            if remaining == 0 {
                break;
            }
            let used = segment.len().min(remaining);
            let mut offset = 0;
            while offset < used {
                let handle = self.acquire_next().ok_or(DmaBuildError::RingOverflow)?;
                let chunk = (used - offset).min(MAX_DESCRIPTOR_BUFFER);
                self.list[handle.0].setup_buffer(
                    addr + offset as u32,
                    u13::new(chunk as u16),
                    handle.0 == last_idx,
                );
                first.get_or_insert(handle.0);
                count += 1;
                offset += chunk;
            }
            remaining -= used;
        }
        Ok(DescriptorChain {
            first: first.unwrap_or(0),
            count,
            len: total,
        })
    }

    /// Program the descriptor base address and the DMAC interrupt enables.
    pub fn program<R: HostRegisters>(&self, regs: &mut R) {
        regs.write_bmod(dwmmc::BusMode::new_with_raw_value(0).with_software_reset(true));
        regs.write_idinten(
            IdmacInterrupts::new_with_raw_value(0)
                .with_normal_summary(true)
                .with_abnormal_summary(true)
                .with_receive(true)
                .with_transmit(true)
                .with_descriptor_unavailable(true),
        );
        regs.write_dbaddr(self.base_addr());
    }

    /// Hand the chain to the DMAC and start it.
    pub fn start<R: HostRegisters>(&mut self, regs: &mut R, chain: &DescriptorChain) {
        if chain.count == 0 {
            return;
        }
        let last = chain.first + chain.count - 1;
        for idx in chain.first..=last {
            let descr = &self.list[idx];
            let mut control = descr.read_control();
            control.set_first(idx == chain.first);
            control.set_ownership(Ownership::Hardware);
            descr.set_control(control);
        }
        self.mark_last(DescriptorHandle(last));
        fence(Ordering::SeqCst);

        regs.modify_ctrl(|ctrl| ctrl.with_use_internal_dmac(true));
        fence(Ordering::SeqCst);
        regs.modify_bmod(|bmod| bmod.with_idmac_enable(true).with_fixed_burst(true));
        regs.write_pldmnd(1);
    }

    /// Stop the DMAC and reset the DMA interface. Safe with nothing in flight.
    pub fn stop<R: HostRegisters, D: DelayNs>(
        &mut self,
        regs: &mut R,
        delay: &mut D,
    ) -> Result<(), ResetTimeout> {
        regs.modify_ctrl(|ctrl| ctrl.with_use_internal_dmac(false).with_dma_reset(true));
        let result = wait_reset(
            regs,
            delay,
            Control::new_with_raw_value(0).with_dma_reset(true),
        );
        regs.modify_bmod(|bmod| bmod.with_idmac_enable(false).with_fixed_burst(false));
        self.release_all();
        result
    }

    /// Software reset of the DMAC.
    pub fn reset<R: HostRegisters>(&mut self, regs: &mut R) {
        regs.modify_bmod(|bmod| bmod.with_software_reset(true));
        self.release_all();
    }

    /// Return the descriptors of a finished transfer to software.
    pub fn complete(&mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        self.next = 0;
        for descr in self.list.iter() {
            descr.release();
        }
    }

    /// Get a DMAC out of the suspended state after a descriptor unavailable error.
    ///
    /// Every status command with data expected consumes one internal DMAC count. Commands are
    /// sent until the DMAC leaves the suspend state or the budget is exhausted. Returns the
    /// number of commands needed on success.
    pub fn recover_descriptor_unavailable<R: HostRegisters, D: DelayNs>(
        &mut self,
        regs: &mut R,
        delay: &mut D,
        slot: SlotId,
        budget: u32,
    ) -> Option<u32> {
        let du_ai = IdmacInterrupts::new_with_raw_value(0)
            .with_descriptor_unavailable(true)
            .with_abnormal_summary(true);
        let mask = regs.read_idinten();
        regs.write_idinten(IdmacInterrupts::new_with_raw_value(
            mask.raw_value() & !du_ai.raw_value(),
        ));

        let cmd = Command::new_with_raw_value(0)
            .with_voltage_switch(true)
            .with_data_expected(true)
            .with_check_response_crc(true)
            .with_response_expected(true)
            .with_card_number(u5::new(slot.value()))
            .with_index(u6::new(opcode::SEND_STATUS));
        let mut recovered = None;
        for attempt in 0..budget {
            if send_ciu_command(regs, delay, cmd, 0).is_err() {
                break;
            }
            if regs.read_idsts().fsm_state() == Ok(IdmacState::Suspend) {
                self.reset(regs);
                regs.modify_bmod(|bmod| bmod.with_idmac_enable(true).with_fixed_burst(true));
                regs.write_idsts(du_ai);
            } else {
                recovered = Some(attempt + 1);
                break;
            }
        }

        let mask = regs.read_idinten();
        regs.write_idinten(IdmacInterrupts::new_with_raw_value(
            mask.raw_value() | du_ai.raw_value(),
        ));
        match recovered {
            Some(count) => {
                log::info!("recovered from descriptor unavailable after {count} commands")
            }
            None => log::warn!("recovery from descriptor unavailable failed"),
        }
        recovered
    }
}
