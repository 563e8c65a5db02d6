// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Queue pair memory layout and lifecycle.
//!
//! Each submission queue, its paired completion queue, and the reserved
//! command-info area share one contiguous, page-aligned allocation; the
//! PRP-list pool for the pair lives in a second allocation. Command ids
//! come from a per-queue FIFO free pool. The completion side implements
//! the phase-tag dequeue protocol; doorbell writes are the caller's
//! responsibility on both sides.

use core::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use log::{debug, trace, warn};
use spin::Mutex as SpinMutex;

use crate::cmd::{NvmeCmd, NvmeComp};
use crate::error::{Error, Result};
use crate::platform::{page_align, DmaRegion, Platform, PAGE_SIZE};
use crate::regs::{cq_doorbell_offset, sq_doorbell_offset};
use crate::{CmdId, CqId, Iv, SqId};

/// Round a requested entry count up so the submission ring is an integer
/// number of pages. The caller clamps to CAP.MQES before asking.
pub fn round_entries_to_page(requested: u32) -> u32 {
    let per_page = (PAGE_SIZE / core::mem::size_of::<NvmeCmd>()) as u32;
    if requested % per_page != 0 {
        (requested + per_page) & !(per_page - 1)
    } else {
        requested
    }
}

/// Backing store for one queue pair, allocated but not yet carved.
pub struct QueuePairMemory {
    pub queue_region: DmaRegion,
    pub prp_region: DmaRegion,
    /// Entry count after page rounding.
    pub entries: u16,
}

/// Allocate the two contiguous regions backing queue pair `qid`,
/// preferring the NUMA node that owns it. Fails without leaking: the
/// queue region is dropped if the PRP region cannot be allocated.
pub fn alloc_queue_memory(
    platform: &impl Platform,
    requested_entries: u32,
    numa_node: u16,
    prp_list_size: usize,
) -> Result<QueuePairMemory> {
    let entries = round_entries_to_page(requested_entries);

    let slot_size = core::mem::size_of::<CommandSlot>();
    let ring_bytes = entries as usize
        * (core::mem::size_of::<NvmeCmd>() + core::mem::size_of::<NvmeComp>() + slot_size);
    let queue_region = platform.alloc_contiguous(ring_bytes + PAGE_SIZE, numa_node)?;

    // PRP lists must not cross page boundaries, so sizing is in whole
    // pages with one extra for base alignment.
    let lists_per_page = (PAGE_SIZE / prp_list_size) as u32;
    let prp_pages = if entries % lists_per_page != 0 {
        entries / lists_per_page + 1
    } else {
        entries / lists_per_page
    };
    let prp_region =
        match platform.alloc_contiguous((prp_pages as usize + 1) * PAGE_SIZE, numa_node) {
            Ok(region) => region,
            Err(err) => {
                drop(queue_region);
                return Err(err);
            }
        };

    debug!(
        "queue mem: {} entries, ring {} bytes, prp {} pages",
        entries,
        ring_bytes + PAGE_SIZE,
        prp_pages + 1
    );

    Ok(QueuePairMemory { queue_region, prp_region, entries: entries as u16 })
}

/// One command identifier with its dedicated PRP list buffer. `pending`
/// implies the id is not in the free pool.
pub struct CommandSlot {
    pub cmd_id: CmdId,
    pending: AtomicBool,
    /// Opaque context from the acquirer; zero when unset.
    context: AtomicU64,
    prp_list_offset: usize,
    prp_list_phys: u64,
}

/// Handle returned by [`SubQueue::acquire`]: the command id plus the
/// physical address of the slot's PRP list.
#[derive(Debug, Clone, Copy)]
pub struct CmdHandle {
    pub cmd_id: CmdId,
    pub prp_list_phys: u64,
}

struct SqInner {
    tail: u16,
    head: u16,
}

/// Submission queue ring plus its command slot pool and PRP-list pool.
pub struct SubQueue {
    pub id: SqId,
    pub entries: u16,
    pub shared: bool,
    pub cpl_queue_id: CqId,
    ring_base: *mut u8,
    ring_phys: u64,
    prp_base: *mut u8,
    prp_list_size: usize,
    pub prp_lists_per_page: u16,
    doorbell: usize,
    state: SpinMutex<SqInner>,
    /// Command-info array, carved in place from `queue_region` right
    /// after the completion ring.
    slots: *mut CommandSlot,
    free: ArrayQueue<CmdId>,
    /// Commands submitted over the queue's lifetime.
    requests: AtomicU64,
    queue_region: DmaRegion,
    prp_region: DmaRegion,
}

unsafe impl Send for SubQueue {}
unsafe impl Sync for SubQueue {}

/// Completion queue ring. Points into its paired submission queue's
/// allocation; the pair is owned and dropped together by the queue set.
pub struct CplQueue {
    pub id: CqId,
    pub entries: u16,
    pub shared: bool,
    pub msg_vector: Iv,
    ring_base: *mut u8,
    ring_phys: u64,
    doorbell: usize,
    state: SpinMutex<CqInner>,
}

unsafe impl Send for CplQueue {}
unsafe impl Sync for CplQueue {}

struct CqInner {
    head: u16,
    phase: u16,
    completions: u64,
}

/// Build a submission/completion queue pair out of its backing store.
///
/// The submission ring starts at the first page boundary of the region;
/// the completion ring follows it, re-aligned to a page (a no-op when the
/// entry count is page-rounded); the command-info array is carved in
/// place right after the completion ring, so it shares the pair's
/// NUMA-local allocation. PRP lists are carved from the second region
/// without ever crossing a page boundary.
pub fn build_queue_pair(
    mut mem: QueuePairMemory,
    qid: u16,
    shared: bool,
    msg_vector: Iv,
    dstrd: u32,
    prp_list_size: usize,
) -> (SubQueue, CplQueue) {
    let entries = mem.entries;

    let base_addr = mem.queue_region.as_mut_ptr() as usize;
    let sq_addr = page_align(base_addr);
    let sq_phys = mem.queue_region.phys_at(sq_addr - base_addr);

    let cq_addr = page_align(sq_addr + entries as usize * core::mem::size_of::<NvmeCmd>());
    let cq_phys = mem.queue_region.phys_at(cq_addr - base_addr);

    // Command-info array directly after the completion ring. The ring
    // offsets keep it 16-byte aligned, which covers the slot layout.
    let slots = (cq_addr + entries as usize * core::mem::size_of::<NvmeComp>())
        as *mut CommandSlot;

    let prp_base_addr = mem.prp_region.as_mut_ptr() as usize;
    let prp_addr = page_align(prp_base_addr);
    let lists_per_page = (PAGE_SIZE / prp_list_size) as u16;

    // Carve one PRP list per slot in increasing id order. A list that
    // would start within `prp_list_size` of a page boundary moves to the
    // next page. Offsets are relative to the aligned pool base.
    let free = ArrayQueue::new(entries as usize);
    let mut cursor = 0usize;
    for cmd_id in 0..entries {
        let room = PAGE_SIZE - (cursor % PAGE_SIZE);
        if room < prp_list_size {
            cursor = page_align(cursor);
        }
        unsafe {
            slots.add(cmd_id as usize).write(CommandSlot {
                cmd_id,
                pending: AtomicBool::new(false),
                context: AtomicU64::new(0),
                prp_list_offset: cursor,
                prp_list_phys: mem.prp_region.phys_at((prp_addr - prp_base_addr) + cursor),
            });
        }
        free.push(cmd_id).expect("free pool sized to entry count");
        cursor += prp_list_size;
    }

    let sub = SubQueue {
        id: qid,
        entries,
        shared,
        cpl_queue_id: qid,
        ring_base: sq_addr as *mut u8,
        ring_phys: sq_phys,
        prp_base: prp_addr as *mut u8,
        prp_list_size,
        prp_lists_per_page: lists_per_page,
        doorbell: sq_doorbell_offset(qid, dstrd),
        state: SpinMutex::new(SqInner { tail: 0, head: 0 }),
        slots,
        free,
        requests: AtomicU64::new(0),
        queue_region: mem.queue_region,
        prp_region: mem.prp_region,
    };

    let cpl = CplQueue {
        id: qid,
        entries,
        shared,
        msg_vector,
        ring_base: cq_addr as *mut u8,
        ring_phys: cq_phys,
        doorbell: cq_doorbell_offset(qid, dstrd),
        state: SpinMutex::new(CqInner { head: 0, phase: 0, completions: 0 }),
    };

    (sub, cpl)
}

impl SubQueue {
    pub fn ring_phys(&self) -> u64 {
        self.ring_phys
    }

    /// Total backing store held by this pair, both regions.
    pub fn backing_len(&self) -> usize {
        self.queue_region.len() + self.prp_region.len()
    }

    fn slot(&self, cmd_id: CmdId) -> &CommandSlot {
        debug_assert!(cmd_id < self.entries);
        unsafe { &*self.slots.add(cmd_id as usize) }
    }

    /// Byte offset of this queue's tail doorbell.
    pub fn doorbell_offset(&self) -> usize {
        self.doorbell
    }

    /// Acquire a free command slot, marking it pending and attaching the
    /// caller's context.
    pub fn acquire(&self, context: u64) -> Result<CmdHandle> {
        let cmd_id = match self.free.pop() {
            Some(id) => id,
            None => {
                warn!("sq {}: command slots exhausted", self.id);
                return Err(Error::ResourceExhausted(self.id));
            }
        };
        let slot = self.slot(cmd_id);
        let was_pending = slot.pending.swap(true, Ordering::AcqRel);
        debug_assert!(!was_pending, "slot in free pool was pending");
        slot.context.store(context, Ordering::Release);
        trace!("sq {}: acquired slot {}", self.id, cmd_id);
        Ok(CmdHandle { cmd_id, prp_list_phys: slot.prp_list_phys })
    }

    /// Release a slot back to the tail of the free pool, returning the
    /// context it carried.
    pub fn release(&self, cmd_id: CmdId) -> u64 {
        let slot = self.slot(cmd_id);
        let context = slot.context.swap(0, Ordering::AcqRel);
        slot.pending.store(false, Ordering::Release);
        self.free.push(cmd_id).expect("released id exceeds pool capacity");
        context
    }

    pub fn context(&self, cmd_id: CmdId) -> u64 {
        self.slot(cmd_id).context.load(Ordering::Acquire)
    }

    pub fn is_pending(&self, cmd_id: CmdId) -> bool {
        self.slot(cmd_id).pending.load(Ordering::Acquire)
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn pending_slots(&self) -> usize {
        self.entries as usize - self.free.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_slots() != 0
    }

    /// Count pending slots whose context satisfies the predicate.
    pub fn pending_with(&self, pred: impl Fn(u64) -> bool) -> usize {
        (0..self.entries)
            .filter(|&id| {
                let slot = self.slot(id);
                slot.pending.load(Ordering::Acquire) && pred(slot.context.load(Ordering::Acquire))
            })
            .count()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Write one PRP entry into the slot's list.
    pub fn write_prp_entry(&self, handle: &CmdHandle, index: usize, phys: u64) {
        let slot = self.slot(handle.cmd_id);
        debug_assert!((index + 1) * core::mem::size_of::<u64>() <= self.prp_list_size);
        unsafe {
            let list = self.prp_base.add(slot.prp_list_offset) as *mut u64;
            list.add(index).write_volatile(phys);
        }
    }

    /// Physical address of a slot's PRP list.
    pub fn prp_list_phys(&self, cmd_id: CmdId) -> u64 {
        self.slot(cmd_id).prp_list_phys
    }

    /// Copy a command into the ring and advance the tail. The returned
    /// value is the new tail for the doorbell write, which must follow
    /// this call.
    pub fn push(&self, cmd: NvmeCmd) -> Result<u16> {
        let mut inner = self.state.lock();
        let next_tail = (inner.tail + 1) % self.entries;
        if next_tail == inner.head {
            return Err(Error::ResourceExhausted(self.id));
        }
        unsafe {
            (self.ring_base as *mut NvmeCmd).add(inner.tail as usize).write_volatile(cmd);
        }
        // The entry must be globally visible before the doorbell write.
        fence(Ordering::Release);
        inner.tail = next_tail;
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(inner.tail)
    }

    /// Record the head the controller reported in a completion.
    pub fn update_head(&self, head: u16) {
        self.state.lock().head = head % self.entries;
    }

    pub fn tail(&self) -> u16 {
        self.state.lock().tail
    }

    /// Reset ring pointers after the queue is deleted on the controller.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.tail = 0;
        inner.head = 0;
    }
}

impl CplQueue {
    pub fn ring_phys(&self) -> u64 {
        self.ring_phys
    }

    pub fn doorbell_offset(&self) -> usize {
        self.doorbell
    }

    /// Dequeue one newly completed entry, if any.
    ///
    /// An entry is new when its phase bit differs from the queue's current
    /// phase tag. Advancing past the last entry wraps the head to zero and
    /// inverts the tag. The head doorbell write is the caller's job.
    pub fn pop(&self) -> Option<NvmeComp> {
        let mut inner = self.state.lock();
        let slot = unsafe { (self.ring_base as *const NvmeComp).add(inner.head as usize) };
        let status = unsafe { core::ptr::addr_of!((*slot).status).read_volatile() };
        if status & 1 == inner.phase {
            return None;
        }
        // The phase bit must be observed before the rest of the entry.
        fence(Ordering::Acquire);
        let entry = unsafe { slot.read_volatile() };

        inner.head += 1;
        inner.completions += 1;
        if inner.head == self.entries {
            inner.head = 0;
            inner.phase ^= 1;
        }
        Some(entry)
    }

    pub fn head(&self) -> u16 {
        self.state.lock().head
    }

    pub fn completions(&self) -> u64 {
        self.state.lock().completions
    }

    /// Reset dequeue state after the queue is deleted on the controller.
    /// The ring is zeroed so stale phase bits cannot leak into the next
    /// incarnation of the queue.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.head = 0;
        inner.phase = 0;
        unsafe {
            core::ptr::write_bytes(
                self.ring_base,
                0,
                self.entries as usize * core::mem::size_of::<NvmeComp>(),
            );
        }
    }

    pub fn set_msg_vector(&mut self, iv: Iv) {
        self.msg_vector = iv;
    }
}

/// The admin pair plus all IO pairs, with the allocation/creation
/// counters the bring-up state machine works against.
#[derive(Default)]
pub struct QueueSet {
    /// Indexed by queue id; entry 0 is the admin pair.
    pub sub: Vec<SubQueue>,
    pub cpl: Vec<CplQueue>,
    pub num_sub_alloc_from_adapter: u16,
    pub num_cpl_alloc_from_adapter: u16,
    pub num_sub_allocated: u16,
    pub num_cpl_allocated: u16,
    pub num_sub_created: u16,
    pub num_cpl_created: u16,
    pub num_ad_entries_allocated: u16,
    pub num_io_entries_allocated: u16,
}

impl QueueSet {
    pub fn sub_queue(&self, id: SqId) -> Result<&SubQueue> {
        self.sub.get(id as usize).ok_or(Error::InvalidParameter("submission queue id"))
    }

    pub fn cpl_queue(&self, id: CqId) -> Result<&CplQueue> {
        self.cpl.get(id as usize).ok_or(Error::InvalidParameter("completion queue id"))
    }

    pub fn cpl_queue_mut(&mut self, id: CqId) -> Result<&mut CplQueue> {
        self.cpl.get_mut(id as usize).ok_or(Error::InvalidParameter("completion queue id"))
    }

    /// True when any queue still has a pending command slot.
    pub fn any_pending(&self) -> bool {
        self.sub.iter().any(|sq| sq.has_pending())
    }

    /// Drop all queue pairs in reverse construction order. Each pair's
    /// completion queue goes first: the paired submission queue owns the
    /// backing store.
    pub fn free_all(&mut self) {
        while let Some(cpl) = self.cpl.pop() {
            drop(cpl);
            self.sub.pop();
        }
        self.sub.clear();
        self.num_sub_allocated = 0;
        self.num_cpl_allocated = 0;
        self.num_sub_created = 0;
        self.num_cpl_created = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    const PRP_LIST_SIZE: usize = 256;

    fn test_pair(entries: u32) -> (SubQueue, CplQueue) {
        let platform = SimPlatform::builder().build();
        let mem = alloc_queue_memory(&platform, entries, 0, PRP_LIST_SIZE).unwrap();
        build_queue_pair(mem, 1, false, 1, 0, PRP_LIST_SIZE)
    }

    #[test]
    fn entries_round_up_to_a_page_of_commands() {
        assert_eq!(round_entries_to_page(64), 64);
        assert_eq!(round_entries_to_page(65), 128);
        assert_eq!(round_entries_to_page(100), 128);
        assert_eq!(round_entries_to_page(128), 128);
    }

    #[test]
    fn rings_are_page_aligned_and_disjoint() {
        let (sq, cq) = test_pair(128);
        assert_eq!(sq.ring_phys() % PAGE_SIZE as u64, 0);
        assert_eq!(cq.ring_phys() % PAGE_SIZE as u64, 0);
        let sq_bytes = 128 * core::mem::size_of::<NvmeCmd>() as u64;
        assert_eq!(cq.ring_phys(), sq.ring_phys() + sq_bytes);
    }

    #[test]
    fn prp_lists_never_cross_a_page() {
        let (sq, _cq) = test_pair(128);
        for id in 0..sq.entries {
            let phys = sq.prp_list_phys(id);
            let first_page = phys / PAGE_SIZE as u64;
            let last_page = (phys + PRP_LIST_SIZE as u64 - 1) / PAGE_SIZE as u64;
            assert_eq!(first_page, last_page, "slot {} list crosses a page", id);
        }
    }

    #[test]
    fn prp_lists_are_distinct() {
        let (sq, _cq) = test_pair(128);
        for a in 0..sq.entries {
            for b in a + 1..sq.entries {
                let pa = sq.prp_list_phys(a);
                let pb = sq.prp_list_phys(b);
                assert!(pa.abs_diff(pb) >= PRP_LIST_SIZE as u64);
            }
        }
    }

    #[test]
    fn acquire_release_round_trips() {
        let (sq, _cq) = test_pair(64);
        assert_eq!(sq.free_slots(), 64);

        let handle = sq.acquire(0xDEAD).unwrap();
        assert_eq!(handle.cmd_id, 0);
        assert!(sq.is_pending(0));
        assert_eq!(sq.free_slots(), 63);
        assert_eq!(sq.pending_slots(), 1);

        assert_eq!(sq.release(0), 0xDEAD);
        assert!(!sq.is_pending(0));
        assert_eq!(sq.free_slots(), 64);

        // FIFO reinsertion: id 0 comes back only after the others.
        let next = sq.acquire(1).unwrap();
        assert_eq!(next.cmd_id, 1);
    }

    #[test]
    fn acquire_exhausts_cleanly() {
        let (sq, _cq) = test_pair(64);
        for _ in 0..64 {
            sq.acquire(1).unwrap();
        }
        assert!(matches!(sq.acquire(1), Err(Error::ResourceExhausted(1))));
        assert_eq!(sq.pending_slots() + sq.free_slots(), sq.entries as usize);
    }

    #[test]
    fn push_advances_tail_and_detects_full() {
        let (sq, _cq) = test_pair(64);
        for i in 0..63 {
            let tail = sq.push(NvmeCmd::async_event_request(i)).unwrap();
            assert_eq!(tail, i + 1);
        }
        // One entry is kept open to distinguish full from empty.
        assert!(sq.push(NvmeCmd::async_event_request(63)).is_err());
        sq.update_head(1);
        assert!(sq.push(NvmeCmd::async_event_request(63)).is_ok());
    }

    #[test]
    fn pop_follows_the_phase_tag() {
        let (sq, cq) = test_pair(64);
        assert!(cq.pop().is_none());

        // Post an entry the way the controller would: phase flipped to 1.
        let entry = NvmeComp { cid: 5, status: 1, ..Default::default() };
        unsafe {
            let base = (cq.ring_phys() as usize) as *mut NvmeComp;
            base.write_volatile(entry);
        }
        let popped = cq.pop().expect("entry with flipped phase is new");
        assert_eq!(popped.cid, 5);
        assert!(cq.pop().is_none(), "same entry must not be seen twice");
        assert_eq!(cq.head(), 1);
        assert_eq!(cq.completions(), 1);
        drop(sq);
    }

    #[test]
    fn pop_wraps_and_inverts_phase() {
        let (sq, cq) = test_pair(64);
        let base = cq.ring_phys() as usize as *mut NvmeComp;

        // Fill a full lap with phase 1.
        for i in 0..64u16 {
            let entry = NvmeComp { cid: i, status: 1, ..Default::default() };
            unsafe { base.add(i as usize).write_volatile(entry) };
        }
        for i in 0..64u16 {
            assert_eq!(cq.pop().unwrap().cid, i);
        }
        assert_eq!(cq.head(), 0);

        // Second lap: the controller now writes phase 0.
        let entry = NvmeComp { cid: 99, status: 0, ..Default::default() };
        unsafe { base.write_volatile(entry) };
        assert_eq!(cq.pop().unwrap().cid, 99);
        drop(sq);
    }

    #[test]
    fn reset_restores_initial_dequeue_state() {
        let (sq, cq) = test_pair(64);
        let base = cq.ring_phys() as usize as *mut NvmeComp;
        let entry = NvmeComp { cid: 1, status: 1, ..Default::default() };
        unsafe { base.write_volatile(entry) };
        assert!(cq.pop().is_some());

        cq.reset();
        assert_eq!(cq.head(), 0);
        // The ring is zeroed, so the stale entry is gone.
        assert!(cq.pop().is_none());

        // A fresh first-lap entry is seen normally.
        let entry = NvmeComp { cid: 2, status: 1, ..Default::default() };
        unsafe { base.write_volatile(entry) };
        assert_eq!(cq.pop().unwrap().cid, 2);
        drop(sq);
    }
}
