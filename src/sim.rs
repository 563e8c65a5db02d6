// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Software model of an NVMe controller behind the [`Platform`] trait.
//!
//! The model executes admin and IO submissions at doorbell-write time,
//! posts completion entries with correct phase tags into the rings the
//! driver allocated, and queues the message vector each completion fired.
//! It exists so the whole bring-up path can run, and be tested, without
//! hardware; fault knobs on the builder inject the error cases.

use std::collections::{HashMap, VecDeque};
use std::mem;

use log::trace;
use parking_lot::Mutex;

use crate::cmd::{admin_opcode, feature, nvm_opcode, NvmeCmd, NvmeComp};
use crate::error::{Error, Result};
use crate::identify::{
    IdentifyController, IdentifyNamespace, LbaRangeEntry, LBA_RANGE_ATTR_HIDDEN,
    LBA_RANGE_ATTR_OVERWRITEABLE, LBA_TYPE_FILESYSTEM,
};
use crate::platform::{DmaRegion, GroupAffinity, MsiInfo, Platform, ProcessorNumber};
use crate::regs::{
    REG_ACQ_HI, REG_ACQ_LO, REG_AQA, REG_ASQ_HI, REG_ASQ_LO, REG_CAP_HI, REG_CAP_LO, REG_CC,
    REG_CSTS, REG_INTMC, REG_INTMS, DOORBELL_BASE,
};
use crate::Iv;

const CC_EN: u32 = 1 << 0;
const CC_SHN_MASK: u32 = 0b11 << 14;
const CSTS_RDY: u32 = 1 << 0;
const CSTS_SHST_COMPLETE: u32 = 2 << 2;

const SC_INVALID_OPCODE: u8 = 0x01;
const SC_INVALID_FIELD: u8 = 0x02;
const SC_INTERNAL_ERROR: u8 = 0x06;
const SC_INVALID_NAMESPACE: u8 = 0x0B;

/// One modeled namespace.
#[derive(Debug, Clone, Copy)]
pub struct SimNamespace {
    pub blocks: u64,
    /// log2 of the block size.
    pub block_shift: u8,
    pub hidden: bool,
    pub overwriteable: bool,
}

impl SimNamespace {
    pub fn visible(blocks: u64) -> Self {
        SimNamespace { blocks, block_shift: 9, hidden: false, overwriteable: true }
    }

    pub fn hidden(blocks: u64) -> Self {
        SimNamespace { blocks, block_shift: 9, hidden: true, overwriteable: true }
    }
}

/// Builder for [`SimPlatform`]; every knob has a sensible default so the
/// common cases read as one-liners.
pub struct SimBuilder {
    cores: u16,
    numa_nodes: u16,
    msi_granted: u16,
    msi_single_address: bool,
    queue_pairs_granted: u16,
    namespaces: Vec<SimNamespace>,
    vector_permutation: Option<Vec<Iv>>,
    aerl: u8,
    timeout_units: u8,
    dstrd: u8,
    max_queue_entries: u16,
    config: HashMap<String, u32>,
    fail_identify_ctrl: bool,
    fail_probe_read: bool,
    lba_num_ranges: u32,
    alloc_fail_after: Option<usize>,
    never_ready: bool,
    no_shutdown_ack: bool,
}

impl SimBuilder {
    fn new() -> Self {
        let host_cores = num_cpus::get().min(64) as u16;
        SimBuilder {
            cores: host_cores,
            numa_nodes: 1,
            msi_granted: host_cores + 1,
            msi_single_address: false,
            queue_pairs_granted: host_cores,
            namespaces: Vec::new(),
            vector_permutation: None,
            aerl: 3,
            timeout_units: 1,
            dstrd: 0,
            max_queue_entries: 4096,
            config: HashMap::new(),
            fail_identify_ctrl: false,
            fail_probe_read: false,
            lba_num_ranges: 0,
            alloc_fail_after: None,
            never_ready: false,
            no_shutdown_ack: false,
        }
    }

    pub fn cores(mut self, cores: u16) -> Self {
        self.cores = cores;
        // Re-derive the dependent defaults unless overridden later.
        self.msi_granted = cores + 1;
        self.queue_pairs_granted = cores;
        self
    }

    pub fn numa_nodes(mut self, nodes: u16) -> Self {
        self.numa_nodes = nodes;
        self
    }

    pub fn msi_granted(mut self, granted: u16) -> Self {
        self.msi_granted = granted;
        self
    }

    pub fn msi_single_address(mut self, same: bool) -> Self {
        self.msi_single_address = same;
        self
    }

    pub fn queue_pairs_granted(mut self, pairs: u16) -> Self {
        self.queue_pairs_granted = pairs;
        self
    }

    pub fn namespace(mut self, ns: SimNamespace) -> Self {
        self.namespaces.push(ns);
        self
    }

    /// Reroute fired vectors: a completion bound to vector `v` fires
    /// `permutation[v]` instead, which is what the learning phase exists
    /// to discover.
    pub fn vector_permutation(mut self, permutation: Vec<Iv>) -> Self {
        self.vector_permutation = Some(permutation);
        self
    }

    pub fn aerl(mut self, aerl: u8) -> Self {
        self.aerl = aerl;
        self
    }

    pub fn config_key(mut self, key: &str, value: u32) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn fail_identify_ctrl(mut self) -> Self {
        self.fail_identify_ctrl = true;
        self
    }

    pub fn fail_probe_read(mut self) -> Self {
        self.fail_probe_read = true;
        self
    }

    pub fn lba_num_ranges(mut self, num: u32) -> Self {
        self.lba_num_ranges = num;
        self
    }

    /// Fail every contiguous allocation after the first `n` succeed.
    pub fn alloc_fail_after(mut self, n: usize) -> Self {
        self.alloc_fail_after = Some(n);
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    pub fn no_shutdown_ack(mut self) -> Self {
        self.no_shutdown_ack = true;
        self
    }

    pub fn build(self) -> SimPlatform {
        SimPlatform {
            state: Mutex::new(SimState {
                cc: 0,
                csts: 0,
                aqa: 0,
                asq: 0,
                acq: 0,
                intms: 0,
                admin: None,
                io_sqs: HashMap::new(),
                io_cqs: HashMap::new(),
                parked_aers: Vec::new(),
                fired: VecDeque::new(),
                allocations: 0,
                current_core: 0,
                builder: self,
            }),
        }
    }
}

struct DevAdminQueues {
    sq_phys: u64,
    sq_entries: u16,
    sq_head: u16,
    cq_phys: u64,
    cq_entries: u16,
    cq_tail: u16,
    cq_phase: u16,
}

struct DevSq {
    phys: u64,
    entries: u16,
    head: u16,
    cqid: u16,
}

struct DevCq {
    phys: u64,
    entries: u16,
    iv: Iv,
    tail: u16,
    phase: u16,
}

struct SimState {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    intms: u32,
    admin: Option<DevAdminQueues>,
    io_sqs: HashMap<u16, DevSq>,
    io_cqs: HashMap<u16, DevCq>,
    parked_aers: Vec<u16>,
    fired: VecDeque<Iv>,
    allocations: usize,
    current_core: u16,
    builder: SimBuilder,
}

/// Simulated platform plus controller device model.
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    pub fn builder() -> SimBuilder {
        SimBuilder::new()
    }

    /// Pop the next fired interrupt vector, if any.
    pub fn take_interrupt(&self) -> Option<Iv> {
        self.state.lock().fired.pop_front()
    }

    /// Number of AER commands the model is holding open.
    pub fn parked_aers(&self) -> usize {
        self.state.lock().parked_aers.len()
    }

    /// Which core `current_core` reports.
    pub fn set_current_core(&self, core: u16) {
        self.state.lock().current_core = core;
    }

    /// IO queue pairs currently live on the device side.
    pub fn device_queue_pairs(&self) -> usize {
        self.state.lock().io_sqs.len()
    }

    /// Vector a device-side completion queue is bound to.
    pub fn device_cq_vector(&self, qid: u16) -> Option<Iv> {
        self.state.lock().io_cqs.get(&qid).map(|cq| cq.iv)
    }
}

impl SimState {
    fn cap(&self) -> u64 {
        (self.builder.max_queue_entries as u64 - 1)
            | ((self.builder.timeout_units as u64) << 24)
            | ((self.builder.dstrd as u64) << 32)
    }

    fn permuted(&self, iv: Iv) -> Iv {
        match &self.builder.vector_permutation {
            Some(p) => p.get(iv as usize).copied().unwrap_or(iv),
            None => iv,
        }
    }

    fn write_cc(&mut self, value: u32) {
        let was_enabled = self.cc & CC_EN != 0;
        let enabled = value & CC_EN != 0;
        self.cc = value;

        if enabled && !was_enabled {
            if !self.builder.never_ready {
                self.csts |= CSTS_RDY;
            }
            self.admin = Some(DevAdminQueues {
                sq_phys: self.asq,
                sq_entries: (self.aqa & 0xFFF) as u16 + 1,
                sq_head: 0,
                cq_phys: self.acq,
                cq_entries: ((self.aqa >> 16) & 0xFFF) as u16 + 1,
                cq_tail: 0,
                cq_phase: 1,
            });
        } else if !enabled && was_enabled {
            // Reset: the controller forgets all queues.
            self.csts &= !CSTS_RDY;
            self.admin = None;
            self.io_sqs.clear();
            self.io_cqs.clear();
            self.parked_aers.clear();
        }

        if value & CC_SHN_MASK != 0 && !self.builder.no_shutdown_ack {
            self.csts |= CSTS_SHST_COMPLETE;
        }
    }

    fn doorbell(&mut self, offset: usize) -> Option<(u16, bool)> {
        let stride = 4usize << self.builder.dstrd;
        let index = (offset - DOORBELL_BASE) / stride;
        Some(((index / 2) as u16, index % 2 == 1))
    }

    fn ring_sq(&mut self, qid: u16, new_tail: u32) {
        if qid == 0 {
            self.ring_admin_sq(new_tail as u16);
        } else {
            self.ring_io_sq(qid, new_tail as u16);
        }
    }

    fn ring_admin_sq(&mut self, tail: u16) {
        let (sq_phys, entries, mut head) = match &self.admin {
            Some(admin) => (admin.sq_phys, admin.sq_entries, admin.sq_head),
            None => return,
        };
        while head != tail % entries {
            let cmd = unsafe {
                ((sq_phys + head as u64 * mem::size_of::<NvmeCmd>() as u64) as *const NvmeCmd)
                    .read_volatile()
            };
            head = (head + 1) % entries;
            if let Some(admin) = self.admin.as_mut() {
                admin.sq_head = head;
            }
            self.exec_admin(cmd, head);
        }
    }

    fn ring_io_sq(&mut self, qid: u16, tail: u16) {
        loop {
            let (cmd, head, cqid) = {
                let sq = match self.io_sqs.get_mut(&qid) {
                    Some(sq) => sq,
                    None => return,
                };
                if sq.head == tail % sq.entries {
                    return;
                }
                let cmd = unsafe {
                    ((sq.phys + sq.head as u64 * mem::size_of::<NvmeCmd>() as u64)
                        as *const NvmeCmd)
                        .read_volatile()
                };
                sq.head = (sq.head + 1) % sq.entries;
                (cmd, sq.head, sq.cqid)
            };
            self.exec_io(qid, cqid, cmd, head);
        }
    }

    fn exec_admin(&mut self, cmd: NvmeCmd, sq_head: u16) {
        let mut cdw0 = 0u32;
        let mut sc = 0u8;
        match cmd.opcode {
            admin_opcode::IDENTIFY => match cmd.cdw10 & 0xFF {
                1 => {
                    if self.builder.fail_identify_ctrl {
                        sc = SC_INTERNAL_ERROR;
                    } else {
                        let mut id = IdentifyController::zeroed();
                        id.vid = 0x8086;
                        id.nn = self.builder.namespaces.len() as u32;
                        id.aerl = self.builder.aerl;
                        id.sqes = 0x66;
                        id.cqes = 0x44;
                        unsafe { write_payload(cmd.prp1, &id) };
                    }
                }
                0 => {
                    let nsid = cmd.nsid;
                    if nsid == 0 || nsid as usize > self.builder.namespaces.len() {
                        sc = SC_INVALID_NAMESPACE;
                    } else {
                        let ns = self.builder.namespaces[nsid as usize - 1];
                        let mut id = IdentifyNamespace::zeroed();
                        id.nsze = ns.blocks;
                        id.ncap = ns.blocks;
                        id.nuse = ns.blocks;
                        id.lbaf[0] = (ns.block_shift as u32) << 16;
                        unsafe { write_payload(cmd.prp1, &id) };
                    }
                }
                _ => sc = SC_INVALID_FIELD,
            },
            admin_opcode::SET_FEATURES => match (cmd.cdw10 & 0xFF) as u8 {
                feature::INTERRUPT_COALESCING => {}
                feature::NUMBER_OF_QUEUES => {
                    let granted = self.builder.queue_pairs_granted.max(1) as u32;
                    cdw0 = (granted - 1) | ((granted - 1) << 16);
                }
                feature::LBA_RANGE_TYPE => {}
                _ => sc = SC_INVALID_FIELD,
            },
            admin_opcode::GET_FEATURES => match (cmd.cdw10 & 0xFF) as u8 {
                feature::LBA_RANGE_TYPE => {
                    let nsid = cmd.nsid;
                    if nsid == 0 || nsid as usize > self.builder.namespaces.len() {
                        sc = SC_INVALID_NAMESPACE;
                    } else {
                        let ns = self.builder.namespaces[nsid as usize - 1];
                        let mut entry = LbaRangeEntry::zeroed();
                        entry.range_type = LBA_TYPE_FILESYSTEM;
                        if ns.hidden {
                            entry.attributes |= LBA_RANGE_ATTR_HIDDEN;
                        }
                        if ns.overwriteable {
                            entry.attributes |= LBA_RANGE_ATTR_OVERWRITEABLE;
                        }
                        entry.nlb = ns.blocks;
                        unsafe { write_payload(cmd.prp1, &entry) };
                        cdw0 = self.builder.lba_num_ranges & 0x3F;
                    }
                }
                _ => sc = SC_INVALID_FIELD,
            },
            admin_opcode::CREATE_IO_CQ => {
                let qid = (cmd.cdw10 & 0xFFFF) as u16;
                let entries = (cmd.cdw10 >> 16) as u16 + 1;
                let iv = (cmd.cdw11 >> 16) as Iv;
                self.io_cqs
                    .insert(qid, DevCq { phys: cmd.prp1, entries, iv, tail: 0, phase: 1 });
            }
            admin_opcode::CREATE_IO_SQ => {
                let qid = (cmd.cdw10 & 0xFFFF) as u16;
                let entries = (cmd.cdw10 >> 16) as u16 + 1;
                let cqid = (cmd.cdw11 >> 16) as u16;
                if self.io_cqs.contains_key(&cqid) {
                    self.io_sqs.insert(qid, DevSq { phys: cmd.prp1, entries, head: 0, cqid });
                } else {
                    sc = SC_INVALID_FIELD;
                }
            }
            admin_opcode::DELETE_IO_CQ => {
                let qid = (cmd.cdw10 & 0xFFFF) as u16;
                if self.io_cqs.remove(&qid).is_none() {
                    sc = SC_INVALID_FIELD;
                }
            }
            admin_opcode::DELETE_IO_SQ => {
                let qid = (cmd.cdw10 & 0xFFFF) as u16;
                if self.io_sqs.remove(&qid).is_none() {
                    sc = SC_INVALID_FIELD;
                }
            }
            admin_opcode::ASYNC_EVENT_REQUEST => {
                // Held open until an event occurs; no completion now.
                self.parked_aers.push(cmd.cid);
                return;
            }
            _ => sc = SC_INVALID_OPCODE,
        }
        self.post_admin_completion(cmd.cid, sq_head, cdw0, sc);
    }

    fn post_admin_completion(&mut self, cid: u16, sq_head: u16, cdw0: u32, sc: u8) {
        let admin = match self.admin.as_mut() {
            Some(admin) => admin,
            None => return,
        };
        let comp = NvmeComp {
            cdw0,
            _rsvd: 0,
            sq_head,
            sq_id: 0,
            cid,
            status: ((sc as u16) << 1) | admin.cq_phase,
        };
        unsafe { write_comp(admin.cq_phys, admin.cq_tail, comp) };
        admin.cq_tail += 1;
        if admin.cq_tail == admin.cq_entries {
            admin.cq_tail = 0;
            admin.cq_phase ^= 1;
        }
        let fired = self.permuted(0);
        trace!("sim: admin completion cid {} sc {:#x}, vector {}", cid, sc, fired);
        self.fired.push_back(fired);
    }

    fn exec_io(&mut self, sq_id: u16, cqid: u16, cmd: NvmeCmd, sq_head: u16) {
        let sc = match cmd.opcode {
            nvm_opcode::READ | nvm_opcode::WRITE | nvm_opcode::FLUSH => {
                if self.builder.fail_probe_read {
                    SC_INTERNAL_ERROR
                } else if cmd.nsid == 0 || cmd.nsid as usize > self.builder.namespaces.len() {
                    SC_INVALID_NAMESPACE
                } else {
                    0
                }
            }
            _ => SC_INVALID_OPCODE,
        };

        let (phys, tail, phase, iv) = {
            let cq = match self.io_cqs.get_mut(&cqid) {
                Some(cq) => cq,
                None => return,
            };
            let snapshot = (cq.phys, cq.tail, cq.phase, cq.iv);
            cq.tail += 1;
            if cq.tail == cq.entries {
                cq.tail = 0;
                cq.phase ^= 1;
            }
            snapshot
        };

        let comp = NvmeComp {
            cdw0: 0,
            _rsvd: 0,
            sq_head,
            sq_id,
            cid: cmd.cid,
            status: ((sc as u16) << 1) | phase,
        };
        unsafe { write_comp(phys, tail, comp) };
        let fired = self.permuted(iv);
        trace!("sim: io completion on cq {} cid {}, vector {}", cqid, cmd.cid, fired);
        self.fired.push_back(fired);
    }
}

unsafe fn write_payload<T>(phys: u64, value: &T) {
    core::ptr::copy_nonoverlapping(
        value as *const T as *const u8,
        phys as *mut u8,
        mem::size_of::<T>(),
    );
}

unsafe fn write_comp(cq_phys: u64, slot: u16, comp: NvmeComp) {
    ((cq_phys + slot as u64 * mem::size_of::<NvmeComp>() as u64) as *mut NvmeComp)
        .write_volatile(comp);
}

impl Platform for SimPlatform {
    fn read_reg32(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        match offset {
            REG_CAP_LO => state.cap() as u32,
            REG_CAP_HI => (state.cap() >> 32) as u32,
            REG_CC => state.cc,
            REG_CSTS => state.csts,
            REG_AQA => state.aqa,
            REG_INTMS | REG_INTMC => state.intms,
            _ => 0,
        }
    }

    fn write_reg32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        match offset {
            REG_CC => state.write_cc(value),
            REG_AQA => state.aqa = value,
            REG_ASQ_LO => state.asq = (state.asq & !0xFFFF_FFFF) | value as u64,
            REG_ASQ_HI => state.asq = (state.asq & 0xFFFF_FFFF) | ((value as u64) << 32),
            REG_ACQ_LO => state.acq = (state.acq & !0xFFFF_FFFF) | value as u64,
            REG_ACQ_HI => state.acq = (state.acq & 0xFFFF_FFFF) | ((value as u64) << 32),
            REG_INTMS => state.intms |= value,
            REG_INTMC => state.intms &= !value,
            offset if offset >= DOORBELL_BASE => {
                if let Some((qid, is_cq_head)) = state.doorbell(offset) {
                    if !is_cq_head {
                        state.ring_sq(qid, value);
                    }
                }
            }
            _ => {}
        }
    }

    fn alloc_contiguous(&self, len: usize, _numa_node: u16) -> Result<DmaRegion> {
        let mut state = self.state.lock();
        if let Some(limit) = state.builder.alloc_fail_after {
            if state.allocations >= limit {
                return Err(Error::InsufficientResources("simulated allocation failure"));
            }
        }
        state.allocations += 1;
        Ok(DmaRegion::zeroed_identity(len))
    }

    fn highest_numa_node(&self) -> u16 {
        self.state.lock().builder.numa_nodes - 1
    }

    fn node_affinity(&self, node: u16) -> Result<GroupAffinity> {
        let state = self.state.lock();
        let nodes = state.builder.numa_nodes;
        if node >= nodes {
            return Err(Error::InvalidParameter("NUMA node"));
        }
        let cores = state.builder.cores;
        let base = cores / nodes;
        let extra = cores % nodes;
        let count = base + if node < extra { 1 } else { 0 };
        let start: u16 = (0..node).map(|n| base + if n < extra { 1 } else { 0 }).sum();
        let mask = if count == 64 { u64::MAX } else { ((1u64 << count) - 1) << start };
        Ok(GroupAffinity { group: 0, mask })
    }

    fn msi_info(&self, msg_id: u16) -> Option<MsiInfo> {
        let state = self.state.lock();
        if msg_id < state.builder.msi_granted {
            let address = if state.builder.msi_single_address {
                0xFEE0_0000
            } else {
                0xFEE0_0000 + msg_id as u64 * 0x10
            };
            Some(MsiInfo { address, data: 0x4000 + msg_id as u32 })
        } else {
            None
        }
    }

    fn current_core(&self) -> ProcessorNumber {
        ProcessorNumber { group: 0, number: self.state.lock().current_core }
    }

    fn stall_us(&self, _micros: u32) {}

    fn config_u32(&self, key: &str) -> Option<u32> {
        self.state.lock().builder.config.get(key).copied()
    }
}
