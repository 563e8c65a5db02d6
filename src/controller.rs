// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Controller context: the root aggregate tying the register gateway,
//! resource map, queue set, and bring-up state machine together.
//!
//! Bring-up is cooperative and single-threaded: `start` resets and
//! enables the controller and issues the first admin command, then each
//! completion delivered through [`ControllerContext::deliver_completion`]
//! advances the machine and issues the next command, until the machine
//! reaches `StartComplete` or collapses into `Failed`.

use core::mem;

use log::{debug, info, trace, warn};

use crate::bringup::{StartState, StateMachine, DESIRED_AERS};
use crate::cmd::{admin_opcode, feature, NvmeCmd, NvmeComp};
use crate::config::DriverConfig;
use crate::error::{Error, Result, StartFailure};
use crate::identify::{
    IdentifyController, IdentifyNamespace, LbaRangeEntry, NamespaceEntry, NsVisibility,
    SlotStatus, LBA_TYPE_FILESYSTEM,
};
use crate::platform::{page_align, Platform, AFFINITY_MASK_WIDTH, PAGE_SIZE};
use crate::queue::{alloc_queue_memory, build_queue_pair, QueueSet};
use crate::regs::{Capabilities, Registers, SHN_NORMAL, SHST_COMPLETE};
use crate::topology::{InterruptKind, ResourceMap};
use crate::{CqId, Iv, SqId};

/// Stall quantum for register polling, microseconds.
const STATE_STALL_US: u32 = 1000;

/// Slot context markers for commands the core itself issues.
pub(crate) const CTX_BRINGUP: u64 = 1;
pub(crate) const CTX_AER: u64 = 2;
pub(crate) const CTX_LEARN: u64 = 3;

pub struct ControllerContext<P: Platform> {
    platform: P,
    config: DriverConfig,
    res_map: ResourceMap,
    queues: QueueSet,
    sm: StateMachine,
    identify_ctrl: Box<IdentifyController>,
    luns: Vec<NamespaceEntry>,
    visible_luns: u32,
    cap: Capabilities,
    timeout_us: u32,
    dstrd: u32,
    prp_list_size: usize,
    scratch_offset: usize,
    probe_in_flight: bool,
}

impl<P: Platform> ControllerContext<P> {
    /// Build the context: enumerate topology and interrupts, size the
    /// admin queue pair, and allocate the state machine scratch page.
    /// The controller itself is untouched until [`Self::start`].
    pub fn new(platform: P, config: DriverConfig) -> Result<Self> {
        let cap = Registers::new(&platform).capabilities();
        let timeout_us = cap.timeout_units() * 500_000;
        let dstrd = cap.doorbell_stride();
        let prp_list_size = config.prp_list_size();

        let mut res_map = ResourceMap::enumerate_numa_cores(&platform)?;
        res_map.enumerate_msi_messages(&platform);

        let home_node = res_map.cores.first().map(|c| c.numa_node).unwrap_or(0);

        // Two pages so the 4 KiB working window is always page aligned.
        let scratch = platform.alloc_contiguous(2 * PAGE_SIZE, home_node)?;
        let scratch_offset = page_align(scratch.as_ptr() as usize) - scratch.as_ptr() as usize;

        let ad_entries = config.ad_queue_entries.min(cap.max_queue_entries());
        let mem = alloc_queue_memory(&platform, ad_entries, home_node, prp_list_size)?;
        let mut queues = QueueSet::default();
        queues.num_ad_entries_allocated = mem.entries;
        let (sub, cpl) = build_queue_pair(mem, 0, true, 0, dstrd, prp_list_size);
        queues.sub.push(sub);
        queues.cpl.push(cpl);

        let luns = (0..config.namespaces).map(|_| NamespaceEntry::zeroed()).collect();

        Ok(ControllerContext {
            platform,
            config,
            res_map,
            queues,
            sm: StateMachine::new(scratch),
            identify_ctrl: Box::new(IdentifyController::zeroed()),
            luns,
            visible_luns: 0,
            cap,
            timeout_us,
            dstrd,
            prp_list_size,
            scratch_offset,
            probe_in_flight: false,
        })
    }

    pub fn start_state(&self) -> StartState {
        self.sm.state
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn resource_map(&self) -> &ResourceMap {
        &self.res_map
    }

    pub fn queue_set(&self) -> &QueueSet {
        &self.queues
    }

    pub fn identify_controller(&self) -> &IdentifyController {
        &self.identify_ctrl
    }

    pub fn namespaces(&self) -> &[NamespaceEntry] {
        &self.luns
    }

    pub fn visible_luns(&self) -> u32 {
        self.visible_luns
    }

    /// Queue pair serving the calling processor.
    pub fn current_core_queues(&self) -> Result<(SqId, CqId)> {
        let pn = self.platform.current_core();
        let core = pn.group * AFFINITY_MASK_WIDTH + pn.number;
        self.res_map.map_core_to_queue(core, self.sm.learning_cores)
    }

    /// Reset the controller, program the admin queue registers, enable
    /// it, and issue the first bring-up command.
    pub fn start(&mut self) -> Result<()> {
        let regs = Registers::new(&self.platform);

        self.sm.advance(StartState::WaitOnRdy);
        regs.reset();
        if self.wait_ready(false).is_err() {
            self.sm.fatal(StartFailure::UNKNOWN_STATE);
            return Err(Error::Timeout("CSTS.RDY clear after reset"));
        }

        let asq = self.queues.sub_queue(0)?.ring_phys();
        let acq = self.queues.cpl_queue(0)?.ring_phys();
        let entries = self.queues.num_ad_entries_allocated as u32;
        regs.enable(asq, acq, entries, entries);

        if self.wait_ready(true).is_err() {
            self.sm.fatal(StartFailure::UNKNOWN_STATE);
            return Err(Error::Timeout("CSTS.RDY set after enable"));
        }

        info!("controller enabled, starting bring-up");
        self.sm.advance(StartState::WaitOnIdentifyCtrl);
        self.issue_next()
    }

    /// Drive bring-up by polling completions, for hosts without working
    /// interrupt delivery (crash-dump path) and for tests.
    pub fn start_polled(&mut self) -> Result<StartState> {
        self.start()?;
        while !self.sm.is_terminal() {
            self.process_polled()?;
            if self.sm.is_terminal() {
                break;
            }
            self.platform.stall_us(STATE_STALL_US);
            if self.sm.check_stalled() {
                self.sm.fatal(StartFailure::UNKNOWN_STATE);
                return Err(Error::Timeout("bring-up state stalled"));
            }
        }
        Ok(self.sm.state)
    }

    /// Harvest every queue without an interrupt context. Learning treats
    /// each completion as served by its queue's assigned vector.
    pub fn process_polled(&mut self) -> Result<()> {
        self.drain_admin_queue()?;
        for qid in 1..self.queues.cpl.len() as CqId {
            let observed = self.queues.cpl_queue(qid)?.msg_vector;
            self.drain_io_queue(qid, observed)?;
        }
        self.issue_if_idle()
    }

    /// Interrupt-side entry point: harvest completions and advance the
    /// bring-up machine. `observed_iv` is the message vector that fired,
    /// which the learning phase records as the servicing vector.
    pub fn deliver_completion(&mut self, observed_iv: Iv) -> Result<()> {
        self.drain_admin_queue()?;
        for qid in 1..self.queues.cpl.len() as CqId {
            self.drain_io_queue(qid, observed_iv)?;
        }
        self.issue_if_idle()
    }

    fn drain_admin_queue(&mut self) -> Result<()> {
        loop {
            let comp = match self.queues.cpl_queue(0)?.pop() {
                Some(comp) => comp,
                None => break,
            };
            self.admin_completion(comp)?;
            let cq = self.queues.cpl_queue(0)?;
            let head = cq.head();
            let doorbell = cq.doorbell_offset();
            Registers::new(&self.platform).ring_doorbell(doorbell, head as u32);
        }
        Ok(())
    }

    fn drain_io_queue(&mut self, qid: CqId, observed_iv: Iv) -> Result<()> {
        loop {
            let comp = match self.queues.cpl_queue(qid)?.pop() {
                Some(comp) => comp,
                None => break,
            };
            self.io_completion(comp, observed_iv)?;
            let cq = self.queues.cpl_queue(qid)?;
            let head = cq.head();
            let doorbell = cq.doorbell_offset();
            Registers::new(&self.platform).ring_doorbell(doorbell, head as u32);
        }
        Ok(())
    }

    fn issue_if_idle(&mut self) -> Result<()> {
        if self.sm.is_terminal()
            || self.sm.state == StartState::WaitOnRdy
            || self.sm.in_flight.is_some()
            || self.probe_in_flight
        {
            return Ok(());
        }
        self.issue_next()
    }

    /// One arbiter pass: walk synchronous states and fire the single
    /// admin command (or learning probe) the current state calls for.
    fn issue_next(&mut self) -> Result<()> {
        loop {
            match self.sm.state {
                StartState::WaitOnIdentifyCtrl => {
                    self.issue_identify_controller()?;
                    break;
                }
                StartState::WaitOnIdentifyNs => {
                    let nsid = self.sm.identify_ns_fetched + 1;
                    let out_of_slots = (self.sm.visible_ns_examined as usize) >= self.luns.len();
                    if nsid > self.identify_ctrl.nn || out_of_slots {
                        // No (more) namespaces to examine.
                        self.visible_luns = self.sm.visible_ns_examined;
                        self.sm.advance(StartState::WaitOnSetupQueues);
                        continue;
                    }
                    self.issue_identify_namespace(nsid)?;
                    break;
                }
                StartState::WaitOnSetFeatures => {
                    self.issue_next_feature()?;
                    break;
                }
                StartState::WaitOnSetupQueues => {
                    self.setup_io_queues()?;
                    self.complete_resource_map();
                    self.sm.advance(StartState::WaitOnAer);
                    continue;
                }
                StartState::WaitOnAer => {
                    self.issue_aers()?;
                    self.sm.advance(StartState::WaitOnIoCq);
                    continue;
                }
                StartState::WaitOnIoCq => {
                    if self.queues.num_cpl_created == self.queues.num_cpl_allocated {
                        self.sm.advance(StartState::WaitOnIoSq);
                        continue;
                    }
                    self.issue_create_cpl_queue()?;
                    break;
                }
                StartState::WaitOnIoSq => {
                    // On the post-learning rebuild the submission queues
                    // were never deleted, so there may be nothing to do.
                    if self.queues.num_sub_created == self.queues.num_sub_allocated {
                        if self.sm.learning_cores < self.res_map.num_active_cores {
                            self.sm.advance(StartState::WaitOnLearnMapping);
                        } else {
                            info!("bring-up complete");
                            self.sm.advance(StartState::StartComplete);
                        }
                        continue;
                    }
                    self.issue_create_sub_queue()?;
                    break;
                }
                StartState::WaitOnLearnMapping => {
                    self.issue_learning_probe()?;
                    break;
                }
                StartState::WaitOnReSetupQueues => {
                    if self.queues.num_cpl_created == 0 {
                        self.sm.advance(StartState::WaitOnIoCq);
                        continue;
                    }
                    self.issue_delete_cpl_queue()?;
                    break;
                }
                StartState::WaitOnRdy | StartState::StartComplete | StartState::Failed(_) => break,
            }
        }
        Ok(())
    }

    /// Acquire an admin slot, push the command, record it as in flight,
    /// and ring the admin tail doorbell.
    fn submit_admin(&mut self, build: impl FnOnce(u16) -> NvmeCmd) -> Result<()> {
        let sq = self.queues.sub_queue(0)?;
        let handle = sq.acquire(CTX_BRINGUP)?;
        let cmd = build(handle.cmd_id);
        let tail = sq.push(cmd)?;
        let doorbell = sq.doorbell_offset();
        self.sm.track_command(cmd);
        Registers::new(&self.platform).ring_doorbell(doorbell, tail as u32);
        Ok(())
    }

    fn scratch_phys(&self) -> u64 {
        self.sm.data_buffer.phys_at(self.scratch_offset)
    }

    fn zero_scratch(&mut self) {
        let off = self.scratch_offset;
        self.sm.data_buffer.as_mut_slice()[off..off + PAGE_SIZE].fill(0);
    }

    /// Copy an admin payload out of the scratch page into typed storage.
    fn copy_from_scratch<T>(&self, value: &mut T) {
        let len = mem::size_of::<T>().min(PAGE_SIZE);
        let src = &self.sm.data_buffer.as_slice()[self.scratch_offset..];
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), value as *mut T as *mut u8, len);
        }
    }

    fn copy_to_scratch<T>(&mut self, value: &T) {
        let len = mem::size_of::<T>().min(PAGE_SIZE);
        let off = self.scratch_offset;
        let dst = &mut self.sm.data_buffer.as_mut_slice()[off..off + len];
        unsafe {
            core::ptr::copy_nonoverlapping(value as *const T as *const u8, dst.as_mut_ptr(), len);
        }
    }

    fn issue_identify_controller(&mut self) -> Result<()> {
        self.zero_scratch();
        let phys = self.scratch_phys();
        debug!("issuing Identify Controller");
        self.submit_admin(|cid| {
            let mut cmd = NvmeCmd::identify_controller(cid, phys);
            cmd.prepare_prps(phys, mem::size_of::<IdentifyController>());
            cmd
        })
    }

    fn issue_identify_namespace(&mut self, nsid: u32) -> Result<()> {
        self.zero_scratch();
        let phys = self.scratch_phys();
        debug!("issuing Identify Namespace for NSID {}", nsid);
        self.submit_admin(|cid| {
            let mut cmd = NvmeCmd::identify_namespace(cid, nsid, phys);
            cmd.prepare_prps(phys, mem::size_of::<IdentifyNamespace>());
            cmd
        })
    }

    /// Dispatch the next Set/Get Features command: interrupt coalescing
    /// once, then the queue-count negotiation, then per-namespace LBA
    /// range examination.
    fn issue_next_feature(&mut self) -> Result<()> {
        if !self.sm.interrupt_coalescing_set {
            let time = self.config.int_coalescing_time as u8;
            let threshold = self.config.int_coalescing_entries as u8;
            debug!("issuing Set Features: interrupt coalescing {}x100us/{}", time, threshold);
            self.submit_admin(|cid| NvmeCmd::set_features_int_coalescing(cid, time, threshold))
        } else if self.queues.num_sub_alloc_from_adapter == 0 {
            let want =
                if self.config.dump_mode { 1 } else { self.res_map.num_active_cores.max(1) };
            debug!("issuing Set Features: number of queues = {}", want);
            self.submit_admin(|cid| NvmeCmd::set_features_num_queues(cid, want, want))
        } else {
            self.issue_lba_range_access()
        }
    }

    /// Get (or, when configuration is required, Set) the first LBA Range
    /// entry of the namespace under examination.
    fn issue_lba_range_access(&mut self) -> Result<()> {
        let nsid = self.sm.current_nsid;
        if nsid == 0 || nsid > self.identify_ctrl.nn {
            self.sm.fatal(StartFailure::LBA_RANGE_CHK);
            return Err(Error::InvalidParameter("LBA range NSID"));
        }

        let phys = self.scratch_phys();
        if self.sm.config_lba_range_needed {
            let mut entry = LbaRangeEntry::zeroed();
            entry.range_type = LBA_TYPE_FILESYSTEM;
            entry.attributes = crate::identify::LBA_RANGE_ATTR_OVERWRITEABLE;
            let lun = self.sm.visible_ns_examined as usize;
            entry.nlb = self.luns.get(lun).map(|l| l.identify.nsze).unwrap_or(0);
            self.zero_scratch();
            self.copy_to_scratch(&entry);
            debug!("issuing Set Features: LBA range for NSID {}", nsid);
            self.submit_admin(|cid| {
                let mut cmd = NvmeCmd::set_features_lba_range(cid, nsid, 0, phys);
                cmd.prepare_prps(phys, mem::size_of::<LbaRangeEntry>());
                cmd
            })
        } else {
            self.zero_scratch();
            debug!("issuing Get Features: LBA range for NSID {}", nsid);
            self.submit_admin(|cid| {
                let mut cmd = NvmeCmd::get_features_lba_range(cid, nsid, phys);
                cmd.prepare_prps(phys, mem::size_of::<LbaRangeEntry>());
                cmd
            })
        }
    }

    /// Issue as many Asynchronous Event Requests as the controller
    /// allows, up to the desired count. AER completions never re-enter
    /// the bring-up machine.
    fn issue_aers(&mut self) -> Result<()> {
        let limit = self.identify_ctrl.aerl as u16 + 1;
        let mut to_issue =
            (DESIRED_AERS as u16).min(limit.saturating_sub(self.sm.num_aers_issued as u16));

        while to_issue > 0 {
            let sq = self.queues.sub_queue(0)?;
            let handle = match sq.acquire(CTX_AER) {
                Ok(handle) => handle,
                Err(_) => {
                    warn!("AER issue stopped early, {} outstanding", self.sm.num_aers_issued);
                    break;
                }
            };
            let cmd = NvmeCmd::async_event_request(handle.cmd_id);
            let tail = match sq.push(cmd) {
                Ok(tail) => tail,
                Err(err) => {
                    self.sm.fatal(StartFailure::AER);
                    return Err(err);
                }
            };
            let doorbell = sq.doorbell_offset();
            Registers::new(&self.platform).ring_doorbell(doorbell, tail as u32);
            self.sm.num_aers_issued += 1;
            to_issue -= 1;
        }

        info!("{} AER(s) outstanding", self.sm.num_aers_issued);
        Ok(())
    }

    /// Vector a completion queue should carry: 0 whenever the vectors are
    /// shared, otherwise the owning core's (possibly learned) vector.
    fn cq_msg_vector(&self, qid: CqId) -> Iv {
        if self.res_map.interrupts.granted() <= self.res_map.num_active_cores {
            0
        } else {
            self.res_map.cores.get(qid as usize - 1).map(|c| c.msg_vector).unwrap_or(0)
        }
    }

    fn issue_create_cpl_queue(&mut self) -> Result<()> {
        let qid = self.queues.num_cpl_created + 1;
        let iv = self.cq_msg_vector(qid);
        {
            let cq = self.queues.cpl_queue_mut(qid)?;
            cq.set_msg_vector(iv);
            cq.reset();
        }
        let cq = self.queues.cpl_queue(qid)?;
        let phys = cq.ring_phys();
        let size = self.queues.num_io_entries_allocated - 1;
        debug!("issuing Create IO CQ {} on vector {}", qid, iv);
        self.submit_admin(|cid| NvmeCmd::create_io_cq(cid, qid, size, phys, iv))
    }

    fn issue_create_sub_queue(&mut self) -> Result<()> {
        let qid = self.queues.num_sub_created + 1;
        let sq = self.queues.sub_queue(qid)?;
        let phys = sq.ring_phys();
        let cqid = sq.cpl_queue_id;
        let size = self.queues.num_io_entries_allocated - 1;
        debug!("issuing Create IO SQ {} -> CQ {}", qid, cqid);
        self.submit_admin(|cid| NvmeCmd::create_io_sq(cid, qid, size, phys, cqid))
    }

    fn issue_delete_cpl_queue(&mut self) -> Result<()> {
        let qid = self.queues.num_cpl_created;
        debug!("issuing Delete IO CQ {}", qid);
        self.submit_admin(|cid| NvmeCmd::delete_io_cq(cid, qid))
    }

    /// One-block probe read on the queue pair under learning, so the
    /// servicing vector can be observed. Probe trouble is not fatal:
    /// learning is abandoned and bring-up completes with the provisional
    /// mapping.
    fn issue_learning_probe(&mut self) -> Result<()> {
        let core = self.sm.learning_cores;
        let (sq_id, _) = self.res_map.map_core_to_queue(
            self.res_map.cores.get(core as usize).map(|c| c.core).unwrap_or(0),
            core,
        )?;
        let nsid = self
            .luns
            .iter()
            .find(|l| l.slot_status == SlotStatus::Online)
            .map(|l| l.namespace_id)
            .unwrap_or(1);
        let phys = self.scratch_phys();

        let outcome = (|| -> Result<()> {
            let sq = self.queues.sub_queue(sq_id)?;
            let handle = sq.acquire(CTX_LEARN)?;
            let cmd = NvmeCmd::io_read(handle.cmd_id, nsid, 0, 1, phys, 0);
            let tail = sq.push(cmd)?;
            let doorbell = sq.doorbell_offset();
            Registers::new(&self.platform).ring_doorbell(doorbell, tail as u32);
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                trace!("learning probe for core slot {} on queue {}", core, sq_id);
                self.probe_in_flight = true;
            }
            Err(err) => {
                warn!("learning probe could not be issued ({}), skipping learning", err);
                self.sm.learning_cores = self.res_map.num_active_cores;
                self.sm.advance(StartState::StartComplete);
            }
        }
        Ok(())
    }

    /// Allocate and carve the IO queue memory, mapping every active core
    /// to a queue pair. Queue ids cycle when the adapter granted fewer
    /// pairs than there are cores. Failing the very first allocation is
    /// fatal; failing a later one falls back to a single shared pair.
    fn setup_io_queues(&mut self) -> Result<()> {
        let granted =
            self.queues.num_sub_alloc_from_adapter.min(self.queues.num_cpl_alloc_from_adapter);
        if granted == 0 {
            self.sm.fatal(StartFailure::QUEUE_ALLOC);
            return Err(Error::InsufficientResources("adapter granted no IO queues"));
        }
        let target = if self.config.dump_mode {
            1
        } else {
            granted.min(self.res_map.num_active_cores)
        };
        let io_entries = self.config.io_queue_entries.min(self.cap.max_queue_entries());

        let mut qid: u16 = 0;
        let mut fell_back = false;

        'nodes: for node_idx in 0..self.res_map.numa_nodes.len() {
            let node = self.res_map.numa_nodes[node_idx];
            let base = node.group * AFFINITY_MASK_WIDTH;
            for core_num in node.first_core..=node.last_core {
                if (node.mask >> (core_num - base)) & 1 == 0 {
                    continue;
                }

                qid = if qid + 1 > target { 1 } else { qid + 1 };

                if self.queues.num_sub_allocated < qid {
                    match alloc_queue_memory(
                        &self.platform,
                        io_entries,
                        node.node,
                        self.prp_list_size,
                    ) {
                        Ok(mem) => {
                            self.queues.num_io_entries_allocated = mem.entries;
                            let shared = target < self.res_map.num_active_cores
                                || self.config.dump_mode;
                            let (sub, cpl) = build_queue_pair(
                                mem,
                                qid,
                                shared,
                                0,
                                self.dstrd,
                                self.prp_list_size,
                            );
                            self.queues.sub.push(sub);
                            self.queues.cpl.push(cpl);
                            self.queues.num_sub_allocated += 1;
                            self.queues.num_cpl_allocated += 1;
                        }
                        Err(err) => {
                            if qid == 1 {
                                self.sm.fatal(StartFailure::QUEUE_ALLOC);
                                return Err(err);
                            }
                            warn!("IO queue {} allocation failed, sharing queue 1", qid);
                            fell_back = true;
                            break 'nodes;
                        }
                    }
                }

                if let Some(entry) = self.res_map.core_mut(core_num) {
                    entry.sub_queue = qid;
                    entry.cpl_queue = qid;
                }
                debug!("core {} -> queue {}", core_num, qid);
            }
        }

        if fell_back {
            // Free everything but the first pair, reverse order.
            while self.queues.num_sub_allocated > 1 {
                self.queues.sub.pop();
                self.queues.cpl.pop();
                self.queues.num_sub_allocated -= 1;
                self.queues.num_cpl_allocated -= 1;
            }
            self.queues.sub[1].shared = true;
            self.queues.cpl[1].shared = true;
            for entry in self.res_map.cores.iter_mut() {
                entry.sub_queue = 1;
                entry.cpl_queue = 1;
            }
        }

        info!(
            "IO queues: {} pair(s) allocated for {} core(s)",
            self.queues.num_sub_allocated, self.res_map.num_active_cores
        );
        Ok(())
    }

    /// Finish the resource mapping table and decide whether the vector
    /// learning phase has anything to learn.
    fn complete_resource_map(&mut self) {
        self.res_map.complete();

        let per_core_vectors =
            self.res_map.interrupts.granted() > self.res_map.num_active_cores;
        let per_core_queues =
            self.queues.num_sub_allocated == self.res_map.num_active_cores;
        if self.config.dump_mode || !(per_core_vectors && per_core_queues) {
            self.sm.learning_cores = self.res_map.num_active_cores;
        }
    }

    /// Completion of a command on the admin queue.
    fn admin_completion(&mut self, comp: NvmeComp) -> Result<()> {
        let sq = self.queues.sub_queue(0)?;
        let context = sq.release(comp.cid);
        sq.update_head(comp.sq_head);

        match context {
            CTX_AER => {
                // Event payload handling (log pages) lives outside the
                // core; the long-lived request is simply accounted for.
                info!("asynchronous event reported: cdw0 {:#x}", comp.cdw0);
                self.sm.num_aers_issued = self.sm.num_aers_issued.saturating_sub(1);
                Ok(())
            }
            CTX_BRINGUP => {
                let cmd = self
                    .sm
                    .complete_command()
                    .ok_or(Error::InvalidParameter("completion without command"))?;
                self.init_callback(cmd, comp);
                Ok(())
            }
            other => {
                warn!("admin completion with unknown context {:#x}", other);
                Ok(())
            }
        }
    }

    /// Completion of a command on an IO queue; during bring-up the only
    /// IO commands are learning probes.
    fn io_completion(&mut self, comp: NvmeComp, observed_iv: Iv) -> Result<()> {
        let sq = self.queues.sub_queue(comp.sq_id)?;
        let context = sq.release(comp.cid);
        sq.update_head(comp.sq_head);

        match context {
            CTX_LEARN => {
                self.probe_in_flight = false;
                self.learn_completion(comp, observed_iv);
                Ok(())
            }
            other => {
                trace!("io completion, context {:#x}, status sc {:#x}", other, comp.sc());
                Ok(())
            }
        }
    }

    /// The state-machine half of the init completion callback.
    fn init_callback(&mut self, cmd: NvmeCmd, comp: NvmeComp) {
        match self.sm.state {
            StartState::WaitOnIdentifyCtrl => {
                if comp.is_ok() {
                    let mut id = IdentifyController::zeroed();
                    self.copy_from_scratch(&mut id);
                    info!("controller identified: {} namespace(s), AERL {}", id.nn, id.aerl);
                    *self.identify_ctrl = id;
                    self.sm.advance(StartState::WaitOnIdentifyNs);
                } else {
                    self.sm.fatal(StartFailure::IDENTIFY_CTRL);
                }
            }
            StartState::WaitOnIdentifyNs => {
                if comp.is_ok() {
                    let lun = self.sm.visible_ns_examined as usize;
                    let mut identify = IdentifyNamespace::zeroed();
                    self.copy_from_scratch(&mut identify);
                    self.sm.identify_ns_fetched += 1;

                    let entry = &mut self.luns[lun];
                    entry.identify = identify;
                    entry.namespace_id = self.sm.identify_ns_fetched;
                    self.sm.current_nsid = self.sm.identify_ns_fetched;

                    self.sm.advance(StartState::WaitOnSetFeatures);
                } else {
                    self.sm.fatal(StartFailure::IDENTIFY_NS);
                }
            }
            StartState::WaitOnSetFeatures => self.set_features_completion(cmd, comp),
            StartState::WaitOnIoCq => {
                if comp.is_ok() {
                    self.queues.num_cpl_created += 1;
                    if self.queues.num_cpl_created == self.queues.num_cpl_allocated {
                        self.sm.advance(StartState::WaitOnIoSq);
                    } else {
                        self.sm.advance(StartState::WaitOnIoCq);
                    }
                } else {
                    self.sm.fatal(StartFailure::CPLQ_CREATE);
                }
            }
            StartState::WaitOnIoSq => {
                if comp.is_ok() {
                    self.queues.num_sub_created += 1;
                    if self.queues.num_sub_created == self.queues.num_sub_allocated {
                        if self.sm.learning_cores < self.res_map.num_active_cores {
                            self.sm.advance(StartState::WaitOnLearnMapping);
                        } else {
                            self.sm.advance(StartState::StartComplete);
                            info!("bring-up complete");
                        }
                    } else {
                        self.sm.advance(StartState::WaitOnIoSq);
                    }
                } else {
                    self.sm.fatal(StartFailure::SUBQ_CREATE);
                }
            }
            StartState::WaitOnReSetupQueues => self.delete_queue_callback(cmd, comp),
            _ => self.sm.fatal(StartFailure::UNKNOWN_STATE),
        }
    }

    /// Completion handling for the Set Features phase, including the LBA
    /// range examination that decides namespace visibility.
    fn set_features_completion(&mut self, cmd: NvmeCmd, comp: NvmeComp) {
        let fid = cmd.fid();

        if !self.sm.interrupt_coalescing_set
            && cmd.opcode == admin_opcode::SET_FEATURES
            && fid == feature::INTERRUPT_COALESCING
        {
            if comp.is_ok() {
                self.sm.interrupt_coalescing_set = true;
                self.sm.advance(StartState::WaitOnSetFeatures);
            } else {
                self.sm.fatal(StartFailure::INT_COALESCING);
            }
        } else if cmd.opcode == admin_opcode::SET_FEATURES && fid == feature::NUMBER_OF_QUEUES {
            if comp.is_ok() {
                // Wire counts are 0-based.
                self.queues.num_sub_alloc_from_adapter = (comp.cdw0 & 0xFFFF) as u16 + 1;
                self.queues.num_cpl_alloc_from_adapter = (comp.cdw0 >> 16) as u16 + 1;
                info!(
                    "adapter granted {} SQ / {} CQ",
                    self.queues.num_sub_alloc_from_adapter,
                    self.queues.num_cpl_alloc_from_adapter
                );
                self.sm.advance(StartState::WaitOnSetFeatures);
            } else {
                self.sm.fatal(StartFailure::QUEUE_ALLOC);
            }
        } else if self.sm.ttl_lba_range_examined < self.sm.identify_ns_fetched
            && fid == feature::LBA_RANGE_TYPE
        {
            if !comp.is_ok() {
                self.sm.fatal(StartFailure::LBA_RANGE_CHK);
                return;
            }

            let lun = self.sm.visible_ns_examined as usize;

            if cmd.opcode == admin_opcode::GET_FEATURES {
                // Only a single range per namespace is supported.
                let num_ranges = comp.cdw0 & 0x3F;
                let visibility = if num_ranges == 0 {
                    let mut entry = LbaRangeEntry::zeroed();
                    self.copy_from_scratch(&mut entry);
                    self.luns[lun].read_only = !entry.overwriteable();
                    if entry.hidden() { NsVisibility::Hidden } else { NsVisibility::Visible }
                } else {
                    NsVisibility::Ignored
                };

                self.sm.config_lba_range_needed = false;
                self.sm.ttl_lba_range_examined += 1;
                if visibility == NsVisibility::Visible {
                    self.luns[lun].slot_status = SlotStatus::Online;
                    self.sm.visible_ns_examined += 1;
                } else {
                    debug!("NSID {} not visible, clearing slot {}", self.sm.current_nsid, lun);
                    self.luns[lun].clear();
                }
            } else {
                // Set path: counted as examined, nothing else recorded.
                self.sm.config_lba_range_needed = false;
                self.sm.ttl_lba_range_examined += 1;
            }

            if self.sm.ttl_lba_range_examined == self.identify_ctrl.nn {
                self.visible_luns = self.sm.visible_ns_examined;
                self.sm.advance(StartState::WaitOnSetupQueues);
            } else if self.sm.config_lba_range_needed {
                self.sm.advance(StartState::WaitOnSetFeatures);
            } else {
                self.sm.advance(StartState::WaitOnIdentifyNs);
            }
        } else {
            self.sm.fatal(StartFailure::UNKNOWN_STATE);
        }
    }

    /// Queue deletion completion during the post-learning rebuild.
    fn delete_queue_callback(&mut self, cmd: NvmeCmd, comp: NvmeComp) {
        match cmd.opcode {
            admin_opcode::DELETE_IO_CQ => {
                if comp.is_ok() {
                    let qid = self.queues.num_cpl_created;
                    if let Ok(cq) = self.queues.cpl_queue(qid) {
                        cq.reset();
                    }
                    self.queues.num_cpl_created -= 1;
                } else {
                    self.sm.fatal(StartFailure::CPLQ_DELETE);
                    return;
                }
            }
            admin_opcode::DELETE_IO_SQ => {
                if comp.is_ok() {
                    let qid = self.queues.num_sub_created;
                    if let Ok(sq) = self.queues.sub_queue(qid) {
                        sq.reset();
                    }
                    self.queues.num_sub_created -= 1;
                } else {
                    self.sm.fatal(StartFailure::SUBQ_DELETE);
                    return;
                }
            }
            _ => {
                self.sm.fatal(StartFailure::UNKNOWN_STATE);
                return;
            }
        }

        if self.queues.num_cpl_created > 0 {
            self.sm.advance(StartState::WaitOnReSetupQueues);
        } else {
            // All deleted; recreation picks up the learned vectors.
            self.sm.advance(StartState::WaitOnIoCq);
        }
    }

    /// Record a learning probe result: bind the observed vector to the
    /// core being learned and move to the next core, or to the queue
    /// rebuild once every core is learned.
    fn learn_completion(&mut self, comp: NvmeComp, observed_iv: Iv) {
        if self.sm.state != StartState::WaitOnLearnMapping {
            warn!("stray learning completion in {:?}", self.sm.state);
            return;
        }

        if comp.is_ok() {
            let slot = self.sm.learning_cores as usize;
            let (core_num, cpl_queue) = {
                let entry = &self.res_map.cores[slot];
                (entry.core, entry.cpl_queue)
            };
            self.res_map.cores[slot].msg_vector = observed_iv;
            if let Some(vector) =
                self.res_map.interrupts.vectors_mut().get_mut(observed_iv as usize)
            {
                vector.core = core_num;
                vector.cpl_queue = cpl_queue;
            }
            debug!("learned core {} <- vector {}", core_num, observed_iv);

            self.sm.learning_cores += 1;
            if self.sm.learning_cores < self.res_map.num_active_cores {
                self.sm.advance(StartState::WaitOnLearnMapping);
            } else {
                self.sm.advance(StartState::WaitOnReSetupQueues);
            }
        } else {
            // Possibly no namespace exists at all; not fatal.
            info!(
                "learning probe failed (sc {:#x} sct {:#x}), keeping provisional mapping",
                comp.sc(),
                comp.sct()
            );
            self.sm.learning_cores = self.res_map.num_active_cores;
            self.sm.advance(StartState::StartComplete);
        }
    }

    /// Mask interrupt delivery. Per-vector MSI-X masking belongs to the
    /// platform; only the shared INTx/MSI vector is handled here.
    pub fn mask_interrupts(&self) {
        match self.res_map.interrupts.kind() {
            InterruptKind::Intx | InterruptKind::Msi => Registers::new(&self.platform).mask_intx(),
            InterruptKind::MsiX => trace!("MSI-X masking is per-vector, platform-owned"),
        }
    }

    pub fn unmask_interrupts(&self) {
        match self.res_map.interrupts.kind() {
            InterruptKind::Intx | InterruptKind::Msi => {
                Registers::new(&self.platform).unmask_intx()
            }
            InterruptKind::MsiX => trace!("MSI-X unmasking is per-vector, platform-owned"),
        }
    }

    /// True while command slots other than the parked AERs are pending.
    pub fn has_pending_commands(&self) -> bool {
        self.queues.sub.iter().any(|sq| sq.pending_with(|ctx| ctx != CTX_AER) > 0)
    }

    /// Orderly shutdown: refuse while commands are pending, then disable
    /// the controller, drive the Shutdown Notification handshake, and
    /// free all queue memory in reverse construction order whether or not
    /// the controller acknowledged in time.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.has_pending_commands() {
            warn!("shutdown refused: commands still pending");
            return Err(Error::InvalidParameter("commands still pending"));
        }

        let regs = Registers::new(&self.platform);

        // Reset drops all queues on the controller side.
        regs.reset();
        if self.wait_ready(false).is_err() {
            warn!("controller did not clear RDY before shutdown notification");
        }

        regs.set_shutdown(SHN_NORMAL);

        let poll_max = self.timeout_us / STATE_STALL_US;
        let mut complete = false;
        for _ in 0..poll_max {
            if regs.status().shutdown_status() == SHST_COMPLETE {
                complete = true;
                break;
            }
            self.platform.stall_us(STATE_STALL_US);
        }

        self.queues.free_all();
        self.sm.advance(StartState::WaitOnRdy);

        if complete {
            info!("shutdown complete");
            Ok(())
        } else {
            warn!("shutdown status never reached complete");
            Err(Error::Timeout("CSTS.SHST"))
        }
    }

    fn wait_ready(&self, want: bool) -> Result<()> {
        let regs = Registers::new(&self.platform);
        let poll_max = self.timeout_us / STATE_STALL_US;
        for _ in 0..poll_max {
            if regs.status().ready() == want {
                return Ok(());
            }
            self.platform.stall_us(STATE_STALL_US);
        }
        Err(Error::Timeout("CSTS.RDY"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNamespace, SimPlatform};

    fn controller(platform: SimPlatform) -> ControllerContext<SimPlatform> {
        let config = DriverConfig::load(&platform);
        ControllerContext::new(platform, config).unwrap()
    }

    /// Drive bring-up the way the ISR would: deliver each fired vector.
    fn pump(ctl: &mut ControllerContext<SimPlatform>) {
        for _ in 0..10_000 {
            let iv = match ctl.platform().take_interrupt() {
                Some(iv) => iv,
                None => return,
            };
            ctl.deliver_completion(iv).unwrap();
        }
        panic!("interrupt pump did not drain");
    }

    #[test]
    fn single_core_intx_one_namespace() {
        let platform = SimPlatform::builder()
            .cores(1)
            .msi_granted(0)
            .queue_pairs_granted(1)
            .namespace(SimNamespace::visible(1024))
            .build();
        let mut ctl = controller(platform);

        let state = ctl.start_polled().unwrap();
        assert_eq!(state, StartState::StartComplete);

        assert_eq!(ctl.resource_map().interrupts.kind(), InterruptKind::Intx);
        assert!(ctl.resource_map().interrupts.is_shared());
        assert_eq!(ctl.resource_map().interrupts.vectors().len(), 1);

        assert_eq!(ctl.queue_set().num_sub_allocated, 1);
        assert_eq!(ctl.queue_set().num_sub_created, 1);
        assert!(ctl.queue_set().sub_queue(0).unwrap().shared, "admin pair is always shared");
        assert_eq!(ctl.resource_map().core(0).unwrap().sub_queue, 1);
        assert_eq!(ctl.resource_map().core(0).unwrap().cpl_queue, 1);

        assert_eq!(ctl.visible_luns(), 1);
        assert_eq!(ctl.namespaces()[0].slot_status, SlotStatus::Online);
        assert_eq!(ctl.namespaces()[0].identify.nsze, 1024);
    }

    #[test]
    fn four_cores_msix_learning_follows_observed_vectors() {
        let platform = SimPlatform::builder()
            .cores(4)
            .msi_granted(8)
            .namespace(SimNamespace::visible(4096))
            .namespace(SimNamespace::visible(8192))
            .vector_permutation(vec![0, 2, 1, 4, 3])
            .build();
        let mut ctl = controller(platform);

        ctl.start().unwrap();
        pump(&mut ctl);
        assert_eq!(ctl.start_state(), StartState::StartComplete);

        assert_eq!(ctl.resource_map().interrupts.kind(), InterruptKind::MsiX);
        assert_eq!(ctl.queue_set().num_sub_allocated, 4);
        assert_eq!(ctl.queue_set().num_sub_created, 4);
        assert_eq!(ctl.queue_set().num_cpl_created, 4);

        // Learning rewired each core to the vector that actually fired.
        let learned: Vec<u16> =
            (0..4).map(|c| ctl.resource_map().core(c).unwrap().msg_vector).collect();
        assert_eq!(learned, vec![2, 1, 4, 3]);

        // The rebuilt completion queues carry the learned vectors.
        for qid in 1..=4u16 {
            assert_eq!(
                ctl.platform().device_cq_vector(qid),
                Some(learned[qid as usize - 1]),
                "device CQ {} vector",
                qid
            );
        }
        assert_eq!(ctl.platform().device_queue_pairs(), 4);

        // Both namespaces online and writable.
        assert_eq!(ctl.visible_luns(), 2);
        for lun in &ctl.namespaces()[..2] {
            assert_eq!(lun.slot_status, SlotStatus::Online);
            assert!(!lun.read_only);
        }

        // Steady-state lookups now come from the core table.
        assert_eq!(ctl.current_core_queues().unwrap(), (1, 1));
        ctl.platform().set_current_core(2);
        assert_eq!(ctl.current_core_queues().unwrap(), (3, 3));
    }

    #[test]
    fn partial_vector_grant_shares_vector_zero() {
        let platform = SimPlatform::builder()
            .cores(4)
            .msi_granted(2)
            .queue_pairs_granted(2)
            .namespace(SimNamespace::visible(1024))
            .build();
        let mut ctl = controller(platform);

        let state = ctl.start_polled().unwrap();
        assert_eq!(state, StartState::StartComplete);

        // Two vectors for four cores: everything funnels through the
        // shared vector and every completion queue carries vector 0.
        assert_eq!(ctl.resource_map().interrupts.kind(), InterruptKind::Msi);
        assert!(ctl.resource_map().interrupts.is_shared());
        for qid in 1..=2u16 {
            assert_eq!(ctl.queue_set().cpl_queue(qid).unwrap().msg_vector, 0);
            assert_eq!(ctl.platform().device_cq_vector(qid), Some(0));
        }

        // Queues 1..2 created, cores mapped round-robin into {1, 2}.
        assert_eq!(ctl.queue_set().num_sub_created, 2);
        let mapping: Vec<u16> =
            (0..4).map(|c| ctl.resource_map().core(c).unwrap().sub_queue).collect();
        assert_eq!(mapping, vec![1, 2, 1, 2]);
    }

    #[test]
    fn single_pair_grant_is_shared_by_all_cores() {
        let platform = SimPlatform::builder()
            .cores(4)
            .queue_pairs_granted(1)
            .namespace(SimNamespace::visible(1024))
            .build();
        let mut ctl = controller(platform);

        let state = ctl.start_polled().unwrap();
        assert_eq!(state, StartState::StartComplete);

        assert_eq!(ctl.queue_set().num_sub_allocated, 1);
        assert_eq!(ctl.queue_set().num_cpl_allocated, 1);
        assert!(ctl.queue_set().sub_queue(1).unwrap().shared);
        for core in 0..4 {
            assert_eq!(ctl.resource_map().core(core).unwrap().sub_queue, 1);
        }
    }

    #[test]
    fn identify_controller_failure_is_fatal_before_queue_memory() {
        let platform = SimPlatform::builder()
            .cores(2)
            .namespace(SimNamespace::visible(1024))
            .fail_identify_ctrl()
            .build();
        let mut ctl = controller(platform);

        let state = ctl.start_polled().unwrap();
        match state {
            StartState::Failed(mask) => {
                assert!(mask.contains(StartFailure::IDENTIFY_CTRL));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(ctl.queue_set().num_sub_allocated, 0);
        assert_eq!(ctl.queue_set().num_cpl_allocated, 0);
    }

    #[test]
    fn shutdown_refuses_while_commands_pend() {
        let platform = SimPlatform::builder()
            .cores(1)
            .queue_pairs_granted(1)
            .namespace(SimNamespace::visible(1024))
            .build();
        let mut ctl = controller(platform);
        ctl.start_polled().unwrap();
        assert_eq!(ctl.start_state(), StartState::StartComplete);

        // A consumer holds a command slot.
        let handle = ctl.queue_set().sub_queue(1).unwrap().acquire(42).unwrap();
        assert!(ctl.shutdown().is_err());
        // Registers untouched: the controller is still enabled and ready.
        assert!(Registers::new(ctl.platform()).status().ready());
        assert!(ctl.queue_set().sub_queue(1).unwrap().is_pending(handle.cmd_id));

        // Released: shutdown drives the handshake and frees everything.
        ctl.queue_set().sub_queue(1).unwrap().release(handle.cmd_id);
        ctl.shutdown().unwrap();
        assert_eq!(
            Registers::new(ctl.platform()).status().shutdown_status(),
            SHST_COMPLETE
        );
        assert!(ctl.queue_set().sub.is_empty());
        assert!(ctl.queue_set().cpl.is_empty());
    }

    #[test]
    fn no_namespaces_completes_via_nonfatal_probe_failure() {
        let platform = SimPlatform::builder().cores(2).msi_granted(4).build();
        let mut ctl = controller(platform);

        ctl.start().unwrap();
        pump(&mut ctl);
        // The learning probe has no namespace to read; learning is
        // abandoned without failing bring-up.
        assert_eq!(ctl.start_state(), StartState::StartComplete);
        assert_eq!(ctl.visible_luns(), 0);
        assert_eq!(ctl.queue_set().num_sub_created, 2);
    }

    #[test]
    fn hidden_namespace_is_cleared_and_skipped() {
        let platform = SimPlatform::builder()
            .cores(1)
            .msi_granted(0)
            .queue_pairs_granted(1)
            .namespace(SimNamespace::hidden(512))
            .namespace(SimNamespace::visible(2048))
            .build();
        let mut ctl = controller(platform);

        let state = ctl.start_polled().unwrap();
        assert_eq!(state, StartState::StartComplete);

        // Only the second namespace survived; it reused LUN slot 0.
        assert_eq!(ctl.visible_luns(), 1);
        assert_eq!(ctl.namespaces()[0].slot_status, SlotStatus::Online);
        assert_eq!(ctl.namespaces()[0].namespace_id, 2);
        assert_eq!(ctl.namespaces()[0].identify.nsze, 2048);
        assert_eq!(ctl.namespaces()[1].slot_status, SlotStatus::Free);
    }

    #[test]
    fn multiple_lba_ranges_mean_ignored() {
        let platform = SimPlatform::builder()
            .cores(1)
            .msi_granted(0)
            .queue_pairs_granted(1)
            .namespace(SimNamespace::visible(1024))
            .lba_num_ranges(2)
            .build();
        let mut ctl = controller(platform);

        let state = ctl.start_polled().unwrap();
        assert_eq!(state, StartState::StartComplete);
        assert_eq!(ctl.visible_luns(), 0);
        assert_eq!(ctl.namespaces()[0].slot_status, SlotStatus::Free);
    }

    #[test]
    fn read_only_follows_overwriteable_attribute() {
        let mut ns = SimNamespace::visible(1024);
        ns.overwriteable = false;
        let platform = SimPlatform::builder()
            .cores(1)
            .msi_granted(0)
            .queue_pairs_granted(1)
            .namespace(ns)
            .build();
        let mut ctl = controller(platform);

        ctl.start_polled().unwrap();
        assert_eq!(ctl.namespaces()[0].slot_status, SlotStatus::Online);
        assert!(ctl.namespaces()[0].read_only);
    }

    #[test]
    fn dump_mode_uses_one_polled_shared_pair() {
        let platform = SimPlatform::builder()
            .cores(4)
            .msi_granted(8)
            .namespace(SimNamespace::visible(1024))
            .build();
        let mut config = DriverConfig::load(&platform);
        config.dump_mode = true;
        let mut ctl = ControllerContext::new(platform, config).unwrap();

        let state = ctl.start_polled().unwrap();
        assert_eq!(state, StartState::StartComplete);
        assert_eq!(ctl.queue_set().num_sub_allocated, 1);
        assert!(ctl.queue_set().sub_queue(1).unwrap().shared);
        for core in 0..4 {
            assert_eq!(ctl.resource_map().core(core).unwrap().sub_queue, 1);
        }
    }

    #[test]
    fn enable_timeout_is_fatal() {
        let platform = SimPlatform::builder().cores(1).never_ready().build();
        let mut ctl = controller(platform);
        assert!(matches!(ctl.start(), Err(Error::Timeout(_))));
        assert!(matches!(ctl.start_state(), StartState::Failed(_)));
    }

    #[test]
    fn shutdown_timeout_still_frees_memory() {
        let platform = SimPlatform::builder()
            .cores(1)
            .msi_granted(0)
            .queue_pairs_granted(1)
            .namespace(SimNamespace::visible(1024))
            .no_shutdown_ack()
            .build();
        let mut ctl = controller(platform);
        ctl.start_polled().unwrap();

        assert!(matches!(ctl.shutdown(), Err(Error::Timeout(_))));
        assert!(ctl.queue_set().sub.is_empty());
    }

    #[test]
    fn aers_are_parked_up_to_the_controller_limit() {
        let platform = SimPlatform::builder()
            .cores(1)
            .msi_granted(0)
            .queue_pairs_granted(1)
            .namespace(SimNamespace::visible(1024))
            .aerl(1)
            .build();
        let mut ctl = controller(platform);
        ctl.start_polled().unwrap();

        // AERL is 0-based: limit 2, desired 4.
        assert_eq!(ctl.platform().parked_aers(), 2);
    }

    #[test]
    fn allocation_fallback_shares_queue_one() {
        // Scratch + admin pair consume four regions (two each); let two
        // IO pairs succeed, then fail.
        let platform = SimPlatform::builder()
            .cores(4)
            .msi_granted(8)
            .namespace(SimNamespace::visible(1024))
            .alloc_fail_after(8)
            .build();
        let mut ctl = controller(platform);

        let state = ctl.start_polled().unwrap();
        assert_eq!(state, StartState::StartComplete);
        assert_eq!(ctl.queue_set().num_sub_allocated, 1);
        assert!(ctl.queue_set().sub_queue(1).unwrap().shared);
        for core in 0..4 {
            assert_eq!(ctl.resource_map().core(core).unwrap().sub_queue, 1);
        }
    }
}
