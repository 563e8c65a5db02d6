// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! NUMA/core topology and interrupt resource mapping.
//!
//! The tables built here are flat arrays indexed by id; the cyclic
//! core/vector/queue relations are stored as id-to-id fields on both sides
//! and reconciled during mapping, so every steady-state lookup is a single
//! array index.

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::platform::{MsiInfo, Platform, AFFINITY_MASK_WIDTH};
use crate::{CqId, Iv, SqId};

/// Marker core id for a vector shared by all cores.
pub const RESOURCE_SHARED: u16 = u16::MAX;

/// One NUMA node: its affinity mask and the system core range it spans.
/// Built once during enumeration, immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct NumaNode {
    pub node: u16,
    pub group: u16,
    pub mask: u64,
    pub first_core: u16,
    pub last_core: u16,
    pub core_count: u16,
}

/// One logical processor and its assigned queue pair and vector. The three
/// assignments are filled during mapping and may be rewritten exactly once
/// by the learning phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreEntry {
    pub core: u16,
    pub numa_node: u16,
    pub group: u16,
    pub sub_queue: SqId,
    pub cpl_queue: CqId,
    pub msg_vector: Iv,
}

/// One granted message vector and its reverse mapping to a core and
/// completion queue.
#[derive(Debug, Clone, Copy)]
pub struct MsgVector {
    pub id: Iv,
    pub address: u64,
    pub data: u32,
    pub core: u16,
    pub cpl_queue: CqId,
    pub shared: bool,
}

impl MsgVector {
    fn new(id: Iv, info: MsiInfo) -> Self {
        MsgVector {
            id,
            address: info.address,
            data: info.data,
            core: 0,
            cpl_queue: 0,
            shared: false,
        }
    }

    fn shared_placeholder() -> Self {
        MsgVector {
            id: 0,
            address: 0,
            data: 0,
            core: RESOURCE_SHARED,
            cpl_queue: 0,
            shared: true,
        }
    }
}

/// Interrupt delivery classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    Intx,
    Msi,
    MsiX,
}

/// The granted interrupt resources. INTx carries exactly one shared
/// vector; MSI carries a shared or per-core vector list; MSI-X carries a
/// per-core vector list.
#[derive(Debug)]
pub enum InterruptResources {
    Intx { vector: MsgVector },
    Msi { vectors: Vec<MsgVector>, shared: bool },
    MsiX { vectors: Vec<MsgVector> },
}

impl InterruptResources {
    pub fn kind(&self) -> InterruptKind {
        match self {
            InterruptResources::Intx { .. } => InterruptKind::Intx,
            InterruptResources::Msi { .. } => InterruptKind::Msi,
            InterruptResources::MsiX { .. } => InterruptKind::MsiX,
        }
    }

    /// Number of granted message vectors; zero for INTx.
    pub fn granted(&self) -> u16 {
        match self {
            InterruptResources::Intx { .. } => 0,
            InterruptResources::Msi { vectors, .. } | InterruptResources::MsiX { vectors } => {
                vectors.len() as u16
            }
        }
    }

    pub fn is_shared(&self) -> bool {
        match self {
            InterruptResources::Intx { .. } => true,
            InterruptResources::Msi { shared, .. } => *shared,
            InterruptResources::MsiX { .. } => false,
        }
    }

    pub fn vectors(&self) -> &[MsgVector] {
        match self {
            InterruptResources::Intx { vector } => core::slice::from_ref(vector),
            InterruptResources::Msi { vectors, .. } | InterruptResources::MsiX { vectors } => {
                vectors
            }
        }
    }

    pub fn vectors_mut(&mut self) -> &mut [MsgVector] {
        match self {
            InterruptResources::Intx { vector } => core::slice::from_mut(vector),
            InterruptResources::Msi { vectors, .. } | InterruptResources::MsiX { vectors } => {
                vectors
            }
        }
    }
}

/// Core, NUMA, and vector tables plus their cross-mappings.
pub struct ResourceMap {
    pub numa_nodes: Vec<NumaNode>,
    /// Core entries in increasing system core number order.
    pub cores: Vec<CoreEntry>,
    pub interrupts: InterruptResources,
    pub num_active_cores: u16,
}

impl ResourceMap {
    /// Enumerate NUMA nodes and logical cores and build the static tables.
    /// MSI classification happens separately in [`enumerate_msi_messages`].
    pub fn enumerate_numa_cores(platform: &impl Platform) -> Result<ResourceMap> {
        let num_nodes = platform.highest_numa_node() as u32 + 1;
        info!("topology: {} NUMA node(s)", num_nodes);

        let mut numa_nodes = Vec::with_capacity(num_nodes as usize);
        let mut num_active_cores: u32 = 0;

        for node in 0..num_nodes as u16 {
            let affinity = platform.node_affinity(node)?;
            let core_count = affinity.mask.count_ones() as u16;
            num_active_cores += core_count as u32;
            debug!("topology: node {} group {} mask {:#x}", node, affinity.group, affinity.mask);

            numa_nodes.push(NumaNode {
                node,
                group: affinity.group,
                mask: affinity.mask,
                first_core: 0,
                last_core: 0,
                core_count,
            });
        }

        let mut cores = Vec::with_capacity(num_active_cores as usize);
        for numa in numa_nodes.iter_mut() {
            let base_core = numa.group * AFFINITY_MASK_WIDTH;
            numa.first_core = base_core;
            numa.last_core = base_core;
            let mut first_found = false;

            for bit in 0..AFFINITY_MASK_WIDTH {
                if (numa.mask >> bit) & 1 == 0 {
                    continue;
                }
                let core = base_core + bit;
                if !first_found {
                    numa.first_core = core;
                    first_found = true;
                }
                numa.last_core = core;
                cores.push(CoreEntry {
                    core,
                    numa_node: numa.node,
                    group: numa.group,
                    ..Default::default()
                });
            }

            debug!("topology: node {} cores {}..={}", numa.node, numa.first_core, numa.last_core);
        }

        if cores.len() as u32 != num_active_cores {
            error!(
                "topology: populated {} core entries, affinity masks say {}",
                cores.len(),
                num_active_cores
            );
            return Err(Error::InvariantViolated(num_active_cores));
        }

        info!("topology: {} active core(s)", num_active_cores);

        Ok(ResourceMap {
            numa_nodes,
            cores,
            interrupts: InterruptResources::Intx { vector: MsgVector::shared_placeholder() },
            num_active_cores: num_active_cores as u16,
        })
    }

    /// Probe granted message vectors and classify the interrupt mode.
    ///
    /// Grants are probed for ids `0..=num_active_cores`. No grant at all
    /// means INTx with one shared vector. A single grant is shared MSI.
    /// More grants than cores is MSI-X, unless the first two vectors carry
    /// the same address, which means single-address multi-data MSI. Any
    /// other count is MSI with vector 0 shared.
    pub fn enumerate_msi_messages(&mut self, platform: &impl Platform) {
        let mut vectors = Vec::new();
        for msg_id in 0..=self.num_active_cores {
            match platform.msi_info(msg_id) {
                Some(info) => vectors.push(MsgVector::new(msg_id, info)),
                None => break,
            }
        }

        let granted = vectors.len() as u16;
        info!("interrupts: {} message(s) granted", granted);

        self.interrupts = if granted == 0 {
            InterruptResources::Intx { vector: MsgVector::shared_placeholder() }
        } else if granted == 1 {
            vectors[0].core = RESOURCE_SHARED;
            vectors[0].shared = true;
            InterruptResources::Msi { vectors, shared: true }
        } else if granted > self.num_active_cores {
            if vectors[1].address == vectors[0].address {
                InterruptResources::Msi { vectors, shared: false }
            } else {
                InterruptResources::MsiX { vectors }
            }
        } else {
            // Partial grant: everything funnels through vector 0.
            vectors[0].core = RESOURCE_SHARED;
            vectors[0].shared = true;
            InterruptResources::Msi { vectors, shared: true }
        };

        debug!("interrupts: classified as {:?}", self.interrupts.kind());
    }

    /// Provisional 1:1 core-to-vector mapping: each core takes the vector
    /// whose id equals its paired completion queue id. Only meaningful
    /// when every core got its own vector; the learning phase refines it.
    pub fn msi_map_cores(&mut self) {
        if self.interrupts.granted() <= self.num_active_cores {
            // Sharing already fully described by enumerate_msi_messages.
            return;
        }

        let vectors = match &mut self.interrupts {
            InterruptResources::Msi { vectors, .. } | InterruptResources::MsiX { vectors } => {
                vectors
            }
            InterruptResources::Intx { .. } => return,
        };

        for entry in self.cores.iter_mut() {
            entry.msg_vector = entry.cpl_queue;
            let vector = &mut vectors[entry.msg_vector as usize];
            vector.core = entry.core;
            vector.cpl_queue = entry.cpl_queue;
            debug!("interrupts: core {} -> vector {}", entry.core, entry.msg_vector);
        }
    }

    /// Complete the resource mapping table once queues are assigned.
    pub fn complete(&mut self) {
        match self.interrupts.kind() {
            InterruptKind::Msi | InterruptKind::MsiX => self.msi_map_cores(),
            InterruptKind::Intx => {}
        }
    }

    /// Queue pair owning a core. While the learning phase is incomplete
    /// every lookup lands on the queue currently being learned.
    pub fn map_core_to_queue(&self, core: u16, learning_cores: u16) -> Result<(SqId, CqId)> {
        let entry = self.core(core).ok_or(Error::InvalidParameter("core number"))?;
        if learning_cores == self.num_active_cores {
            Ok((entry.sub_queue, entry.cpl_queue))
        } else {
            Ok((learning_cores + 1, learning_cores + 1))
        }
    }

    pub fn core(&self, core: u16) -> Option<&CoreEntry> {
        self.cores.iter().find(|c| c.core == core)
    }

    pub fn core_mut(&mut self, core: u16) -> Option<&mut CoreEntry> {
        self.cores.iter_mut().find(|c| c.core == core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn single_node_four_cores() {
        let platform = SimPlatform::builder().cores(4).build();
        let map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        assert_eq!(map.num_active_cores, 4);
        assert_eq!(map.numa_nodes.len(), 1);
        assert_eq!(map.numa_nodes[0].core_count, 4);
        assert_eq!(map.numa_nodes[0].first_core, 0);
        assert_eq!(map.numa_nodes[0].last_core, 3);
        // Core numbers are unique.
        for (i, c) in map.cores.iter().enumerate() {
            assert_eq!(c.core as usize, i);
        }
    }

    #[test]
    fn two_nodes_split_cores() {
        let platform = SimPlatform::builder().cores(8).numa_nodes(2).build();
        let map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        assert_eq!(map.num_active_cores, 8);
        assert_eq!(map.numa_nodes.len(), 2);
        let total: u16 = map.numa_nodes.iter().map(|n| n.core_count).sum();
        assert_eq!(total, map.num_active_cores);
        for node in &map.numa_nodes {
            assert_eq!(node.mask.count_ones() as u16, node.core_count);
        }
    }

    #[test]
    fn no_vectors_means_intx_shared() {
        let platform = SimPlatform::builder().cores(1).msi_granted(0).build();
        let mut map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        map.enumerate_msi_messages(&platform);
        assert_eq!(map.interrupts.kind(), InterruptKind::Intx);
        assert!(map.interrupts.is_shared());
        assert_eq!(map.interrupts.vectors().len(), 1);
        assert_eq!(map.interrupts.vectors()[0].core, RESOURCE_SHARED);
    }

    #[test]
    fn one_vector_means_shared_msi() {
        let platform = SimPlatform::builder().cores(4).msi_granted(1).build();
        let mut map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        map.enumerate_msi_messages(&platform);
        assert_eq!(map.interrupts.kind(), InterruptKind::Msi);
        assert!(map.interrupts.is_shared());
    }

    #[test]
    fn full_grant_with_distinct_addresses_is_msix() {
        let platform = SimPlatform::builder().cores(4).msi_granted(8).build();
        let mut map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        map.enumerate_msi_messages(&platform);
        assert_eq!(map.interrupts.kind(), InterruptKind::MsiX);
        assert_eq!(map.interrupts.granted(), 5); // probed 0..=cores
        assert!(!map.interrupts.is_shared());
    }

    #[test]
    fn full_grant_with_equal_addresses_is_msi() {
        let platform =
            SimPlatform::builder().cores(4).msi_granted(8).msi_single_address(true).build();
        let mut map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        map.enumerate_msi_messages(&platform);
        assert_eq!(map.interrupts.kind(), InterruptKind::Msi);
        assert!(!map.interrupts.is_shared());
    }

    #[test]
    fn partial_grant_is_shared_msi() {
        let platform = SimPlatform::builder().cores(4).msi_granted(2).build();
        let mut map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        map.enumerate_msi_messages(&platform);
        assert_eq!(map.interrupts.kind(), InterruptKind::Msi);
        assert!(map.interrupts.is_shared());
        assert!(map.interrupts.vectors()[0].shared);
    }

    #[test]
    fn provisional_mapping_pairs_core_with_cq_id() {
        let platform = SimPlatform::builder().cores(4).msi_granted(8).build();
        let mut map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        map.enumerate_msi_messages(&platform);
        for i in 0..4 {
            let entry = map.cores.get_mut(i).unwrap();
            entry.sub_queue = i as u16 + 1;
            entry.cpl_queue = i as u16 + 1;
        }
        map.complete();
        for i in 0..4u16 {
            let entry = map.core(i).unwrap();
            assert_eq!(entry.msg_vector, i + 1);
            let vector = map.interrupts.vectors()[(i + 1) as usize];
            assert_eq!(vector.core, i);
            assert_eq!(vector.cpl_queue, i + 1);
        }
    }

    #[test]
    fn learning_lookup_overrides_stored_mapping() {
        let platform = SimPlatform::builder().cores(2).msi_granted(4).build();
        let mut map = ResourceMap::enumerate_numa_cores(&platform).unwrap();
        map.enumerate_msi_messages(&platform);
        map.core_mut(0).unwrap().sub_queue = 2;
        map.core_mut(0).unwrap().cpl_queue = 2;

        // Still learning core 0: lookups land on queue 1 regardless.
        assert_eq!(map.map_core_to_queue(0, 0).unwrap(), (1, 1));
        // Learning done: the stored mapping wins.
        assert_eq!(map.map_core_to_queue(0, 2).unwrap(), (2, 2));
        assert!(map.map_core_to_queue(7, 2).is_err());
    }
}
