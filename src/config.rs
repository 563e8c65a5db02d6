// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver tunables.
//!
//! Each value is read from the platform key/value store at attach time.
//! Absent or out-of-range keys keep their compile-time default.

use log::{info, warn};

use crate::platform::Platform;

pub const KEY_NAMESPACES: &str = "Namespaces";
pub const KEY_MAX_TX_SIZE: &str = "MaxTXSize";
pub const KEY_AD_QUEUE_ENTRIES: &str = "AdQEntries";
pub const KEY_IO_QUEUE_ENTRIES: &str = "IoQEntries";
pub const KEY_INT_COALESCING_TIME: &str = "IntCoalescingTime";
pub const KEY_INT_COALESCING_ENTRIES: &str = "IntCoalescingEntries";

pub const DFT_NAMESPACES: u32 = 16;
pub const MIN_NAMESPACES: u32 = 1;
pub const MAX_NAMESPACES: u32 = 256;

/// Maximum transfer size, which also sizes each command slot's PRP list
/// (one 8-byte entry per page of payload).
pub const DFT_MAX_TX_SIZE: u32 = 128 * 1024;
pub const MIN_MAX_TX_SIZE: u32 = 4096;
pub const MAX_MAX_TX_SIZE: u32 = 1024 * 1024;

pub const DFT_AD_QUEUE_ENTRIES: u32 = 128;
pub const MIN_AD_QUEUE_ENTRIES: u32 = 2;
pub const MAX_AD_QUEUE_ENTRIES: u32 = 4096;

pub const DFT_IO_QUEUE_ENTRIES: u32 = 1024;
pub const MIN_IO_QUEUE_ENTRIES: u32 = 2;
pub const MAX_IO_QUEUE_ENTRIES: u32 = 4096;

// The coalescing fields are 8-bit on the wire (Set Features FID 08h DW11).
pub const DFT_INT_COALESCING_TIME: u32 = 80;
pub const MIN_INT_COALESCING_TIME: u32 = 0;
pub const MAX_INT_COALESCING_TIME: u32 = 255;

pub const DFT_INT_COALESCING_ENTRIES: u32 = 16;
pub const MIN_INT_COALESCING_ENTRIES: u32 = 0;
pub const MAX_INT_COALESCING_ENTRIES: u32 = 255;

/// Range-checked driver tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Maximum namespaces tracked in the LUN table.
    pub namespaces: u32,
    /// Maximum data transfer size per command, in bytes.
    pub max_tx_size: u32,
    /// Requested admin queue depth (rounded to a page multiple later).
    pub ad_queue_entries: u32,
    /// Requested IO queue depth (rounded to a page multiple later).
    pub io_queue_entries: u32,
    /// Interrupt coalescing aggregation time, 100 us units.
    pub int_coalescing_time: u32,
    /// Interrupt coalescing aggregation threshold, entries.
    pub int_coalescing_entries: u32,
    /// Crash-dump/hibernation load: one shared IO queue pair, polled
    /// completions, no interrupt learning.
    pub dump_mode: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            namespaces: DFT_NAMESPACES,
            max_tx_size: DFT_MAX_TX_SIZE,
            ad_queue_entries: DFT_AD_QUEUE_ENTRIES,
            io_queue_entries: DFT_IO_QUEUE_ENTRIES,
            int_coalescing_time: DFT_INT_COALESCING_TIME,
            int_coalescing_entries: DFT_INT_COALESCING_ENTRIES,
            dump_mode: false,
        }
    }
}

impl DriverConfig {
    /// Load tunables from the platform key/value store, keeping defaults
    /// for anything missing or out of range.
    pub fn load(platform: &impl Platform) -> Self {
        let mut cfg = DriverConfig::default();

        fetch(platform, KEY_NAMESPACES, MIN_NAMESPACES, MAX_NAMESPACES, &mut cfg.namespaces);
        fetch(platform, KEY_MAX_TX_SIZE, MIN_MAX_TX_SIZE, MAX_MAX_TX_SIZE, &mut cfg.max_tx_size);
        fetch(
            platform,
            KEY_AD_QUEUE_ENTRIES,
            MIN_AD_QUEUE_ENTRIES,
            MAX_AD_QUEUE_ENTRIES,
            &mut cfg.ad_queue_entries,
        );
        fetch(
            platform,
            KEY_IO_QUEUE_ENTRIES,
            MIN_IO_QUEUE_ENTRIES,
            MAX_IO_QUEUE_ENTRIES,
            &mut cfg.io_queue_entries,
        );
        fetch(
            platform,
            KEY_INT_COALESCING_TIME,
            MIN_INT_COALESCING_TIME,
            MAX_INT_COALESCING_TIME,
            &mut cfg.int_coalescing_time,
        );
        fetch(
            platform,
            KEY_INT_COALESCING_ENTRIES,
            MIN_INT_COALESCING_ENTRIES,
            MAX_INT_COALESCING_ENTRIES,
            &mut cfg.int_coalescing_entries,
        );

        info!(
            "config: namespaces={} max_tx={} adq={} ioq={} coalescing={}us/{}",
            cfg.namespaces,
            cfg.max_tx_size,
            cfg.ad_queue_entries,
            cfg.io_queue_entries,
            cfg.int_coalescing_time * 100,
            cfg.int_coalescing_entries,
        );

        cfg
    }

    /// Bytes of one command slot's PRP list: one 8-byte entry per payload
    /// page at the configured maximum transfer size.
    pub fn prp_list_size(&self) -> usize {
        (self.max_tx_size as usize / crate::platform::PAGE_SIZE) * core::mem::size_of::<u64>()
    }
}

fn fetch(platform: &impl Platform, key: &str, min: u32, max: u32, slot: &mut u32) {
    if let Some(value) = platform.config_u32(key) {
        if value >= min && value <= max {
            *slot = value;
        } else {
            warn!("config: {} = {} outside [{}, {}], keeping {}", key, value, min, max, *slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn defaults_without_keys() {
        let platform = SimPlatform::builder().build();
        let cfg = DriverConfig::load(&platform);
        assert_eq!(cfg, DriverConfig::default());
    }

    #[test]
    fn in_range_keys_override() {
        let platform = SimPlatform::builder()
            .config_key(KEY_IO_QUEUE_ENTRIES, 256)
            .config_key(KEY_INT_COALESCING_TIME, 10)
            .build();
        let cfg = DriverConfig::load(&platform);
        assert_eq!(cfg.io_queue_entries, 256);
        assert_eq!(cfg.int_coalescing_time, 10);
        assert_eq!(cfg.ad_queue_entries, DFT_AD_QUEUE_ENTRIES);
    }

    #[test]
    fn out_of_range_keys_keep_defaults() {
        let platform = SimPlatform::builder()
            .config_key(KEY_IO_QUEUE_ENTRIES, 1)
            .config_key(KEY_NAMESPACES, 100_000)
            .build();
        let cfg = DriverConfig::load(&platform);
        assert_eq!(cfg.io_queue_entries, DFT_IO_QUEUE_ENTRIES);
        assert_eq!(cfg.namespaces, DFT_NAMESPACES);
    }

    #[test]
    fn prp_list_size_tracks_tx_size() {
        let cfg = DriverConfig { max_tx_size: 128 * 1024, ..DriverConfig::default() };
        // 32 pages of payload, 8 bytes per PRP entry.
        assert_eq!(cfg.prp_list_size(), 256);
    }
}
