// crates/lontalk-rs/src/config/mod.rs
//! Persistent node configuration (spec §3 "Node configuration", §6
//! "Persistent state layout"), grounded in `original_source/lcs_node.h`'s
//! `eep` image layout and `lcs_netmgmt.c`'s checksum recompute calls.

pub mod checksum;
pub mod memory;

use crate::types::{DomainRef, NodeId48, NodeState, ResetCause};
use alloc::vec::Vec;

pub const MAX_DOMAINS: usize = crate::types::MAX_DOMAINS;
pub const MAX_ADDRESS_TABLE_ENTRIES: usize = crate::types::MAX_ADDRESS_TABLE_ENTRIES;

/// Manufacturer-fixed data, never mutated by NM commands (§3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyData {
    pub unique_node_id: NodeId48,
    pub program_id: [u8; 8],
    pub base_firmware_version: u8,
}

/// Mutable node-wide configuration flags and knobs (§3, §4.7 "auth gating").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigData {
    pub two_domains: bool,
    pub nm_auth: bool,
    pub comm_scale: u8,
    pub beta2_scale: u8,
    pub node_priority: u8,
    pub channel_priorities: u8,
    pub rx_pad_raw: u8,
    pub tx_pad_raw: u8,
    pub nts: u32,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            two_domains: false,
            nm_auth: false,
            comm_scale: 1,
            beta2_scale: 1,
            node_priority: 0,
            channel_priorities: 0,
            rx_pad_raw: 0,
            tx_pad_raw: 0,
            nts: 1,
        }
    }
}

/// One domain-table entry (§3, §6). `id` is stored at its full 6-byte width;
/// only the first `encode_domain_len(len)` bytes are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain {
    pub id: [u8; 6],
    pub len: u8,
    pub subnet: u8,
    pub node: u8,
    pub key: [u8; 6],
    pub valid: bool,
}

impl Domain {
    pub const INVALID: Domain =
        Domain { id: [0xFF; 6], len: 0, subnet: 0, node: 0, key: [0xFF; 6], valid: false };

    pub fn id_bytes(&self) -> &[u8] {
        &self.id[..self.len as usize]
    }
}

impl Default for Domain {
    fn default() -> Self {
        Domain::INVALID
    }
}

/// Address-table entry used by acknowledged/request services and group
/// addressing (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrTableEntry {
    pub mode: crate::types::AddressModeTag,
    pub domain_index: u8,
    pub subnet: u8,
    pub node_or_group: u8,
    pub repeat_timer: u8,
    pub retry_count: u8,
    pub receive_timer: u8,
    pub transmit_timer: u8,
    pub group_size: u8,
}

impl Default for AddrTableEntry {
    fn default() -> Self {
        Self {
            mode: crate::types::AddressModeTag::Broadcast,
            domain_index: 0,
            subnet: 0,
            node_or_group: 0,
            repeat_timer: 0,
            retry_count: 0,
            receive_timer: 0,
            transmit_timer: 0,
            group_size: 0,
        }
    }
}

/// One entry of the network-variable configuration table (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NvConfigEntry {
    pub direction_is_output: bool,
    pub selector: u16,
    pub priority: bool,
    pub service: u8,
    pub auth: bool,
    pub addr_index: u8,
    pub turnaround: bool,
    pub length: u8,
}

/// One entry of the network-variable alias table (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NvAliasEntry {
    pub primary_index: u16,
    pub selector: u16,
    pub addr_index: u8,
}

/// The full persistent configuration image, laid out in the same order as
/// the original `eep` structure so the absolute-memory NM window (§4.7
/// `READ_MEMORY`/`WRITE_MEMORY`) can be computed consistently (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigImage {
    pub read_only: ReadOnlyData,
    pub config: ConfigData,
    pub domains: [Domain; MAX_DOMAINS],
    pub addr_table: [AddrTableEntry; MAX_ADDRESS_TABLE_ENTRIES],
    pub nv_config: Vec<NvConfigEntry>,
    pub nv_alias: Vec<NvAliasEntry>,
    pub error_log_len: u32,
    pub state: NodeState,
    pub reset_cause: ResetCause,
    pub checksum: u16,
}

impl ConfigImage {
    /// A freshly power-cycled, never-configured node (§3 "created at first
    /// power-on from defaults").
    pub fn fresh(read_only: ReadOnlyData) -> Self {
        let mut image = Self {
            read_only,
            config: ConfigData::default(),
            domains: [Domain::INVALID; MAX_DOMAINS],
            addr_table: [AddrTableEntry::default(); MAX_ADDRESS_TABLE_ENTRIES],
            nv_config: Vec::new(),
            nv_alias: Vec::new(),
            error_log_len: 0,
            state: NodeState::NoApplUnconfig,
            reset_cause: ResetCause::PowerUpReset,
            checksum: 0,
        };
        image.recompute_checksum();
        image
    }

    pub fn domain(&self, idx: u8) -> Option<&Domain> {
        self.domains.get(idx as usize)
    }

    pub fn domain_mut(&mut self, idx: u8) -> Option<&mut Domain> {
        self.domains.get_mut(idx as usize)
    }

    pub fn resolve_domain(&self, domain_ref: DomainRef) -> Option<&Domain> {
        match domain_ref {
            DomainRef::Index(i) => self.domain(i),
            DomainRef::Flex => None,
        }
    }

    pub fn any_domain_valid(&self) -> bool {
        self.domains.iter().any(|d| d.valid)
    }

    /// Recomputes `checksum` over the whole persistent image and stores it
    /// (§4.7 `CHECKSUM_RECALC`, §8 "Checksum" property).
    pub fn recompute_checksum(&mut self) {
        self.checksum = checksum::compute_config_checksum(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_read_only() -> ReadOnlyData {
        ReadOnlyData {
            unique_node_id: NodeId48([0x00, 0xFD, 0xFF, 0xFF, 0xFF, 0x01]),
            program_id: *b"cStack1\0",
            base_firmware_version: 1,
        }
    }

    #[test]
    fn fresh_image_starts_unconfigured_with_no_valid_domains() {
        let image = ConfigImage::fresh(sample_read_only());
        assert_eq!(image.state, NodeState::NoApplUnconfig);
        assert!(!image.any_domain_valid());
    }

    #[test]
    fn recompute_checksum_is_deterministic() {
        let mut image = ConfigImage::fresh(sample_read_only());
        let first = image.checksum;
        image.recompute_checksum();
        assert_eq!(image.checksum, first);
    }

    #[test]
    fn checksum_changes_when_domain_mutated() {
        let mut image = ConfigImage::fresh(sample_read_only());
        let before = image.checksum;
        image.domain_mut(0).unwrap().subnet = 7;
        image.recompute_checksum();
        assert_ne!(image.checksum, before);
    }
}
