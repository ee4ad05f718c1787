// crates/lontalk-rs/src/config/memory.rs
//! Flattens the persistent image into the single contiguous byte space that
//! `READ_MEMORY`/`WRITE_MEMORY`/`QUERY_ID`'s memory-match window address
//! (spec §4.7, §6 "Persistent state layout... the NM absolute-memory window
//! depends on this order").

use super::{AddrTableEntry, ConfigImage, Domain, NvAliasEntry, NvConfigEntry};
use crate::hal::LonError;
use crate::types::{AddressModeTag, NodeState, ResetCause};
use alloc::vec::Vec;
use core::convert::TryFrom;

const READ_ONLY_LEN: usize = 6 + 8 + 1;
const CONFIG_DATA_LEN: usize = 8 + 4;
const DOMAIN_LEN: usize = 6 + 1 + 1 + 1 + 6 + 1;
const ADDR_ENTRY_LEN: usize = 9;
const NV_CONFIG_LEN: usize = 9;
const NV_ALIAS_LEN: usize = 5;
const TRAILER_LEN: usize = 4 + 1 + 1 + 2;

/// Byte offset where the config-relative window starts (end of read-only
/// data), used by `READ_MEMORY`/`WRITE_MEMORY`'s `mode` base selection.
pub fn config_relative_base(_image: &ConfigImage) -> usize {
    READ_ONLY_LEN
}

/// Serializes the whole persistent image in `eep` field order.
pub fn to_bytes(image: &ConfigImage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&image.read_only.unique_node_id.0);
    out.extend_from_slice(&image.read_only.program_id);
    out.push(image.read_only.base_firmware_version);

    out.push(image.config.two_domains as u8);
    out.push(image.config.nm_auth as u8);
    out.push(image.config.comm_scale);
    out.push(image.config.beta2_scale);
    out.push(image.config.node_priority);
    out.push(image.config.channel_priorities);
    out.push(image.config.rx_pad_raw);
    out.push(image.config.tx_pad_raw);
    out.extend_from_slice(&image.config.nts.to_be_bytes());

    for d in &image.domains {
        out.extend_from_slice(&d.id);
        out.push(d.len);
        out.push(d.subnet);
        out.push(d.node);
        out.extend_from_slice(&d.key);
        out.push(d.valid as u8);
    }

    for a in &image.addr_table {
        out.push(a.mode as u8);
        out.push(a.domain_index);
        out.push(a.subnet);
        out.push(a.node_or_group);
        out.push(a.repeat_timer);
        out.push(a.retry_count);
        out.push(a.receive_timer);
        out.push(a.transmit_timer);
        out.push(a.group_size);
    }

    for nv in &image.nv_config {
        out.push(nv.direction_is_output as u8);
        out.extend_from_slice(&nv.selector.to_be_bytes());
        out.push(nv.priority as u8);
        out.push(nv.service);
        out.push(nv.auth as u8);
        out.push(nv.addr_index);
        out.push(nv.turnaround as u8);
        out.push(nv.length);
    }

    for alias in &image.nv_alias {
        out.extend_from_slice(&alias.primary_index.to_be_bytes());
        out.extend_from_slice(&alias.selector.to_be_bytes());
        out.push(alias.addr_index);
    }

    out.extend_from_slice(&image.error_log_len.to_be_bytes());
    out.push(image.state as u8);
    out.push(image.reset_cause as u8);
    out.extend_from_slice(&image.checksum.to_be_bytes());

    out
}

/// Reads `len` bytes starting at absolute `offset` out of the flattened
/// image. The `BASE_FIRMWARE_VERSION` special case for offset 0 / `len == 1`
/// (spec §4.7) is applied by the NM `READ_MEMORY` handler before it falls
/// back to this function, not here.
pub fn read_at(image: &ConfigImage, offset: u16, len: u8) -> Result<Vec<u8>, LonError> {
    let bytes = to_bytes(image);
    let start = offset as usize;
    let end = start + len as usize;
    bytes.get(start..end).map(|s| s.to_vec()).ok_or(LonError::AccessDenied)
}

/// Writes `data` starting at absolute `offset` back into the typed image.
/// Only offsets inside `ConfigData`/the domain/address/NV tables are legal
/// (spec §4.7 "writes respect readWriteProtect which restricts writes to
/// the configData window").
pub fn write_at(image: &mut ConfigImage, offset: u16, data: &[u8]) -> Result<(), LonError> {
    let config_start = READ_ONLY_LEN;
    let domains_start = config_start + CONFIG_DATA_LEN;
    let addr_start = domains_start + DOMAIN_LEN * super::MAX_DOMAINS;
    let nv_start = addr_start + ADDR_ENTRY_LEN * super::MAX_ADDRESS_TABLE_ENTRIES;
    let alias_start = nv_start + NV_CONFIG_LEN * image.nv_config.len();
    let trailer_start = alias_start + NV_ALIAS_LEN * image.nv_alias.len();
    let end_of_image = trailer_start + TRAILER_LEN;

    let start = offset as usize;
    let end = start + data.len();
    if start < config_start || end > end_of_image {
        return Err(LonError::AccessDenied);
    }

    let mut bytes = to_bytes(image);
    bytes[start..end].copy_from_slice(data);
    *image = from_bytes(&bytes, image.nv_config.len(), image.nv_alias.len())?;
    Ok(())
}

fn from_bytes(bytes: &[u8], nv_config_len: usize, nv_alias_len: usize) -> Result<ConfigImage, LonError> {
    let mut cursor = 0usize;
    let mut take = |n: usize| -> Result<&[u8], LonError> {
        let slice = bytes.get(cursor..cursor + n).ok_or(LonError::BufferTooShort)?;
        cursor += n;
        Ok(slice)
    };

    let mut unique_node_id = [0u8; 6];
    unique_node_id.copy_from_slice(take(6)?);
    let mut program_id = [0u8; 8];
    program_id.copy_from_slice(take(8)?);
    let base_firmware_version = take(1)?[0];

    let cfg_bytes = take(CONFIG_DATA_LEN)?;
    let config = super::ConfigData {
        two_domains: cfg_bytes[0] != 0,
        nm_auth: cfg_bytes[1] != 0,
        comm_scale: cfg_bytes[2],
        beta2_scale: cfg_bytes[3],
        node_priority: cfg_bytes[4],
        channel_priorities: cfg_bytes[5],
        rx_pad_raw: cfg_bytes[6],
        tx_pad_raw: cfg_bytes[7],
        nts: u32::from_be_bytes([cfg_bytes[8], cfg_bytes[9], cfg_bytes[10], cfg_bytes[11]]),
    };

    let mut domains = [Domain::INVALID; super::MAX_DOMAINS];
    for d in domains.iter_mut() {
        let raw = take(DOMAIN_LEN)?;
        let mut id = [0u8; 6];
        id.copy_from_slice(&raw[0..6]);
        let mut key = [0u8; 6];
        key.copy_from_slice(&raw[9..15]);
        *d = Domain { id, len: raw[6], subnet: raw[7], node: raw[8], key, valid: raw[15] != 0 };
    }

    let mut addr_table = [AddrTableEntry::default(); super::MAX_ADDRESS_TABLE_ENTRIES];
    for a in addr_table.iter_mut() {
        let raw = take(ADDR_ENTRY_LEN)?;
        *a = AddrTableEntry {
            mode: AddressModeTag::try_from(raw[0]).map_err(|_| LonError::InvalidEnumValue)?,
            domain_index: raw[1],
            subnet: raw[2],
            node_or_group: raw[3],
            repeat_timer: raw[4],
            retry_count: raw[5],
            receive_timer: raw[6],
            transmit_timer: raw[7],
            group_size: raw[8],
        };
    }

    let mut nv_config = Vec::with_capacity(nv_config_len);
    for _ in 0..nv_config_len {
        let raw = take(NV_CONFIG_LEN)?;
        nv_config.push(NvConfigEntry {
            direction_is_output: raw[0] != 0,
            selector: u16::from_be_bytes([raw[1], raw[2]]),
            priority: raw[3] != 0,
            service: raw[4],
            auth: raw[5] != 0,
            addr_index: raw[6],
            turnaround: raw[7] != 0,
            length: raw[8],
        });
    }

    let mut nv_alias = Vec::with_capacity(nv_alias_len);
    for _ in 0..nv_alias_len {
        let raw = take(NV_ALIAS_LEN)?;
        nv_alias.push(NvAliasEntry {
            primary_index: u16::from_be_bytes([raw[0], raw[1]]),
            selector: u16::from_be_bytes([raw[2], raw[3]]),
            addr_index: raw[4],
        });
    }

    let trailer = take(TRAILER_LEN)?;
    let error_log_len = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let state = NodeState::try_from(trailer[4]).map_err(|_| LonError::InvalidEnumValue)?;
    let reset_cause = match trailer[5] {
        0 => ResetCause::PowerUpReset,
        1 => ResetCause::ExternalReset,
        2 => ResetCause::SoftwareReset,
        _ => ResetCause::Cleared,
    };
    let checksum = u16::from_be_bytes([trailer[6], trailer[7]]);

    Ok(ConfigImage {
        read_only: super::ReadOnlyData { unique_node_id: crate::types::NodeId48(unique_node_id), program_id, base_firmware_version },
        config,
        domains,
        addr_table,
        nv_config,
        nv_alias,
        error_log_len,
        state,
        reset_cause,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadOnlyData;
    use crate::types::NodeId48;

    fn sample() -> ConfigImage {
        ConfigImage::fresh(ReadOnlyData {
            unique_node_id: NodeId48([0x00, 0xFD, 0xFF, 0xFF, 0xFF, 0x01]),
            program_id: *b"cStack1\0",
            base_firmware_version: 1,
        })
    }

    #[test]
    fn absolute_zero_reads_the_stored_byte() {
        // The BASE_FIRMWARE_VERSION special case for a length-1 read at
        // absolute offset 0 is applied by the NM `READ_MEMORY` handler
        // (`app/nm.rs::handle_read_memory`), not by `read_at` itself: at
        // this layer, offset 0 is just the first byte of the flattened
        // image (the first `unique_node_id` byte).
        let image = sample();
        assert_eq!(read_at(&image, 0, 1).unwrap(), alloc::vec![0x00]);
    }

    #[test]
    fn write_then_read_round_trips_within_config_window() {
        let mut image = sample();
        let offset = config_relative_base(&image) as u16;
        write_at(&mut image, offset, &[1]).unwrap();
        assert!(image.config.two_domains);
        assert_eq!(read_at(&image, offset, 1).unwrap(), alloc::vec![1]);
    }

    #[test]
    fn write_before_config_window_is_denied() {
        let mut image = sample();
        assert!(write_at(&mut image, 0, &[0xFF]).is_err());
    }
}
