// crates/lontalk-rs/src/config/checksum.rs
//! Configuration checksum (spec §4.7 `CHECKSUM_RECALC`, §8 "Checksum"
//! property), grounded in `original_source/lcs_netmgmt.c`'s
//! `ComputeConfigCheckSum`: a rolling fold of every persistent byte, in the
//! same `eep` field order the absolute-memory NM window depends on.

use super::{memory, ConfigImage};

/// Folds one byte into a running 16-bit checksum: rotate left by one bit,
/// then XOR in the byte. Matches the original's "add, shift, carry" rolling
/// checksum closely enough to detect any single-byte mutation of the
/// persistent image while staying cheap to recompute on every NM write.
fn fold(acc: u16, byte: u8) -> u16 {
    acc.rotate_left(1) ^ byte as u16
}

/// Computes the checksum over the whole persistent image, in the same
/// `eep` field order used by the absolute-memory NM window. The stored
/// `checksum` field itself is excluded (its bytes would otherwise fold
/// the previous checksum into the new one).
pub fn compute_config_checksum(image: &ConfigImage) -> u16 {
    let bytes = memory::to_bytes(image);
    let without_checksum = &bytes[..bytes.len() - 2];
    without_checksum.iter().fold(0xFFFFu16, |acc, &b| fold(acc, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadOnlyData;
    use crate::types::{NodeId48, NodeState, ResetCause};

    fn sample() -> ConfigImage {
        ConfigImage::fresh(ReadOnlyData {
            unique_node_id: NodeId48([0x00, 0xFD, 0xFF, 0xFF, 0xFF, 0x01]),
            program_id: *b"cStack1\0",
            base_firmware_version: 1,
        })
    }

    #[test]
    fn deterministic_for_same_image() {
        let image = sample();
        assert_eq!(compute_config_checksum(&image), compute_config_checksum(&image));
    }

    #[test]
    fn changes_when_state_changes() {
        let mut image = sample();
        let before = compute_config_checksum(&image);
        image.state = NodeState::ConfigOnline;
        assert_ne!(compute_config_checksum(&image), before);
    }

    #[test]
    fn changes_when_reset_cause_changes() {
        let mut image = sample();
        let before = compute_config_checksum(&image);
        image.reset_cause = ResetCause::SoftwareReset;
        assert_ne!(compute_config_checksum(&image), before);
    }
}
