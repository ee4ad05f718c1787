// crates/lontalk-rs/src/network/mod.rs
//! Network layer: NPDU header encode/decode, address-mode handling, domain
//! filtering, self-loop suppression, flex-domain acceptance (spec §4.4),
//! grounded in `original_source/lcs_network.c`'s `NWSend`/`NWReceive`.

use crate::hal::LonError;
pub use crate::types::AddressMode;
use crate::types::{decode_domain_len, encode_domain_len, DomainRef, NodeId48, PduType, FLEX_DOMAIN};
use alloc::vec::Vec;
use core::convert::TryFrom;

/// A decoded network-layer PDU header plus its enclosed payload slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu<'a> {
    pub pdu_type: PduType,
    pub address: AddressMode,
    pub src_subnet: u8,
    pub src_node: u8,
    /// `true` when the source-node byte's `selField` bit is set. Only
    /// meaningful to disambiguate `addrFmt == 2` (`SubnetNode` vs
    /// `MulticastAck`) and the outbound flex-domain convention (§4.4).
    pub sel_field: bool,
    pub domain: &'a [u8],
    pub payload: &'a [u8],
}

/// Parameters needed to encode an outbound NPDU; owns its domain bytes so
/// callers building one from a `DomainRef` don't need a borrow of the
/// config table to outlive the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpduBuilder {
    pub pdu_type: PduType,
    pub address: AddressMode,
    pub src_subnet: u8,
    pub src_node: u8,
    pub domain: Vec<u8>,
}

fn dest_field_len(addr: &AddressMode) -> usize {
    match addr {
        AddressMode::Broadcast { .. } => 1,
        AddressMode::Multicast { .. } => 1,
        AddressMode::SubnetNode { .. } => 2,
        AddressMode::MulticastAck { .. } => 2,
        AddressMode::UniqueNodeId { .. } => 7,
    }
}

impl NpduBuilder {
    /// Encodes the NPDU into `out`, returning the number of bytes written.
    /// `domain_ref` selects whether the real domain bytes are emitted or the
    /// flex-domain convention (source subnet/node forced to 0, `selField`
    /// forced to 1, §4.4 "On transmit, a PDU addressed via FLEX_DOMAIN...").
    pub fn encode(&self, domain_ref: DomainRef, payload: &[u8], out: &mut Vec<u8>) -> Result<(), LonError> {
        let is_flex = matches!(domain_ref, DomainRef::Flex);
        let domain_len = if is_flex { 0 } else { self.domain.len() as u8 };
        let domain_len_code = encode_domain_len(domain_len)?;

        let header = (self.pdu_type as u8) << 4 | self.address.addr_fmt() << 2 | domain_len_code;
        out.push(header);

        if is_flex {
            out.push(0);
            out.push(0x80);
        } else {
            out.push(self.src_subnet);
            let sel_field = matches!(self.address, AddressMode::MulticastAck { .. });
            out.push((sel_field as u8) << 7 | (self.src_node & 0x7F));
        }

        match &self.address {
            AddressMode::Broadcast { subnet } => out.push(*subnet),
            AddressMode::Multicast { group } => out.push(*group),
            AddressMode::SubnetNode { subnet, node } => {
                out.push(*subnet);
                out.push(*node);
            }
            AddressMode::MulticastAck { group, member } => {
                out.push(*group);
                out.push(*member);
            }
            AddressMode::UniqueNodeId { subnet, id } => {
                out.push(*subnet);
                out.extend_from_slice(&id.0);
            }
        }

        if !is_flex {
            out.extend_from_slice(&self.domain);
        }
        out.extend_from_slice(payload);
        Ok(())
    }
}

/// Decodes an NPDU from `frame`. Returns the header fields and slices into
/// `frame` for the domain bytes and enclosed payload (no copying).
pub fn decode(frame: &[u8]) -> Result<Npdu<'_>, LonError> {
    let &header = frame.first().ok_or(LonError::InvalidFrame)?;
    let protocol_version = header >> 6;
    if protocol_version != 0 {
        return Err(LonError::InvalidFrame);
    }
    let pdu_type = PduType::try_from((header >> 4) & 0b11)?;
    let addr_fmt = (header >> 2) & 0b11;
    let domain_len = decode_domain_len(header & 0b11)?;

    let mut cursor = 1usize;
    let src_subnet = *frame.get(cursor).ok_or(LonError::BufferTooShort)?;
    cursor += 1;
    let src_node_byte = *frame.get(cursor).ok_or(LonError::BufferTooShort)?;
    cursor += 1;
    let sel_field = src_node_byte & 0x80 != 0;
    let src_node = src_node_byte & 0x7F;

    let dest_len = match addr_fmt {
        0 => 1,
        1 => 1,
        2 => 2,
        3 => 7,
        _ => unreachable!(),
    };
    let dest = frame.get(cursor..cursor + dest_len).ok_or(LonError::BufferTooShort)?;
    cursor += dest_len;

    let address = match addr_fmt {
        0 => AddressMode::Broadcast { subnet: dest[0] },
        1 => AddressMode::Multicast { group: dest[0] },
        2 => {
            if sel_field {
                AddressMode::MulticastAck { group: dest[0], member: dest[1] }
            } else {
                AddressMode::SubnetNode { subnet: dest[0], node: dest[1] }
            }
        }
        3 => {
            let mut id = [0u8; 6];
            id.copy_from_slice(&dest[1..7]);
            AddressMode::UniqueNodeId { subnet: dest[0], id: NodeId48(id) }
        }
        _ => unreachable!(),
    };
    let _ = dest_field_len(&address); // sanity: kept in sync with the match above

    let domain = frame
        .get(cursor..cursor + domain_len as usize)
        .ok_or(LonError::BufferTooShort)?;
    cursor += domain_len as usize;

    let payload = &frame[cursor..];

    Ok(Npdu { pdu_type, address, src_subnet, src_node, sel_field, domain, payload })
}

/// Result of running the receive-side filter chain (§4.4 "On receive,
/// filter order is...").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Accept,
    /// Dropped and, if it was addressed via a now-invalid domain and was an
    /// APDU, the caller should still emit a failed completion event.
    Drop,
}

/// Node-local identity needed to run the receive filter chain.
pub struct LocalIdentity<'a> {
    pub unique_node_id: NodeId48,
    pub configured: bool,
    /// `(subnet, node)` for each configured domain index, parallel to the
    /// node's domain table.
    pub domains: &'a [(u8, u8)],
}

/// Runs the §4.4 receive-side filter chain against a decoded NPDU that was
/// tagged with `matched_domain` (`Some(index)` for a local-domain match,
/// `None` for flex domain).
pub fn filter_receive(npdu: &Npdu<'_>, matched_domain: Option<u8>, local: &LocalIdentity<'_>) -> FilterOutcome {
    let is_flex = matched_domain.is_none();

    if is_flex {
        if local.configured {
            return match npdu.address {
                AddressMode::UniqueNodeId { id, .. } if id == local.unique_node_id => FilterOutcome::Accept,
                _ => FilterOutcome::Drop,
            };
        }
        return match npdu.address {
            AddressMode::Broadcast { .. } => FilterOutcome::Accept,
            AddressMode::UniqueNodeId { id, .. } if id == local.unique_node_id => FilterOutcome::Accept,
            _ => FilterOutcome::Drop,
        };
    }

    let idx = matched_domain.unwrap() as usize;
    if let Some(&(own_subnet, own_node)) = local.domains.get(idx) {
        if npdu.src_subnet == own_subnet && npdu.src_node == own_node {
            return FilterOutcome::Drop;
        }
    }

    if !local.configured {
        return match npdu.address {
            AddressMode::Broadcast { .. } => FilterOutcome::Accept,
            AddressMode::UniqueNodeId { id, .. } if id == local.unique_node_id => FilterOutcome::Accept,
            _ => FilterOutcome::Drop,
        };
    }

    FilterOutcome::Accept
}

/// Matches a decoded NPDU's domain bytes against the node's domain table,
/// returning the matching index or `None` for flex domain (§3 "Domain
/// selection").
pub fn match_domain(npdu_domain: &[u8], table: &[(&[u8], bool); 2]) -> Option<u8> {
    for (idx, (bytes, valid)) in table.iter().enumerate() {
        if *valid && *bytes == npdu_domain {
            return Some(idx as u8);
        }
    }
    None
}

pub const FLEX_DOMAIN_SENTINEL: u8 = FLEX_DOMAIN;
