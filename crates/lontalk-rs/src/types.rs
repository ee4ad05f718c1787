// crates/lontalk-rs/src/types.rs
//! Primitive wire types and protocol-wide constants (EIA-709.1 §6/GLOSSARY).

use core::convert::TryFrom;

/// Alias for UNSIGNED8.
pub type UNSIGNED8 = u8;
/// Alias for UNSIGNED16.
pub type UNSIGNED16 = u16;
/// Alias for UNSIGNED32.
pub type UNSIGNED32 = u32;

/// A 48-bit globally unique Neuron ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId48(pub [u8; 6]);

impl NodeId48 {
    pub const UNASSIGNED: NodeId48 = NodeId48([0; 6]);

    pub fn is_unassigned(&self) -> bool {
        self.0 == [0; 6]
    }
}

/// Sentinel `DomainRef` value meaning "the receive-side flex-domain tag"
/// (GLOSSARY: Flex domain).
pub const FLEX_DOMAIN: u8 = 0xFF;

/// Maximum number of domain table entries a node may hold.
pub const MAX_DOMAINS: usize = 2;

/// Maximum number of address table entries.
pub const MAX_ADDRESS_TABLE_ENTRIES: usize = 15;

/// Eviction age for a TID-table entry (§3, §4.6): 24 seconds.
pub const TID_TABLE_ENTRY_TTL_MS: u32 = 24_000;

/// Selects which index of the local domain table (or the flex-domain
/// sentinel) an outbound PDU is associated with (§3 "Domain selection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRef {
    Index(u8),
    Flex,
}

/// The five addressing modes of §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Broadcast { subnet: u8 },
    Multicast { group: u8 },
    SubnetNode { subnet: u8, node: u8 },
    /// Shares `addrFmt == 2` with `SubnetNode`; distinguished only by the
    /// source-node byte's `selField` bit (§4.4). The destination field
    /// carries `{group, member}` instead of `{subnet, node}`.
    MulticastAck { group: u8, member: u8 },
    UniqueNodeId { subnet: u8, id: NodeId48 },
}

impl AddressMode {
    /// The 2-bit `addrFmt` field carried in the NPDU header (§6).
    pub fn addr_fmt(&self) -> u8 {
        match self {
            AddressMode::Broadcast { .. } => 0,
            AddressMode::Multicast { .. } => 1,
            AddressMode::SubnetNode { .. } | AddressMode::MulticastAck { .. } => 2,
            AddressMode::UniqueNodeId { .. } => 3,
        }
    }
}

/// Addressing mode stored in an `AddrTableEntry` (§3, §6), distinct from
/// `AddressMode` in that it carries no address data of its own: the data
/// lives alongside it in the table entry's other fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressModeTag {
    Broadcast = 0,
    Group = 1,
    SubnetNode = 2,
    MulticastAck = 3,
    UniqueNodeId = 4,
}

impl TryFrom<u8> for AddressModeTag {
    type Error = InvalidEnumValueError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AddressModeTag::Broadcast),
            1 => Ok(AddressModeTag::Group),
            2 => Ok(AddressModeTag::SubnetNode),
            3 => Ok(AddressModeTag::MulticastAck),
            4 => Ok(AddressModeTag::UniqueNodeId),
            _ => Err(InvalidEnumValueError),
        }
    }
}

/// Network-layer PDU taxonomy (§3 "PDU taxonomy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    Tpdu = 0,
    Spdu = 1,
    AuthPdu = 2,
    Apdu = 3,
}

impl TryFrom<u8> for PduType {
    type Error = InvalidEnumValueError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0b11 {
            0 => Ok(PduType::Tpdu),
            1 => Ok(PduType::Spdu),
            2 => Ok(PduType::AuthPdu),
            3 => Ok(PduType::Apdu),
            _ => Err(InvalidEnumValueError),
        }
    }
}

/// Generic "value was not a legal enum discriminant" error used by several
/// small `TryFrom` conversions in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidEnumValueError;

/// Error produced when a domain length code (2-bit field) doesn't map to a
/// valid byte count (§3 "Domain length is encoded as 2 bits").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLengthError(pub u8);

/// Encodes a domain byte-length (0/1/3/6) into its 2-bit wire code.
pub fn encode_domain_len(len: u8) -> Result<u8, DomainLengthError> {
    match len {
        0 => Ok(0),
        1 => Ok(1),
        3 => Ok(2),
        6 => Ok(3),
        other => Err(DomainLengthError(other)),
    }
}

/// Decodes a 2-bit domain length code into its byte count.
pub fn decode_domain_len(code: u8) -> Result<u8, DomainLengthError> {
    match code & 0b11 {
        0 => Ok(0),
        1 => Ok(1),
        2 => Ok(3),
        3 => Ok(6),
        _ => unreachable!(),
    }
}

/// Program state, as stored in persistent configuration (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    NoApplUnconfig = 0,
    ApplUnconfig = 1,
    ConfigOnline = 2,
    ConfigOffline = 3,
}

impl TryFrom<u8> for NodeState {
    type Error = InvalidEnumValueError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeState::NoApplUnconfig),
            1 => Ok(NodeState::ApplUnconfig),
            2 => Ok(NodeState::ConfigOnline),
            3 => Ok(NodeState::ConfigOffline),
            _ => Err(InvalidEnumValueError),
        }
    }
}

/// Cause of the most recent reset, reported by ND_QUERY_STATUS (§4.7, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetCause {
    PowerUpReset = 0,
    ExternalReset = 1,
    SoftwareReset = 2,
    Cleared = 3,
}
