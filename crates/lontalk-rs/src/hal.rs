// crates/lontalk-rs/src/hal.rs
//! Hardware-abstraction traits: the transceiver link and persistent
//! configuration storage. Everything hardware-specific (timer/GPIO/SPI
//! register drivers) lives on the other side of these traits and is out of
//! scope here (spec §1, §9).

use crate::config::ConfigImage;
use crate::types::{DomainLengthError, InvalidEnumValueError};
use alloc::collections::BTreeMap;
use core::fmt;

/// Portable error type for the whole stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LonError {
    /// The provided buffer is too small for the operation.
    BufferTooShort,
    /// A received frame is fundamentally malformed.
    InvalidFrame,
    /// A value in a frame is not a legal enum discriminant.
    InvalidEnumValue,
    /// The 2-bit domain-length code didn't map to a legal byte count.
    InvalidDomainLength(u8),
    /// Node/domain/address-table index out of range.
    InvalidIndex,
    /// Authentication was required but missing or incorrect.
    AuthenticationMismatch,
    /// The addressed domain-table entry is not valid.
    InvalidDomain,
    /// A write targeted a read-only region, or a read exceeded its window.
    AccessDenied,
    /// No in-progress transaction matches.
    NoTransaction,
    /// A transaction of that priority is already in progress.
    TransactionBusy,
    /// The TID table has no evictable entry and is full.
    TidTableFull,
    /// Backing storage failed.
    StorageError(&'static str),
    /// Internal logic error, message for debugging only.
    InternalError(&'static str),
}

impl fmt::Display for LonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooShort => write!(f, "buffer too short"),
            Self::InvalidFrame => write!(f, "invalid frame"),
            Self::InvalidEnumValue => write!(f, "invalid enum value in frame"),
            Self::InvalidDomainLength(v) => write!(f, "invalid domain length code: {}", v),
            Self::InvalidIndex => write!(f, "index out of range"),
            Self::AuthenticationMismatch => write!(f, "authentication mismatch"),
            Self::InvalidDomain => write!(f, "invalid domain"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::NoTransaction => write!(f, "no matching transaction"),
            Self::TransactionBusy => write!(f, "transaction already in progress"),
            Self::TidTableFull => write!(f, "TID table full"),
            Self::StorageError(s) => write!(f, "storage error: {}", s),
            Self::InternalError(s) => write!(f, "internal error: {}", s),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LonError {}

impl From<InvalidEnumValueError> for LonError {
    fn from(_: InvalidEnumValueError) -> Self {
        LonError::InvalidEnumValue
    }
}

impl From<DomainLengthError> for LonError {
    fn from(e: DomainLengthError) -> Self {
        LonError::InvalidDomainLength(e.0)
    }
}

/// Bit layout of an SPM receive frame (§6 "MAC / SPM framing").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxFrame {
    pub set_tx_flag: bool,
    pub clr_tx_req_flag: bool,
    pub rx_data_valid: bool,
    pub tx_data_cts: bool,
    pub set_coll_det: bool,
    pub rx_flag: bool,
    pub rw_ack: bool,
    pub tx_on: bool,
    pub data: u8,
}

/// Bit layout of an SPM transmit frame (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFrame {
    pub tx_flag: bool,
    pub tx_req_flag: bool,
    pub tx_data_valid: bool,
    pub tx_addr_rw: bool,
    pub tx_addr: u8,
    pub data: u8,
}

/// Transceiver-reported signal-strength/quality snapshot, attached to
/// received frames and surfaced via `QUERY_XCVR`/`QUERY_XCVR_BIDIR` (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XcvrParams {
    pub signal_strength: u8,
    pub bidirectional: bool,
}

/// Abstracts the special-purpose transceiver accessed through a framed SPI
/// exchange (§9 "Volatile pointer constants...").
pub trait XcvrLink {
    /// Enables the transceiver (brings it out of reset/power-down).
    fn enable(&mut self);
    /// Disables the transceiver.
    fn disable(&mut self);
    /// Issues a hardware reset and re-pushes the six configuration registers.
    fn reset_hard(&mut self, comm_params: &[u8; 6]);
    /// Exchanges one 16-bit SPM frame, sending `tx` and returning what the
    /// transceiver clocked back.
    fn exchange(&mut self, tx: TxFrame) -> RxFrame;
    /// Current channel backlog estimate as reported by the transceiver, if it
    /// exposes one directly (otherwise the MAC's own estimate is used).
    fn backlog_hint(&self) -> Option<u8>;
    /// Most recent transceiver parameter snapshot.
    fn xcvr_params(&self) -> XcvrParams;
}

/// Abstracts non-volatile storage of the persistent configuration image
/// (§3 "Node configuration"), analogous to the teacher's
/// `ObjectDictionaryStorage`.
pub trait ConfigStore {
    /// Loads the persisted image, if any has ever been saved.
    fn load(&mut self) -> Result<Option<ConfigImage>, LonError>;
    /// Persists the given image.
    fn save(&mut self, image: &ConfigImage) -> Result<(), LonError>;
    /// Erases any persisted image.
    fn clear(&mut self) -> Result<(), LonError>;
}

/// In-memory `ConfigStore` used by tests and simple hosted applications.
#[derive(Debug, Default)]
pub struct MemConfigStore {
    image: Option<ConfigImage>,
}

impl ConfigStore for MemConfigStore {
    fn load(&mut self) -> Result<Option<ConfigImage>, LonError> {
        Ok(self.image.clone())
    }

    fn save(&mut self, image: &ConfigImage) -> Result<(), LonError> {
        self.image = Some(image.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), LonError> {
        self.image = None;
        Ok(())
    }
}

/// Error-log entry kinds (§7 "error log"), numbered after the original
/// stack's `lcs_node.h` error taxonomy.
pub const ERR_WRITE_PAST_END_OF_APPL_BUFFER: u8 = 4;
pub const ERR_INVALID_ADDR_TABLE_INDEX: u8 = 19;
pub const ERR_INVALID_NV_INDEX: u8 = 22;
pub const ERR_AUTHENTICATION_MISMATCH: u8 = 23;
pub const ERR_TRANSACTION_ALLOCATION_FAILED: u8 = 24;
pub const ERR_LINK_LAYER_REJECTED_FRAME: u8 = 25;
pub const ERR_NETWORK_LAYER_REJECTED_FRAME: u8 = 26;
pub const ERR_MAC_TRANSMIT_QUEUE_FULL: u8 = 27;

/// Historical error-log ring, recorded by `LCS_RecordError` style callers
/// (§7). Kept generic over the error taxonomy so layers log their own kinds.
#[derive(Debug, Default, Clone)]
pub struct ErrorLog {
    entries: BTreeMap<u32, u8>,
    next_seq: u32,
}

impl ErrorLog {
    pub fn record(&mut self, kind: u8) {
        self.entries.insert(self.next_seq, kind);
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_seq = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
