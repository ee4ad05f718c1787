//! A scripted transceiver link: whatever `RxFrame`s are queued ahead of time
//! are handed back one per [`lontalk_rs::hal::XcvrLink::exchange`] call, and
//! every byte written with `tx_data_valid` set is captured for inspection.
//! Mirrors the teacher's `tests/simulator/interface.rs` `SimulatedInterface`
//! (a buffered in-memory stand-in for a real network/transceiver driver),
//! adapted from framed Ethernet frames to the SPM byte-at-a-time exchange of
//! spec §6.

use lontalk_rs::hal::{RxFrame, TxFrame, XcvrLink, XcvrParams};
use std::collections::VecDeque;

#[derive(Default)]
pub struct MockXcvrLink {
    script: VecDeque<RxFrame>,
    sent: Vec<u8>,
    params: XcvrParams,
    enabled: bool,
}

impl MockXcvrLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one `RxFrame` to be returned by a future `exchange` call.
    pub fn push_rx(&mut self, frame: RxFrame) {
        self.script.push_back(frame);
    }

    /// Queues an already link-framed byte sequence as a receive script: one
    /// `RxFrame` per byte with `rx_flag`/`rx_data_valid` set, followed by an
    /// idle frame marking end-of-frame (mirrors the MAC's own
    /// `received_frame_with_good_crc_is_delivered` unit test).
    pub fn push_framed(&mut self, framed: &[u8]) {
        for &b in framed {
            self.push_rx(RxFrame { rx_flag: true, rx_data_valid: true, data: b, ..Default::default() });
        }
        self.push_rx(RxFrame::default());
    }

    pub fn set_xcvr_params(&mut self, params: XcvrParams) {
        self.params = params;
    }

    pub fn sent_bytes(&self) -> &[u8] {
        &self.sent
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl XcvrLink for MockXcvrLink {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn reset_hard(&mut self, _comm_params: &[u8; 6]) {}

    fn exchange(&mut self, tx: TxFrame) -> RxFrame {
        if tx.tx_data_valid {
            self.sent.push(tx.data);
        }
        self.script.pop_front().unwrap_or_default()
    }

    fn backlog_hint(&self) -> Option<u8> {
        None
    }

    fn xcvr_params(&self) -> XcvrParams {
        self.params
    }
}
