//! Black-box test harness built entirely on [`lontalk_rs`]'s public API,
//! mirroring the teacher's `tests/simulator/mod.rs` (`VirtualNetwork` +
//! `NodeHarness`): a helper to stand up a node and helpers to hand it fully
//! framed LPDUs without poking crate-private state.

pub mod xcvr;

pub use xcvr::MockXcvrLink;

use lontalk_rs::config::{ConfigImage, ReadOnlyData};
use lontalk_rs::hal::{MemConfigStore, RxFrame};
use lontalk_rs::link::{self, LpduHeader};
use lontalk_rs::mac::MacTimerConfig;
use lontalk_rs::network::{AddressMode, NpduBuilder};
use lontalk_rs::node::Node;
use lontalk_rs::tsa::{self, TsaHeader};
use lontalk_rs::types::{DomainRef, NodeId48, NodeState, PduType};

pub type TestNode = Node<MockXcvrLink, MemConfigStore>;

/// The domain/subnet/node identity every scenario node boots with, matching
/// spec §8's example traces: domain `{2C}`, subnet 1, node 5.
pub fn fresh_config() -> ConfigImage {
    let mut image = ConfigImage::fresh(ReadOnlyData {
        unique_node_id: NodeId48([0x00, 0xFD, 0xFF, 0xFF, 0xFF, 0x01]),
        program_id: *b"cStack1\0",
        base_firmware_version: 1,
    });
    image.domains[0].id = [0x2C, 0, 0, 0, 0, 0];
    image.domains[0].len = 1;
    image.domains[0].subnet = 1;
    image.domains[0].node = 5;
    image.domains[0].valid = true;
    image.state = NodeState::ConfigOnline;
    image.recompute_checksum();
    image
}

fn timer_cfg() -> MacTimerConfig {
    MacTimerConfig { comm_scale: 1, beta2_scale: 1, node_priority: 0, channel_priorities: 0, rx_pad_raw: 0, tx_pad_raw: 0, nts: 1 }
}

/// Boots a node the way a host application would: `Node::boot` over a blank
/// `MemConfigStore` (so it falls back to `fresh_config()`) and a scriptable
/// [`MockXcvrLink`].
pub fn boot_node() -> TestNode {
    Node::boot(MemConfigStore::default(), MockXcvrLink::new(), fresh_config(), timer_cfg(), [0; 6], 1, 18, 7).expect("boot")
}

/// Builds a fully link-framed LPDU carrying one TSA-wrapped APDU addressed
/// to the node under test (subnet 1, node 5) from `src_subnet`/`src_node`,
/// mirroring `node.rs`'s own `build_nd_query_status_frame` test helper.
pub fn frame_request(tid: u8, apdu: &[u8], pdu_type: PduType, src_subnet: u8, src_node: u8) -> Vec<u8> {
    let header = TsaHeader { response: false, tid };
    let payload = tsa::encode_body(header, apdu);
    let builder = NpduBuilder {
        pdu_type,
        address: AddressMode::SubnetNode { subnet: 1, node: 5 },
        src_subnet,
        src_node,
        domain: vec![0x2C],
    };
    let mut npdu = Vec::new();
    builder.encode(DomainRef::Index(0), &payload, &mut npdu).unwrap();
    link::frame(&npdu, LpduHeader { priority: false, alt_path: false })
}

/// Delivers a fully framed LPDU to `node` via the public `mac_tick`/`RxFrame`
/// surface, one byte per tick, followed by an idle tick to close the frame.
pub fn deliver_framed(node: &mut TestNode, framed: &[u8]) {
    let mut now = 0u64;
    for &b in framed {
        node.mac_tick(RxFrame { rx_flag: true, rx_data_valid: true, data: b, ..Default::default() }, now);
        now += 1;
    }
    node.mac_tick(RxFrame::default(), now);
}

/// Runs one full §5 scheduler sweep (minus `phy_send`/`mac_tick`, which the
/// caller drives explicitly so it can inject scripted receive traffic).
pub fn run_sweep(node: &mut TestNode, now_ms: u64) {
    node.link_receive();
    node.network_receive();
    node.tsa_receive(now_ms);
    node.app_receive();
    node.app_send(now_ms);
    node.tsa_send();
    node.network_send(now_ms);
    node.link_send();
}
