// crates/lontalk-rs/src/node.rs
//! Top-level node: wires MAC, link, network, TSA and application layers
//! together behind the §5 fixed-order cooperative scheduler sweep (`PHYSend
//! -> MAC tick -> LinkReceive -> NWReceive -> TSAReceive -> AppReceive ->
//! AppSend -> TSASend -> NWSend -> LinkSend`), grounded in the teacher's
//! `ControlledNode` (`node/cn/main.rs`): a single owning struct built with
//! `new`/`boot` and driven one frame at a time through explicit stage
//! methods rather than a hidden event loop.
//!
//! Each stage drains at most one item from its `BoundedQueue` input and
//! pushes at most one item to its output, per spec §4.1 ("items are
//! transferred by value between layers within one scheduler sweep").

use crate::app::{self, proxy::ForwardAddress, AppContext, AppOutcome};
use crate::config::ConfigImage;
use crate::hal::{
    ConfigStore, ErrorLog, LonError, RxFrame, TxFrame, XcvrLink, XcvrParams,
    ERR_LINK_LAYER_REJECTED_FRAME, ERR_MAC_TRANSMIT_QUEUE_FULL, ERR_NETWORK_LAYER_REJECTED_FRAME,
    ERR_TRANSACTION_ALLOCATION_FAILED,
};
use crate::link::{self, LinkFrame, LpduHeader};
use crate::log::{lon_info, lon_warn};
use crate::mac::{MacEngine, MacOutput, MacTimerConfig, TxPacket};
use crate::network::{self, AddressMode, FilterOutcome, LocalIdentity, NpduBuilder};
use crate::queue::BoundedQueue;
use crate::transaction::{DestSignature, TransactionControl};
use crate::tsa::{self, DuplicateTracker, PendingTransaction, RetryScheduler, TsaEvent, TsaHeader, TsaService};
use crate::types::{DomainRef, NodeState, PduType, ResetCause};
use alloc::vec;
use alloc::vec::Vec;

/// Depth of every inter-layer queue (spec §4.1 names no fixed size; eight
/// slots is generous for a single in-flight transaction per priority class).
const QUEUE_DEPTH: usize = 8;

/// Max number of TID-table signatures remembered at once (spec §4.6).
const TID_TABLE_CAPACITY: usize = 8;

/// A send target: an addressing mode plus which domain-table row (or the
/// flex-domain convention) frames it out under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: AddressMode,
    pub domain_ref: DomainRef,
}

fn address_key(addr: &AddressMode) -> u64 {
    match addr {
        AddressMode::Broadcast { subnet } => *subnet as u64,
        AddressMode::Multicast { group } => *group as u64,
        AddressMode::SubnetNode { subnet, node } => ((*subnet as u64) << 8) | *node as u64,
        AddressMode::MulticastAck { group, member } => 0x1_0000_0000 | ((*group as u64) << 8) | *member as u64,
        AddressMode::UniqueNodeId { subnet, id } => {
            let mut key = *subnet as u64;
            for b in id.0 {
                key = (key << 8) | b as u64;
            }
            key
        }
    }
}

fn forward_destination(address: ForwardAddress, domain_index: u8) -> Destination {
    let address = match address {
        ForwardAddress::Broadcast { subnet } => AddressMode::Broadcast { subnet },
        ForwardAddress::Group { group } => AddressMode::Multicast { group },
        ForwardAddress::SubnetNode { subnet, node } => AddressMode::SubnetNode { subnet, node },
    };
    Destination { address, domain_ref: DomainRef::Index(domain_index) }
}

/// A decoded, domain-filtered NPDU awaiting TSA unwrapping.
struct NetRx {
    pdu_type: PduType,
    address: AddressMode,
    src_subnet: u8,
    src_node: u8,
    domain_index: Option<u8>,
    priority: bool,
    alt_path: bool,
    payload: Vec<u8>,
}

/// One received, dispatch-ready application request.
struct AppRx {
    code: u8,
    body: Vec<u8>,
    priority: bool,
    alt_path: bool,
    tid: u8,
    pdu_type: PduType,
    source: DestSignature,
    reply_dest: Destination,
    domain_index: Option<u8>,
    arrival_group: Option<u8>,
}

/// A local application's request to transmit, before a TID is allocated.
struct AppSendItem {
    code: u8,
    body: Vec<u8>,
    dest: Destination,
    service: TsaService,
    priority: bool,
    alt_path: bool,
    proxy_reply_tag: Option<u32>,
}

struct TsaSendItem {
    item: AppSendItem,
    tid: u8,
}

struct RetryRegistration {
    tid: u8,
    service: TsaService,
    proxy_reply_tag: Option<u32>,
}

struct NetSendItem {
    payload: Vec<u8>,
    dest: Destination,
    pdu_type: PduType,
    priority: bool,
    alt_path: bool,
    retry: Option<RetryRegistration>,
}

struct LinkSendItem {
    npdu: Vec<u8>,
    priority: bool,
    alt_path: bool,
}

/// Outcome of one outbound APDU, surfaced to the embedding application (spec
/// §4.4 "a PDU addressed via a domain whose table entry is invalid is
/// dropped; if the PDU was an APDU, an application completion event with
/// success = false is still emitted", §7 "completion events... always
/// emitted"), grounded in `original_source/lcs_netmgmt.c`'s `INVALID_DOMAIN`
/// drop path plus the teacher's `tsa`-layer completion plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppCompletion {
    pub success: bool,
}

/// A proxy-forwarded request awaiting its sub-transaction's outcome, so the
/// reply can be relayed back to the original `PROXY_COMMAND` requester
/// (spec §4.7; `tsa::RetryScheduler`'s completion events carry only
/// `success`, so the response body is captured directly off the wire in
/// [`Node::network_receive`] and matched back here by `proxy_reply_tag`).
struct PendingProxy {
    tag: u32,
    reply_dest: Destination,
    reply_priority: bool,
}

/// Ties together every layer of the stack behind the §5 scheduler sweep.
/// `X` is the transceiver link, `S` the persistent configuration store.
pub struct Node<X: XcvrLink, S: ConfigStore> {
    pub config: ConfigImage,
    store: S,
    xcvr: X,
    mac: MacEngine,
    tid: TransactionControl,
    retry: RetryScheduler,
    dup: DuplicateTracker,
    error_log: ErrorLog,
    nd_stats: app::nd::NdStats,
    select_query: bool,
    app_running: bool,
    reset_requested: Option<ResetCause>,
    authenticated_peer: bool,
    model_number: u8,
    version_number: u8,
    build: u16,

    mac_rx: BoundedQueue<Vec<u8>>,
    link_rx: BoundedQueue<LinkFrame>,
    net_rx: BoundedQueue<NetRx>,
    app_rx: BoundedQueue<AppRx>,

    app_tx: BoundedQueue<AppSendItem>,
    tsa_tx: BoundedQueue<TsaSendItem>,
    net_tx: BoundedQueue<NetSendItem>,
    link_tx: BoundedQueue<LinkSendItem>,

    app_completions: BoundedQueue<AppCompletion>,

    pending_proxies: Vec<PendingProxy>,
    next_proxy_tag: u32,
}

impl<X: XcvrLink, S: ConfigStore> Node<X, S> {
    /// Builds a node around an already-resolved configuration image. Most
    /// callers want [`Node::boot`], which also consults `store`.
    pub fn new(
        config: ConfigImage,
        store: S,
        xcvr: X,
        mac_timer_config: MacTimerConfig,
        comm_params: [u8; 6],
        model_number: u8,
        version_number: u8,
        build: u16,
    ) -> Self {
        Self {
            config,
            store,
            xcvr,
            mac: MacEngine::new(mac_timer_config, comm_params),
            tid: TransactionControl::new(TID_TABLE_CAPACITY, crate::types::TID_TABLE_ENTRY_TTL_MS as u64),
            retry: RetryScheduler::new(),
            dup: DuplicateTracker::new(crate::types::TID_TABLE_ENTRY_TTL_MS as u64),
            error_log: ErrorLog::default(),
            nd_stats: app::nd::NdStats::default(),
            select_query: false,
            app_running: true,
            reset_requested: None,
            authenticated_peer: false,
            model_number,
            version_number,
            build,
            mac_rx: BoundedQueue::new(QUEUE_DEPTH),
            link_rx: BoundedQueue::new(QUEUE_DEPTH),
            net_rx: BoundedQueue::new(QUEUE_DEPTH),
            app_rx: BoundedQueue::new(QUEUE_DEPTH),
            app_tx: BoundedQueue::new(QUEUE_DEPTH),
            tsa_tx: BoundedQueue::new(QUEUE_DEPTH),
            net_tx: BoundedQueue::new(QUEUE_DEPTH),
            link_tx: BoundedQueue::new(QUEUE_DEPTH),
            app_completions: BoundedQueue::new(QUEUE_DEPTH),
            pending_proxies: Vec::new(),
            next_proxy_tag: 0,
        }
    }

    /// Loads the persisted image from `store` if one exists, otherwise falls
    /// back to `fresh_config`, then runs the power-up sequence (spec §4.6
    /// "On power-up...the entire [TID] table is cleared").
    pub fn boot(
        mut store: S,
        xcvr: X,
        fresh_config: ConfigImage,
        mac_timer_config: MacTimerConfig,
        comm_params: [u8; 6],
        model_number: u8,
        version_number: u8,
        build: u16,
    ) -> Result<Self, LonError> {
        let config = store.load()?.unwrap_or(fresh_config);
        let mut node = Self::new(config, store, xcvr, mac_timer_config, comm_params, model_number, version_number, build);
        node.power_up(ResetCause::PowerUpReset);
        Ok(node)
    }

    /// Runs the reset-cause bookkeeping a fresh boot or `SET_NODE_MODE`
    /// reset-request performs (spec §4.6, §4.7 `SET_NODE_MODE`).
    pub fn power_up(&mut self, cause: ResetCause) {
        self.config.reset_cause = cause;
        if matches!(cause, ResetCause::PowerUpReset | ResetCause::ExternalReset) {
            self.tid.clear_table();
            self.dup.clear();
        }
        self.config.recompute_checksum();
        lon_info!("node power-up, cause={:?}", cause);
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    pub fn nd_stats(&self) -> &app::nd::NdStats {
        &self.nd_stats
    }

    pub fn app_running(&self) -> bool {
        self.app_running
    }

    /// Persists the current configuration image (e.g. after `UPDATE_DOMAIN`,
    /// `WRITE_MEMORY` with the checksum-recalc form bit set).
    pub fn save_config(&mut self) -> Result<(), LonError> {
        self.store.save(&self.config)
    }

    /// Submits a fresh outbound application message (spec §4.5); it's
    /// allocated a TID and framed during the next `app_send`/`tsa_send`/
    /// `network_send`/`link_send` sweep.
    pub fn submit(
        &mut self,
        code: u8,
        body: Vec<u8>,
        dest: Destination,
        service: TsaService,
        priority: bool,
        alt_path: bool,
    ) -> Result<(), LonError> {
        let item = AppSendItem { code, body, dest, service, priority, alt_path, proxy_reply_tag: None };
        self.app_tx.enqueue(item).map_err(|_| LonError::InternalError("app send queue full"))
    }

    // ---- §5 scheduler sweep -------------------------------------------------

    /// `PHYSend`: exchanges one SPM frame with the transceiver.
    pub fn phy_send(&mut self, tx: TxFrame) -> RxFrame {
        self.xcvr.exchange(tx)
    }

    /// `MAC tick`: advances the CSMA/handshake state machine. On a fully
    /// CRC-checked frame, re-derives link-layer framing before admitting it
    /// to the link-receive queue (see Design Notes: MAC's own `priority`/
    /// `alt_path` bits use a different layout than the link header's, so
    /// they're discarded in favor of re-parsing via [`link::unframe`]).
    pub fn mac_tick(&mut self, rx: RxFrame, now: u64) -> MacOutput {
        let out = self.mac.tick(rx, now);
        if let MacOutput::FrameReceived { ref bytes, .. } = out {
            if self.mac_rx.enqueue(bytes.clone()).is_err() {
                self.error_log.record(ERR_NETWORK_LAYER_REJECTED_FRAME);
                lon_warn!("mac_rx queue full, dropping received frame");
            }
        }
        out
    }

    /// `LinkReceive`: MAC hands up `header + npdu + crc` with no leading
    /// `flag`/`pduSize` (those are SPM-level framing, not part of the
    /// CRC-covered bit stream) — reconstruct them so [`link::unframe`] can
    /// validate structure and extract the header the same way an outbound
    /// frame was built.
    pub fn link_receive(&mut self) {
        let Some(bytes) = self.mac_rx.dequeue() else { return };
        if bytes.len() < 3 {
            self.error_log.record(ERR_LINK_LAYER_REJECTED_FRAME);
            return;
        }
        let pdu_size = (bytes.len() - 2) as u16;
        let mut raw = Vec::with_capacity(3 + bytes.len());
        raw.push(link::LPDU_FLAG);
        raw.extend_from_slice(&pdu_size.to_be_bytes());
        raw.extend_from_slice(&bytes);

        match link::unframe(&raw, self.xcvr.xcvr_params()) {
            Ok(frame) => {
                if self.link_rx.enqueue(frame).is_err() {
                    lon_warn!("link_rx queue full, dropping frame");
                }
            }
            Err(_) => self.error_log.record(ERR_LINK_LAYER_REJECTED_FRAME),
        }
    }

    /// `NWReceive`: decodes the NPDU header, matches the domain table, and
    /// runs the receive-side filter chain (spec §4.4).
    pub fn network_receive(&mut self) {
        let Some(frame) = self.link_rx.dequeue() else { return };
        let npdu = match network::decode(&frame.npdu) {
            Ok(n) => n,
            Err(_) => {
                self.error_log.record(ERR_NETWORK_LAYER_REJECTED_FRAME);
                return;
            }
        };

        let domain_table: [(&[u8], bool); 2] =
            [(self.config.domains[0].id_bytes(), self.config.domains[0].valid), (self.config.domains[1].id_bytes(), self.config.domains[1].valid)];
        let matched = network::match_domain(npdu.domain, &domain_table);
        if matched.is_none() && !npdu.domain.is_empty() {
            return;
        }

        let local = LocalIdentity {
            unique_node_id: self.config.read_only.unique_node_id,
            configured: matches!(self.config.state, NodeState::ConfigOnline | NodeState::ConfigOffline),
            domains: &[(self.config.domains[0].subnet, self.config.domains[0].node), (self.config.domains[1].subnet, self.config.domains[1].node)],
        };
        if network::filter_receive(&npdu, matched, &local) == FilterOutcome::Drop {
            return;
        }

        let rx = NetRx {
            pdu_type: npdu.pdu_type,
            address: npdu.address,
            src_subnet: npdu.src_subnet,
            src_node: npdu.src_node,
            domain_index: matched,
            priority: frame.priority,
            alt_path: frame.alt_path,
            payload: npdu.payload.to_vec(),
        };
        let _ = self.net_rx.enqueue(rx);
    }

    /// `TSAReceive`: unwraps the TSA header, resolves responses against
    /// in-flight transactions (including proxied ones), and filters
    /// duplicates of already-handled requests (spec §4.5, §4.6).
    pub fn tsa_receive(&mut self, now_ms: u64) {
        let Some(rx) = self.net_rx.dequeue() else { return };
        let (header, apdu) = match tsa::decode_body(&rx.payload) {
            Ok(v) => v,
            Err(_) => return,
        };

        let domain_bytes = rx.domain_index.and_then(|i| self.config.domain(i)).map(|d| d.id_bytes().to_vec()).unwrap_or_default();
        let sig = DestSignature { domain: domain_bytes, addr_fmt: rx.address.addr_fmt(), addr_key: address_key(&rx.address) };

        if header.response {
            if self.tid.validate_trans(rx.priority, header.tid) {
                let events = self.retry.on_response(rx.priority, header.tid, now_ms);
                for event in events {
                    self.handle_tsa_completion(event, Some(apdu));
                }
            }
            return;
        }

        if matches!(rx.pdu_type, PduType::Tpdu | PduType::Spdu) && self.dup.check_and_record(&sig, rx.priority, header.tid, now_ms) {
            return;
        }

        let Some(&code) = apdu.first() else { return };
        let body = apdu[1..].to_vec();
        let arrival_group = match rx.address {
            AddressMode::Multicast { group } | AddressMode::MulticastAck { group, .. } => Some(group),
            _ => None,
        };
        let reply_dest = Destination {
            address: AddressMode::SubnetNode { subnet: rx.src_subnet, node: rx.src_node },
            domain_ref: rx.domain_index.map(DomainRef::Index).unwrap_or(DomainRef::Flex),
        };

        let app_rx = AppRx {
            code,
            body,
            priority: rx.priority,
            alt_path: rx.alt_path,
            tid: header.tid,
            pdu_type: rx.pdu_type,
            source: sig,
            reply_dest,
            domain_index: rx.domain_index,
            arrival_group,
        };
        let _ = self.app_rx.enqueue(app_rx);
    }

    /// `AppReceive`: dispatches the request through [`app::dispatch`] and
    /// turns its outcome into outbound work (a reply, a wink, or a proxied
    /// sub-transaction).
    pub fn app_receive(&mut self) {
        let Some(rx) = self.app_rx.dequeue() else { return };

        let mut reset_requested = self.reset_requested;
        let outcome = {
            let mut ctx = AppContext {
                config: &mut self.config,
                select_query: &mut self.select_query,
                error_log: &mut self.error_log,
                stats: &mut self.nd_stats,
                xcvr_params: self.xcvr.xcvr_params(),
                model_number: self.model_number,
                version_number: self.version_number,
                build: self.build,
                app_running: &mut self.app_running,
                reset_requested: &mut reset_requested,
                authenticated: self.authenticated_peer,
                arrival_domain_index: rx.domain_index,
                arrival_group: rx.arrival_group,
                req_id: rx.tid as u32,
                priority: rx.priority,
                alt_path: rx.alt_path,
            };
            app::dispatch(rx.code, &rx.body, &mut ctx)
        };
        self.reset_requested = reset_requested;

        if let Some(cause) = self.reset_requested.take() {
            self.power_up(cause);
        }

        match outcome {
            AppOutcome::Response { code, body } => self.send_response(&rx, code, body),
            AppOutcome::NullResponse { code } => self.send_response(&rx, code, Vec::new()),
            AppOutcome::NoResponse | AppOutcome::AuthRefused => {}
            AppOutcome::Wink => {
                self.xcvr.enable();
                lon_info!("wink requested");
            }
            AppOutcome::Forward { code, address, domain_index, body, req_id: _, priority, alt_path } => {
                let tag = self.next_proxy_tag;
                self.next_proxy_tag = self.next_proxy_tag.wrapping_add(1);
                self.pending_proxies.push(PendingProxy { tag, reply_dest: rx.reply_dest.clone(), reply_priority: rx.priority });
                let dest = forward_destination(address, domain_index);
                let item = AppSendItem { code, body, dest, service: TsaService::Request, priority, alt_path, proxy_reply_tag: Some(tag) };
                if self.app_tx.enqueue(item).is_err() {
                    self.pending_proxies.retain(|p| p.tag != tag);
                    lon_warn!("app_tx queue full, dropping proxy forward");
                }
            }
        }
    }

    /// Responses reuse the inbound transaction's own TID/PDU type (spec
    /// §4.5 "a response is not itself a new transaction") instead of
    /// allocating one through [`TransactionControl`], so they bypass
    /// `app_send`/`tsa_send` and are queued directly for `network_send`.
    fn send_response(&mut self, rx: &AppRx, code: u8, body: Vec<u8>) {
        let header = TsaHeader { response: true, tid: rx.tid };
        let mut apdu = vec![code];
        apdu.extend_from_slice(&body);
        let payload = tsa::encode_body(header, &apdu);
        let net_item =
            NetSendItem { payload, dest: rx.reply_dest.clone(), pdu_type: rx.pdu_type, priority: rx.priority, alt_path: rx.alt_path, retry: None };
        let _ = self.net_tx.enqueue(net_item);
    }

    /// `AppSend`: allocates a TID for a locally-originated (or proxy
    /// forwarded) transaction (spec §4.6 `NewTrans`).
    pub fn app_send(&mut self, now_ms: u64) {
        let Some(item) = self.app_tx.dequeue() else { return };
        let domain_bytes = match item.dest.domain_ref {
            DomainRef::Index(i) => self.config.domain(i).map(|d| d.id_bytes().to_vec()).unwrap_or_default(),
            DomainRef::Flex => Vec::new(),
        };
        let sig = DestSignature { domain: domain_bytes, addr_fmt: item.dest.address.addr_fmt(), addr_key: address_key(&item.dest.address) };
        match self.tid.new_trans(item.priority, sig, now_ms) {
            Ok(tid) => {
                let _ = self.tsa_tx.enqueue(TsaSendItem { item, tid });
            }
            Err(_) => {
                self.error_log.record(ERR_TRANSACTION_ALLOCATION_FAILED);
                lon_warn!("new_trans refused, dropping outbound request");
            }
        }
    }

    /// `TSASend`: wraps the APDU behind a TSA header and, for acknowledged
    /// and request services, flags the item for retry registration once its
    /// NPDU bytes exist (spec §4.5).
    pub fn tsa_send(&mut self) {
        let Some(TsaSendItem { item, tid }) = self.tsa_tx.dequeue() else { return };
        let header = TsaHeader { response: false, tid };
        let mut apdu = vec![item.code];
        apdu.extend_from_slice(&item.body);
        let payload = tsa::encode_body(header, &apdu);
        let pdu_type = if item.service == TsaService::Request { PduType::Spdu } else { PduType::Tpdu };
        let retry = if matches!(item.service, TsaService::Unackd) {
            None
        } else {
            Some(RetryRegistration { tid, service: item.service, proxy_reply_tag: item.proxy_reply_tag })
        };
        let net_item = NetSendItem { payload, dest: item.dest, pdu_type, priority: item.priority, alt_path: item.alt_path, retry };
        let _ = self.net_tx.enqueue(net_item);
    }

    /// `NWSend`: builds the NPDU and, for transactions awaiting
    /// acknowledgement, registers the encoded bytes with the retry
    /// scheduler (spec §4.4, §4.5).
    pub fn network_send(&mut self, now_ms: u64) {
        let Some(item) = self.net_tx.dequeue() else { return };
        let (domain_bytes, own_subnet, own_node) = match item.dest.domain_ref {
            DomainRef::Index(i) => match self.config.domain(i) {
                Some(d) if d.valid => (d.id_bytes().to_vec(), d.subnet, d.node),
                _ => {
                    // §4.4: a PDU addressed via an invalid (or absent) domain
                    // table entry is dropped. Every `net_tx` item here rides
                    // one of the four §3 PDU types and all of them carry
                    // application-originated content (there's no bare
                    // network-management NPDU in this model), so a failure
                    // completion always follows the drop rather than only
                    // for `PduType::Apdu` (resolves Design Notes §9's open
                    // question on which PDU types are exempt).
                    self.error_log.record(ERR_NETWORK_LAYER_REJECTED_FRAME);
                    let _ = self.app_completions.enqueue(AppCompletion { success: false });
                    return;
                }
            },
            DomainRef::Flex => (Vec::new(), 0, 0),
        };

        let builder = NpduBuilder { pdu_type: item.pdu_type, address: item.dest.address, src_subnet: own_subnet, src_node: own_node, domain: domain_bytes };
        let mut npdu_bytes = Vec::new();
        if builder.encode(item.dest.domain_ref, &item.payload, &mut npdu_bytes).is_err() {
            self.error_log.record(ERR_NETWORK_LAYER_REJECTED_FRAME);
            return;
        }

        if let Some(reg) = item.retry {
            let repeat_ms = tsa::repeat_timer_ms(5);
            self.retry.submit(PendingTransaction {
                priority: item.priority,
                tid: reg.tid,
                service: reg.service,
                npdu: npdu_bytes.clone(),
                alt_path: item.alt_path,
                attempts_left: 3,
                repeat_timer_ms: repeat_ms,
                next_attempt_at_ms: now_ms + repeat_ms as u64,
                group_size: 1,
                responses_collected: 0,
                timeout_at_ms: now_ms + repeat_ms as u64 * 4,
                cancelled: false,
                proxy_reply_tag: reg.proxy_reply_tag,
            });
        }

        let _ = self.link_tx.enqueue(LinkSendItem { npdu: npdu_bytes, priority: item.priority, alt_path: item.alt_path });
    }

    /// `LinkSend`: frames the NPDU as an LPDU and queues it with the MAC
    /// engine for transmission (spec §4.3).
    pub fn link_send(&mut self) {
        let Some(item) = self.link_tx.dequeue() else { return };
        let framed = link::frame(&item.npdu, LpduHeader { priority: item.priority, alt_path: item.alt_path });
        let packet = TxPacket { data: framed, delta_bl: 0, priority: item.priority, alt_path: item.alt_path };
        if self.mac.submit(packet).is_err() {
            self.error_log.record(ERR_MAC_TRANSMIT_QUEUE_FULL);
            lon_warn!("MAC already has a packet pending, dropping outbound frame");
        }
    }

    /// Advances retransmission/timeout bookkeeping; call once per
    /// millisecond-ish tick, independent of the MAC's much faster cadence
    /// (spec §4.5 "repeat timers").
    pub fn tsa_tick(&mut self, now_ms: u64) {
        let events = self.retry.tick(now_ms);
        for event in events {
            match event {
                TsaEvent::Retransmit { npdu, priority, alt_path, .. } => {
                    let _ = self.link_tx.enqueue(LinkSendItem { npdu, priority, alt_path });
                }
                TsaEvent::Completion { .. } => self.handle_tsa_completion(event, None),
            }
        }
    }

    /// Since [`TsaEvent::Completion`] carries only `success`/`proxy_reply_tag`
    /// (not the triggering response body), `body` is threaded through from
    /// whichever call site actually saw the wire bytes — `Some` from
    /// `tsa_receive`, `None` from a timeout in `tsa_tick`.
    fn handle_tsa_completion(&mut self, event: TsaEvent, body: Option<&[u8]>) {
        let TsaEvent::Completion { tid, success, proxy_reply_tag } = event else { return };
        let priority = self.tid.in_progress(true) == Some(tid);
        self.tid.trans_done(priority);

        if !success {
            lon_warn!("transaction tid={} failed", tid);
        }
        let _ = self.app_completions.enqueue(AppCompletion { success });

        if let Some(tag) = proxy_reply_tag {
            if let Some(pos) = self.pending_proxies.iter().position(|p| p.tag == tag) {
                let proxy = self.pending_proxies.remove(pos);
                let (code, reply_body) = match (success, body) {
                    (true, Some(b)) if !b.is_empty() => (b[0], b[1..].to_vec()),
                    _ => (0x7F, Vec::new()),
                };
                let item = AppSendItem {
                    code,
                    body: reply_body,
                    dest: proxy.reply_dest,
                    service: TsaService::Unackd,
                    priority: proxy.reply_priority,
                    alt_path: false,
                    proxy_reply_tag: None,
                };
                let _ = self.app_tx.enqueue(item);
            }
        }
    }

    /// Drains one pending outbound-APDU outcome, if any (spec §7 "completion
    /// events for outbound APDUs are always emitted"). Call after
    /// [`Node::service`] to learn whether a prior `app_tx` submission landed.
    pub fn poll_completion(&mut self) -> Option<AppCompletion> {
        self.app_completions.dequeue()
    }

    /// Runs every higher-layer stage once, in spec §5 order, after MAC/link
    /// receive queues have already been filled by [`Node::mac_tick`] (driven
    /// separately, at MAC's own much faster tick rate).
    pub fn service(&mut self, now_ms: u64) {
        self.link_receive();
        self.network_receive();
        self.tsa_receive(now_ms);
        self.app_receive();
        self.app_send(now_ms);
        self.tsa_send();
        self.network_send(now_ms);
        self.link_send();
        self.tsa_tick(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadOnlyData;
    use crate::hal::MemConfigStore;
    use crate::mac::timers::MacTimerConfig;
    use crate::types::NodeId48;

    /// A loopback transceiver: whatever's pushed onto `inbox` is handed back
    /// byte-by-byte as a `FrameReceived`-driving `RxFrame` stream, and
    /// transmitted frames are written into `sent`.
    #[derive(Default)]
    struct LoopbackXcvr {
        inbox: Vec<u8>,
        cursor: usize,
        sent: Vec<u8>,
    }

    impl XcvrLink for LoopbackXcvr {
        fn enable(&mut self) {}
        fn disable(&mut self) {}
        fn reset_hard(&mut self, _comm_params: &[u8; 6]) {}
        fn exchange(&mut self, tx: TxFrame) -> RxFrame {
            if tx.tx_data_valid {
                self.sent.push(tx.data);
            }
            RxFrame::default()
        }
        fn backlog_hint(&self) -> Option<u8> {
            None
        }
        fn xcvr_params(&self) -> XcvrParams {
            XcvrParams::default()
        }
    }

    fn sample_config() -> ConfigImage {
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

    fn build_node() -> Node<LoopbackXcvr, MemConfigStore> {
        Node::new(sample_config(), MemConfigStore::default(), LoopbackXcvr::default(), timer_cfg(), [0; 6], 1, 18, 7)
    }

    /// Feeds a fully framed LPDU to the node by driving the MAC engine's
    /// receive path directly, bypassing the transceiver handshake (mirrors
    /// the MAC layer's own `received_frame_with_good_crc_is_delivered` test).
    fn deliver_framed(node: &mut Node<LoopbackXcvr, MemConfigStore>, framed: &[u8]) {
        let mut now = 0u64;
        for &b in framed {
            node.mac_tick(RxFrame { rx_flag: true, rx_data_valid: true, data: b, ..Default::default() }, now);
            now += 1;
        }
        node.mac_tick(RxFrame::default(), now);
    }

    fn build_nd_query_status_frame() -> Vec<u8> {
        let header = TsaHeader { response: false, tid: 3 };
        let apdu = vec![crate::app::nd::QUERY_STATUS];
        let payload = tsa::encode_body(header, &apdu);
        let npdu_builder = NpduBuilder {
            pdu_type: PduType::Tpdu,
            address: AddressMode::SubnetNode { subnet: 1, node: 5 },
            src_subnet: 2,
            src_node: 9,
            domain: vec![0x2C],
        };
        let mut npdu = Vec::new();
        npdu_builder.encode(DomainRef::Index(0), &payload, &mut npdu).unwrap();
        link::frame(&npdu, LpduHeader { priority: false, alt_path: false })
    }

    #[test]
    fn end_to_end_nd_query_status_produces_a_reply_frame() {
        let mut node = build_node();
        let framed = build_nd_query_status_frame();
        deliver_framed(&mut node, &framed);

        node.link_receive();
        node.network_receive();
        node.tsa_receive(0);
        assert_eq!(node.app_rx.size(), 1);

        node.app_receive();
        assert_eq!(node.net_tx.size(), 1);

        node.network_send(0);
        assert_eq!(node.link_tx.size(), 1);

        node.link_send();
        assert!(node.mac.has_pending());
    }

    #[test]
    fn self_addressed_loop_is_dropped_before_reaching_the_application() {
        let mut node = build_node();
        let header = TsaHeader { response: false, tid: 1 };
        let payload = tsa::encode_body(header, &[crate::app::nd::QUERY_STATUS]);
        let builder = NpduBuilder {
            pdu_type: PduType::Tpdu,
            address: AddressMode::Broadcast { subnet: 1 },
            src_subnet: 1,
            src_node: 5, // matches the node's own (subnet, node)
            domain: vec![0x2C],
        };
        let mut npdu = Vec::new();
        builder.encode(DomainRef::Index(0), &payload, &mut npdu).unwrap();
        let framed = link::frame(&npdu, LpduHeader { priority: false, alt_path: false });

        deliver_framed(&mut node, &framed);
        node.link_receive();
        node.network_receive();
        assert_eq!(node.net_rx.size(), 0);
    }

    #[test]
    fn duplicate_request_is_suppressed_on_second_delivery() {
        let mut node = build_node();
        let framed = build_nd_query_status_frame();

        deliver_framed(&mut node, &framed);
        node.link_receive();
        node.network_receive();
        node.tsa_receive(0);
        assert_eq!(node.app_rx.size(), 1);
        node.app_receive();

        deliver_framed(&mut node, &framed);
        node.link_receive();
        node.network_receive();
        node.tsa_receive(100);
        assert_eq!(node.app_rx.size(), 0);
    }

    #[test]
    fn power_up_clears_tid_table_and_duplicate_history() {
        let mut node = build_node();
        let sig = DestSignature { domain: vec![0x2C], addr_fmt: 2, addr_key: 1 };
        node.tid.new_trans(false, sig.clone(), 0).unwrap();
        node.dup.check_and_record(&sig, false, 1, 0);

        node.power_up(ResetCause::ExternalReset);

        assert!(node.tid.new_trans(false, sig.clone(), 0).is_ok());
        assert!(!node.dup.check_and_record(&sig, false, 1, 0));
    }

    #[test]
    fn submit_then_sweep_drives_a_request_out_through_link_send() {
        let mut node = build_node();
        let dest = Destination { address: AddressMode::SubnetNode { subnet: 1, node: 9 }, domain_ref: DomainRef::Index(0) };
        node.submit(crate::app::nm::WINK, Vec::new(), dest, TsaService::Unackd, false, false).unwrap();

        node.app_send(0);
        assert_eq!(node.tsa_tx.size(), 1);
        node.tsa_send();
        assert_eq!(node.net_tx.size(), 1);
        node.network_send(0);
        assert_eq!(node.link_tx.size(), 1);
        node.link_send();
        assert!(node.mac.has_pending());
    }

    #[test]
    fn network_send_drops_pdu_addressed_via_invalid_domain_and_reports_failure() {
        let mut node = build_node();
        node.config.domains[0].valid = false;
        let dest = Destination { address: AddressMode::SubnetNode { subnet: 1, node: 9 }, domain_ref: DomainRef::Index(0) };
        node.submit(crate::app::nm::WINK, Vec::new(), dest, TsaService::Unackd, false, false).unwrap();

        node.app_send(0);
        node.tsa_send();
        assert_eq!(node.net_tx.size(), 1);

        node.network_send(0);
        assert_eq!(node.link_tx.size(), 0, "pdu addressed via an invalid domain must not reach the link layer");
        assert_eq!(node.poll_completion(), Some(AppCompletion { success: false }));
    }

    #[test]
    fn proxy_forward_relays_the_inner_response_under_the_original_requester() {
        let mut node = build_node();

        // Proxy command addressed to this node, forwarding QUERY_STATUS
        // (sub-command 1, spec §8 scenario 4) to (subnet 4, node 2) on
        // domain 0.
        let header = TsaHeader { response: false, tid: 2 };
        let mut proxy_body = vec![crate::types::AddressModeTag::SubnetNode as u8, 4, 2, 0, 1];
        let mut apdu = vec![crate::app::proxy::PROXY_COMMAND];
        apdu.append(&mut proxy_body);
        let payload = tsa::encode_body(header, &apdu);
        let builder = NpduBuilder {
            pdu_type: PduType::Tpdu,
            address: AddressMode::SubnetNode { subnet: 1, node: 5 },
            src_subnet: 9,
            src_node: 9,
            domain: vec![0x2C],
        };
        let mut npdu = Vec::new();
        builder.encode(DomainRef::Index(0), &payload, &mut npdu).unwrap();
        let framed = link::frame(&npdu, LpduHeader { priority: false, alt_path: false });

        deliver_framed(&mut node, &framed);
        node.link_receive();
        node.network_receive();
        node.tsa_receive(0);
        node.app_receive();

        assert_eq!(node.pending_proxies.len(), 1);
        assert_eq!(node.app_tx.size(), 1);

        node.app_send(0);
        node.tsa_send();
        node.network_send(0);
        assert_eq!(node.retry.len(), 1);
        let forwarded_tid = node.tid.in_progress(false).unwrap();

        let events = node.retry.on_response(false, forwarded_tid, 10);
        assert_eq!(events.len(), 1);
        node.handle_tsa_completion(events.into_iter().next().unwrap(), Some(&[0xD1, 0xAA]));

        assert!(node.pending_proxies.is_empty());
        assert_eq!(node.app_tx.size(), 1);
    }
}
