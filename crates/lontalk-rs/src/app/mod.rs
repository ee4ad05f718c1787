// crates/lontalk-rs/src/app/mod.rs
//! Application-layer dispatch: routes an APDU by its code byte's high
//! nibble into NM, ND, manual service request, or generic messages, and
//! enforces the NM/ND authentication allow-list (spec §4.7), grounded in
//! `original_source/lcs_netmgmt.c`'s `AppReceive`/`HandleNM`/`HandleND`
//! dispatch tables.

pub mod nd;
pub mod nm;
pub mod proxy;

use crate::config::ConfigImage;
use crate::hal::{ErrorLog, XcvrParams};
use crate::types::{NodeState, ResetCause};
use alloc::vec::Vec;

/// Codes exempt from authentication gating even when `configData.nmAuth` is
/// set (spec §4.7).
pub const AUTH_EXEMPT_CODES: [u8; 7] =
    [nm::QUERY_ID, nm::RESPOND_TO_QUERY, nd::QUERY_STATUS, proxy::PROXY_COMMAND, nd::QUERY_STATUS_FLEX, nd::QUERY_XCVR_BIDIR, nd::GET_FULL_VERSION];

/// `NME_QUERY_VERSION` is also exempt, checked separately since it's a
/// sub-command of `EXPANDED` rather than a top-level code.
pub fn is_auth_exempt(code: u8, body: &[u8]) -> bool {
    if AUTH_EXEMPT_CODES.contains(&code) {
        return true;
    }
    code == nm::EXPANDED && body.first() == Some(&nm::expanded::QUERY_VERSION)
}

/// Everything an NM/ND/proxy handler needs, bundled so dispatch can pass one
/// argument instead of threading five (spec §5 "shared resources...mutated
/// only by the application dispatch").
pub struct AppContext<'a> {
    pub config: &'a mut ConfigImage,
    pub select_query: &'a mut bool,
    pub error_log: &'a mut ErrorLog,
    pub stats: &'a mut nd::NdStats,
    pub xcvr_params: XcvrParams,
    pub model_number: u8,
    pub version_number: u8,
    pub build: u16,
    pub app_running: &'a mut bool,
    pub reset_requested: &'a mut Option<ResetCause>,
    pub authenticated: bool,
    /// Domain index the triggering PDU arrived on, if a group/multicast
    /// address was matched (needed by `UPDATE_GROUP_ADDR`, spec §4.7).
    pub arrival_domain_index: Option<u8>,
    /// Group number the triggering PDU arrived on, if any.
    pub arrival_group: Option<u8>,
    /// Transaction id the request carried, needed to correlate a forwarded
    /// proxy request with its eventual reply (spec §4.7 `PROXY_COMMAND`).
    pub req_id: u32,
    /// Priority/alt-path the request arrived with, preserved when forwarding.
    pub priority: bool,
    pub alt_path: bool,
}

/// Outcome of dispatching one received APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppOutcome {
    /// Send `body` back under `code` to the requester.
    Response { code: u8, body: Vec<u8> },
    /// Decline to answer (still terminates the sender's transaction, spec
    /// §4.5 "Null responses").
    NullResponse { code: u8 },
    /// No response is ever sent for this code (e.g. `RESPOND_TO_QUERY`,
    /// manual service request on receive).
    NoResponse,
    /// The command was refused outright by the auth gate.
    AuthRefused,
    /// Re-send the inner command to another destination as its own
    /// transaction, then relay whatever comes back under `req_id` (spec
    /// §4.7 `PROXY_COMMAND`).
    Forward { code: u8, address: proxy::ForwardAddress, domain_index: u8, body: Vec<u8>, req_id: u32, priority: bool, alt_path: bool },
    /// Drive the local wink indicator (spec §4.7 `WINK`, bare form).
    Wink,
}

/// High nibble groups used to route an APDU code (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Nd,
    Nm,
    Proxy,
    ManualServiceRequest,
    Application,
}

fn classify(code: u8) -> Family {
    match code {
        nm::MANUAL_SERVICE_REQUEST => Family::ManualServiceRequest,
        proxy::PROXY_COMMAND => Family::Proxy,
        c if c & 0xF0 == 0x50 => Family::Nd,
        c if c & 0xF0 == 0x60 || c & 0xF0 == 0x70 => Family::Nm,
        _ => Family::Application,
    }
}

/// Dispatches a received APDU, applying the authentication gate first.
pub fn dispatch(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let requires_auth = ctx.config.config.nm_auth
        && matches!(ctx.config.state, NodeState::ConfigOnline | NodeState::ConfigOffline)
        && !is_auth_exempt(code, body);
    if requires_auth && !ctx.authenticated {
        return AppOutcome::AuthRefused;
    }

    match classify(code) {
        Family::Nd => nd::handle(code, body, ctx),
        Family::Nm => nm::handle(code, body, ctx),
        Family::Proxy => proxy::handle(body, ctx),
        Family::ManualServiceRequest => AppOutcome::NoResponse,
        Family::Application => AppOutcome::NoResponse,
    }
}
