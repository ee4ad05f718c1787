// crates/lontalk-rs/src/app/nd.rs
//! Network-diagnostic command handlers (spec §4.7 "ND handlers"), grounded
//! in `original_source/lcs_netmgmt.c`'s `HandleND*` family.

use super::{AppContext, AppOutcome};
use crate::hal::XcvrParams;
use crate::mac::MacStats;
use crate::types::ResetCause;
use alloc::vec::Vec;

pub const QUERY_STATUS: u8 = 0x51;
pub const CLEAR_STATUS: u8 = 0x53;
pub const QUERY_XCVR: u8 = 0x54;
pub const QUERY_STATUS_FLEX: u8 = 0x57;
pub const QUERY_XCVR_BIDIR: u8 = 0x58;
pub const GET_FULL_VERSION: u8 = 0x59;

/// Success response code for the ND family: the request code with bit 7 set
/// (spec §8 scenario 4: `QUERY_STATUS` 0x51 proxied back as 0xD1).
const RESP_SUCCESS_BIT: u8 = 0x80;

/// Running statistics surfaced by `QUERY_STATUS`/`QUERY_STATUS_FLEX` (spec
/// §4.7, §5 "statistics are kept in host byte order").
#[derive(Debug, Clone, Copy, Default)]
pub struct NdStats {
    pub mac: MacStats,
    pub backlog_overflow: u32,
}

impl NdStats {
    pub fn clear(&mut self) {
        *self = NdStats::default();
    }
}

pub(crate) fn query_stat_body(ctx: &AppContext<'_>) -> Vec<u8> {
    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(&ctx.stats.mac.transmission_errors.to_be_bytes());
    body.extend_from_slice(&ctx.stats.mac.missed_messages.to_be_bytes());
    body.extend_from_slice(&ctx.stats.mac.collisions.to_be_bytes());
    body.extend_from_slice(&ctx.stats.backlog_overflow.to_be_bytes());
    body.push(ctx.config.reset_cause as u8);
    body.push(ctx.config.state as u8);
    body.push(ctx.version_number);
    body.push(ctx.error_log.len() as u8);
    body.push(ctx.model_number);
    body
}

pub fn handle(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    match code {
        QUERY_STATUS | QUERY_STATUS_FLEX => {
            AppOutcome::Response { code: code | RESP_SUCCESS_BIT, body: query_stat_body(ctx) }
        }
        CLEAR_STATUS => {
            ctx.stats.clear();
            ctx.error_log.clear();
            ctx.config.reset_cause = ResetCause::Cleared;
            AppOutcome::Response { code: code | RESP_SUCCESS_BIT, body: Vec::new() }
        }
        QUERY_XCVR | QUERY_XCVR_BIDIR => {
            let XcvrParams { signal_strength, bidirectional } = ctx.xcvr_params;
            AppOutcome::Response {
                code: code | RESP_SUCCESS_BIT,
                body: alloc::vec![signal_strength, bidirectional as u8],
            }
        }
        GET_FULL_VERSION => {
            let mut out = alloc::vec![ctx.version_number];
            out.extend_from_slice(&ctx.build.to_be_bytes());
            AppOutcome::Response { code: code | RESP_SUCCESS_BIT, body: out }
        }
        _ => {
            let _ = body;
            AppOutcome::NullResponse { code: code | RESP_SUCCESS_BIT }
        }
    }
}
