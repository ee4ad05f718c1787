// crates/lontalk-rs/src/app/proxy.rs
//! `PROXY_COMMAND` handling (spec §4.7 "PROXY_COMMAND forwards an inner NM/ND
//! request and relays the reply back under the requester's original
//! transaction"), grounded in `original_source/lcs_netmgmt.c`'s proxy-agent
//! branch of `AppReceive` and the `ND_QUERY_STATUS` handler it wraps.
//!
//! Two shapes, distinguished by body length (§8 scenario 4):
//! - local: `[sub_command]` — answer as if the inner request had targeted
//!   this node directly, replying under the inner handler's own response
//!   code rather than a `PROXY_COMMAND`-specific one.
//! - forward: `[mode, subnet, node_or_group, domain_index, sub_command,
//!   ..inner_body]` — re-issue the inner request to the named destination
//!   as a fresh transaction; [`crate::node::Node`] is responsible for
//!   actually sending it and relaying whatever comes back.
//!
//! In both shapes the byte the wire calls "inner_code" is actually the ND
//! sub-command number `HandleNDProxyCommand`'s own `switch` dispatches on
//! (0/1/2), not a raw ND/NM opcode — `resolve_subcommand` maps it to the
//! opcode (and any body bytes the target opcode itself expects) before
//! dispatch or forwarding (spec §8 scenario 4: sub-command `01` resolves to
//! `ND_QUERY_STATUS`/`0x51`).

use super::{AppContext, AppOutcome};
use crate::types::AddressModeTag;
use alloc::vec;
use alloc::vec::Vec;
use core::convert::TryFrom;

pub const PROXY_COMMAND: u8 = 0x52;

/// Maps a proxy sub-command number to the ND/NM opcode it stands for, plus
/// any body bytes that opcode's own handler expects ahead of the caller's
/// `inner_body` (spec §8 scenario 4; `original_source/lcs_netmgmt.c`'s
/// `HandleNDProxyCommand` `switch (apduPtr->data[0])`).
fn resolve_subcommand(sub: u8) -> Option<(u8, Vec<u8>)> {
    match sub {
        // HandleNDQueryUnconfig: a QUERY_ID restricted to the UNCONFIGURED
        // selector, no memory-match window.
        0 => Some((super::nm::QUERY_ID, vec![0])),
        1 => Some((super::nd::QUERY_STATUS, Vec::new())),
        2 => Some((super::nd::QUERY_XCVR, Vec::new())),
        _ => None,
    }
}

/// Destination of a forwarded proxy request, a reduced form of
/// [`crate::config::AddrTableEntry`] carrying only what's needed to address
/// one outbound PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardAddress {
    Broadcast { subnet: u8 },
    Group { group: u8 },
    SubnetNode { subnet: u8, node: u8 },
}

fn dispatch_inner(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    match super::classify(code) {
        super::Family::Nd => super::nd::handle(code, body, ctx),
        super::Family::Nm => super::nm::handle(code, body, ctx),
        _ => AppOutcome::NoResponse,
    }
}

pub fn handle(body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&first) = body.first() else {
        return AppOutcome::NoResponse;
    };

    if body.len() == 1 {
        let Some((code, prefix)) = resolve_subcommand(first) else {
            return AppOutcome::NoResponse;
        };
        return dispatch_inner(code, &prefix, ctx);
    }

    if body.len() < 5 {
        return AppOutcome::NoResponse;
    }
    let Ok(mode) = AddressModeTag::try_from(body[0]) else {
        return AppOutcome::NoResponse;
    };
    let address = match mode {
        AddressModeTag::Broadcast => ForwardAddress::Broadcast { subnet: body[1] },
        AddressModeTag::Group => ForwardAddress::Group { group: body[2] },
        AddressModeTag::SubnetNode => ForwardAddress::SubnetNode { subnet: body[1], node: body[2] },
        _ => return AppOutcome::NoResponse,
    };
    let domain_index = body[3];
    let Some((inner_code, mut inner_body)) = resolve_subcommand(body[4]) else {
        return AppOutcome::NoResponse;
    };
    inner_body.extend_from_slice(&body[5..]);

    AppOutcome::Forward {
        code: inner_code,
        address,
        domain_index,
        body: inner_body,
        req_id: ctx.req_id,
        priority: ctx.priority,
        alt_path: ctx.alt_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::nd::NdStats;
    use crate::config::{ConfigImage, ReadOnlyData};
    use crate::hal::{ErrorLog, XcvrParams};
    use crate::types::{NodeId48, ResetCause};

    fn sample_config() -> ConfigImage {
        ConfigImage::fresh(ReadOnlyData {
            unique_node_id: NodeId48([0x00, 0xFD, 0xFF, 0xFF, 0xFF, 0x01]),
            program_id: *b"cStack1\0",
            base_firmware_version: 1,
        })
    }

    struct Harness {
        config: ConfigImage,
        select_query: bool,
        error_log: ErrorLog,
        stats: NdStats,
        app_running: bool,
        reset_requested: Option<ResetCause>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                config: sample_config(),
                select_query: false,
                error_log: ErrorLog::default(),
                stats: NdStats::default(),
                app_running: true,
                reset_requested: None,
            }
        }

        fn ctx(&mut self) -> AppContext<'_> {
            AppContext {
                config: &mut self.config,
                select_query: &mut self.select_query,
                error_log: &mut self.error_log,
                stats: &mut self.stats,
                xcvr_params: XcvrParams::default(),
                model_number: 1,
                version_number: 18,
                build: 1,
                app_running: &mut self.app_running,
                reset_requested: &mut self.reset_requested,
                authenticated: true,
                arrival_domain_index: None,
                arrival_group: None,
                req_id: 0xAB,
                priority: true,
                alt_path: false,
            }
        }
    }

    #[test]
    fn local_proxy_query_status_replies_under_nd_response_code() {
        // Spec §8 scenario 4, local shape: received APDU `52 01` (sub-command
        // 1 = QueryStatus) answers with the local QueryStatus body.
        let mut h = Harness::new();
        let mut ctx = h.ctx();
        let out = handle(&[1], &mut ctx);
        match out {
            AppOutcome::Response { code, body } => {
                assert_eq!(code, 0x80 | crate::app::nd::QUERY_STATUS);
                assert!(!body.is_empty());
            }
            other => panic!("expected relayed ND response, got {:?}", other),
        }
    }

    #[test]
    fn local_proxy_unknown_subcommand_is_ignored() {
        let mut h = Harness::new();
        let mut ctx = h.ctx();
        assert_eq!(handle(&[0xFF], &mut ctx), AppOutcome::NoResponse);
    }

    #[test]
    fn forward_subnet_node_resolves_subcommand_to_query_status() {
        // Spec §8 scenario 4, forward shape: sub-command 1 resolves to the
        // outbound REQUEST's code `0x51` (QUERY_STATUS).
        let mut h = Harness::new();
        let mut ctx = h.ctx();
        let body = vec![AddressModeTag::SubnetNode as u8, 3, 9, 0, 1];
        let out = handle(&body, &mut ctx);
        assert_eq!(
            out,
            AppOutcome::Forward {
                code: crate::app::nd::QUERY_STATUS,
                address: ForwardAddress::SubnetNode { subnet: 3, node: 9 },
                domain_index: 0,
                body: Vec::new(),
                req_id: 0xAB,
                priority: true,
                alt_path: false,
            }
        );
    }

    #[test]
    fn forward_group_address_resolves_subcommand_to_query_xcvr() {
        let mut h = Harness::new();
        let mut ctx = h.ctx();
        let body = vec![AddressModeTag::Group as u8, 0, 5, 1, 2];
        let out = handle(&body, &mut ctx);
        assert_eq!(
            out,
            AppOutcome::Forward {
                code: crate::app::nd::QUERY_XCVR,
                address: ForwardAddress::Group { group: 5 },
                domain_index: 1,
                body: Vec::new(),
                req_id: 0xAB,
                priority: true,
                alt_path: false,
            }
        );
    }

    #[test]
    fn forward_unknown_subcommand_is_ignored() {
        let mut h = Harness::new();
        let mut ctx = h.ctx();
        let body = vec![AddressModeTag::SubnetNode as u8, 3, 9, 0, 0xFF];
        assert_eq!(handle(&body, &mut ctx), AppOutcome::NoResponse);
    }

    #[test]
    fn truncated_forward_body_is_ignored() {
        let mut h = Harness::new();
        let mut ctx = h.ctx();
        let out = handle(&[AddressModeTag::SubnetNode as u8, 1], &mut ctx);
        assert_eq!(out, AppOutcome::NoResponse);
    }

    #[test]
    fn empty_body_is_ignored() {
        let mut h = Harness::new();
        let mut ctx = h.ctx();
        assert_eq!(handle(&[], &mut ctx), AppOutcome::NoResponse);
    }
}
