// crates/lontalk-rs/src/app/nm.rs
//! Network-management command handlers (spec §4.7 "Key handlers and their
//! contracts"), grounded in `original_source/lcs_netmgmt.c`'s `HandleNM*`
//! family.
//!
//! Request/response body layouts below are not lifted byte-for-byte from the
//! original (its `NMStruct`/`DomainStruct` wire encodings live in a header
//! this pack doesn't carry); instead each handler's wire shape follows the
//! persisted field order already established in [`crate::config`] and
//! [`crate::config::memory`], so `UPDATE_DOMAIN`/`QUERY_DOMAIN` and
//! `UPDATE_ADDR`/`QUERY_ADDR` round-trip the exact same struct the
//! configuration image stores (see `DESIGN.md`).

use super::{AppContext, AppOutcome};
use crate::config::{AddrTableEntry, Domain, NvAliasEntry, NvConfigEntry};
use crate::types::{AddressModeTag, NodeState};
use alloc::vec;
use alloc::vec::Vec;
use core::convert::TryFrom;

pub const QUERY_ID: u8 = 0x61;
pub const RESPOND_TO_QUERY: u8 = 0x62;
pub const UPDATE_DOMAIN: u8 = 0x63;
pub const LEAVE_DOMAIN: u8 = 0x64;
pub const UPDATE_KEY: u8 = 0x65;
pub const UPDATE_ADDR: u8 = 0x66;
pub const QUERY_ADDR: u8 = 0x67;
pub const QUERY_NV_CNFG: u8 = 0x68;
pub const UPDATE_GROUP_ADDR: u8 = 0x69;
pub const QUERY_DOMAIN: u8 = 0x6A;
pub const UPDATE_NV_CNFG: u8 = 0x6B;
pub const SET_NODE_MODE: u8 = 0x6C;
pub const READ_MEMORY: u8 = 0x6D;
pub const WRITE_MEMORY: u8 = 0x6E;
pub const CHECKSUM_RECALC: u8 = 0x6F;
pub const WINK: u8 = 0x70;
/// Device-specific extension present in the original opcode space but not
/// named by the spec's handler list; a thin failure stub keeps the dispatch
/// table exhaustive over the `0x6x`/`0x7x` code-byte range (see DESIGN.md).
pub const MEMORY_REFRESH: u8 = 0x71;
/// As `MEMORY_REFRESH`: named in the original opcode space, not specified
/// here; thin failure stub.
pub const QUERY_SNVT: u8 = 0x72;
pub const NV_FETCH: u8 = 0x73;
pub const MANUAL_SERVICE_REQUEST: u8 = 0x1F;
pub const EXPANDED: u8 = 0x7D;

/// `WINK`'s sub-command that asks for the node's id/program id instead of a
/// bare wink action (§4.7 `WINK`).
pub const WINK_SEND_ID_INFO: u8 = 0x01;

/// Overwrites a domain's id field on `LEAVE_DOMAIN` instead of all-0xFF —
/// Design Notes §9 open question 1, pinned as-is rather than silently
/// "fixed" to 0xFF.
const LEAVE_DOMAIN_SENTINEL: [u8; 6] = *b"gmrdwf";

/// Sub-commands of `EXPANDED` (0x7D).
pub mod expanded {
    pub const QUERY_VERSION: u8 = 0x00;
    pub const UPDATE_DOMAIN_NO_KEY: u8 = 0x01;
    pub const REPORT_DOMAIN_NO_KEY: u8 = 0x02;
    pub const REPORT_KEY: u8 = 0x03;
    pub const UPDATE_KEY: u8 = 0x04;

    /// `EXPANDED QUERY_VERSION` capability bits (spec §4.7).
    pub const CAP_OMA: u8 = 0x01;
    pub const CAP_PROXY: u8 = 0x02;
    pub const CAP_SSI: u8 = 0x04;
    pub const VERSION: u8 = 2;
}

/// Success-family offset: NM request codes live at `0x60..=0x7F`; the
/// response reuses the same low nibble with this bit set (spec §7, §8
/// scenario 2/6). `QUERY_ID` is the one fixed exception (below).
const RESP_SUCCESS_BIT: u8 = 0x10;
/// Failure-family offset, distinct from both the request range and the
/// success range so a requester can always tell the two apart on the wire.
const RESP_FAILURE_BIT: u8 = 0x90;

/// `QUERY_ID`'s response code is fixed regardless of the request's low
/// nibble so scanning tools can filter on one constant (spec §8 scenario 1).
const QUERY_ID_RESPONSE: u8 = 0x7B;

fn success_code(code: u8) -> u8 {
    if code == QUERY_ID {
        QUERY_ID_RESPONSE
    } else {
        code | RESP_SUCCESS_BIT
    }
}

fn failure_code(code: u8) -> u8 {
    if code == QUERY_ID {
        QUERY_ID_RESPONSE
    } else {
        code | RESP_FAILURE_BIT
    }
}

fn ok(code: u8, body: Vec<u8>) -> AppOutcome {
    AppOutcome::Response { code: success_code(code), body }
}

fn fail(code: u8) -> AppOutcome {
    AppOutcome::Response { code: failure_code(code), body: Vec::new() }
}

fn null(code: u8) -> AppOutcome {
    AppOutcome::NullResponse { code: success_code(code) }
}

/// Parses an NV/alias table index: a bare byte, or the `(255, hi, lo)`
/// escape for indices >= 255 (spec §4.7 `UPDATE_NV_CNFG`/`QUERY_NV_CNFG`).
/// Returns the index and the remaining body.
fn parse_nv_index(body: &[u8]) -> Option<(u16, &[u8])> {
    match body.first()? {
        255 => {
            let hi = *body.get(1)?;
            let lo = *body.get(2)?;
            Some((u16::from_be_bytes([hi, lo]), &body[3..]))
        }
        &b => Some((b as u16, &body[1..])),
    }
}

fn encode_domain(d: &Domain) -> Vec<u8> {
    let mut out = Vec::with_capacity(15);
    out.extend_from_slice(&d.id);
    out.push(d.len);
    out.push(d.subnet);
    out.push(d.node);
    out.extend_from_slice(&d.key);
    out
}

fn decode_domain(body: &[u8]) -> Option<Domain> {
    if body.len() < 15 {
        return None;
    }
    let mut id = [0u8; 6];
    id.copy_from_slice(&body[0..6]);
    let len = body[6];
    let subnet = body[7];
    let node = body[8];
    let mut key = [0u8; 6];
    key.copy_from_slice(&body[9..15]);
    Some(Domain { id, len, subnet, node, key, valid: true })
}

fn encode_addr_entry(a: &AddrTableEntry) -> Vec<u8> {
    vec![
        a.mode as u8,
        a.domain_index,
        a.subnet,
        a.node_or_group,
        a.repeat_timer,
        a.retry_count,
        a.receive_timer,
        a.transmit_timer,
        a.group_size,
    ]
}

fn decode_addr_entry(body: &[u8]) -> Option<AddrTableEntry> {
    if body.len() < 9 {
        return None;
    }
    Some(AddrTableEntry {
        mode: AddressModeTag::try_from(body[0]).ok()?,
        domain_index: body[1],
        subnet: body[2],
        node_or_group: body[3],
        repeat_timer: body[4],
        retry_count: body[5],
        receive_timer: body[6],
        transmit_timer: body[7],
        group_size: body[8],
    })
}

fn encode_nv_entry(nv: &NvConfigEntry) -> Vec<u8> {
    let sel = nv.selector.to_be_bytes();
    vec![
        nv.direction_is_output as u8,
        sel[0],
        sel[1],
        nv.priority as u8,
        nv.service,
        nv.auth as u8,
        nv.addr_index,
        nv.turnaround as u8,
        nv.length,
    ]
}

fn decode_nv_entry(body: &[u8]) -> Option<NvConfigEntry> {
    if body.len() < 9 {
        return None;
    }
    Some(NvConfigEntry {
        direction_is_output: body[0] != 0,
        selector: u16::from_be_bytes([body[1], body[2]]),
        priority: body[3] != 0,
        service: body[4],
        auth: body[5] != 0,
        addr_index: body[6],
        turnaround: body[7] != 0,
        length: body[8],
    })
}

fn encode_alias_entry(a: &NvAliasEntry) -> Vec<u8> {
    let p = a.primary_index.to_be_bytes();
    let s = a.selector.to_be_bytes();
    vec![p[0], p[1], s[0], s[1], a.addr_index]
}

pub fn handle(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    match code {
        QUERY_ID => handle_query_id(body, ctx),
        RESPOND_TO_QUERY => {
            *ctx.select_query = !*ctx.select_query;
            AppOutcome::NoResponse
        }
        UPDATE_DOMAIN => handle_update_domain(code, body, ctx),
        LEAVE_DOMAIN => handle_leave_domain(body, ctx),
        UPDATE_KEY => handle_update_key(code, body, ctx),
        UPDATE_ADDR => handle_update_addr(code, body, ctx),
        QUERY_ADDR => handle_query_addr(code, body, ctx),
        QUERY_NV_CNFG => handle_query_nv_cnfg(code, body, ctx),
        UPDATE_GROUP_ADDR => handle_update_group_addr(code, body, ctx),
        QUERY_DOMAIN => handle_query_domain(code, body, ctx),
        UPDATE_NV_CNFG => handle_update_nv_cnfg(code, body, ctx),
        SET_NODE_MODE => handle_set_node_mode(code, body, ctx),
        READ_MEMORY => handle_read_memory(code, body, ctx),
        WRITE_MEMORY => handle_write_memory(code, body, ctx),
        CHECKSUM_RECALC => {
            ctx.config.recompute_checksum();
            ok(code, Vec::new())
        }
        WINK => handle_wink(code, body, ctx),
        MEMORY_REFRESH | QUERY_SNVT => fail(code),
        NV_FETCH => handle_query_nv_cnfg(code, body, ctx),
        EXPANDED => handle_expanded(code, body, ctx),
        _ => fail(code),
    }
}

fn handle_query_id(body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&selector) = body.first() else {
        return null(QUERY_ID);
    };
    let configured = matches!(ctx.config.state, NodeState::ConfigOnline | NodeState::ConfigOffline);
    let satisfied = match selector {
        0 => !configured,                           // UNCONFIGURED
        1 => *ctx.select_query,                      // SELECTED
        2 => *ctx.select_query && !configured,        // SELECTED_UNCFG
        _ => false,
    };
    if !satisfied {
        return null(QUERY_ID);
    }
    if body.len() > 1 {
        // Optional memory-match window: {offset:2 BE, len:1, data:len}.
        if body.len() < 4 {
            return null(QUERY_ID);
        }
        let offset = u16::from_be_bytes([body[1], body[2]]);
        let len = body[3];
        let expected = &body[4..];
        match crate::config::memory::read_at(ctx.config, offset, len) {
            Ok(actual) if actual == expected => {}
            _ => return null(QUERY_ID),
        }
    }
    let mut out = Vec::with_capacity(14);
    out.extend_from_slice(&ctx.config.read_only.unique_node_id.0);
    out.extend_from_slice(&ctx.config.read_only.program_id);
    ok(QUERY_ID, out)
}

fn handle_update_domain(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&index) = body.first() else { return fail(code) };
    let Some(domain) = decode_domain(&body[1..]) else { return fail(code) };
    match ctx.config.domain_mut(index) {
        Some(slot) => {
            *slot = domain;
            ctx.config.recompute_checksum();
            ok(code, Vec::new())
        }
        None => {
            ctx.error_log.record(crate::hal::ERR_INVALID_ADDR_TABLE_INDEX);
            fail(code)
        }
    }
}

fn handle_leave_domain(body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&index) = body.first() else { return AppOutcome::NoResponse };
    if let Some(slot) = ctx.config.domain_mut(index) {
        *slot = Domain { id: LEAVE_DOMAIN_SENTINEL, len: 0, subnet: 0, node: 0, key: [0xFF; 6], valid: false };
    }
    if !ctx.config.any_domain_valid() {
        ctx.config.state = NodeState::ApplUnconfig;
        *ctx.reset_requested = Some(crate::types::ResetCause::SoftwareReset);
    }
    ctx.config.recompute_checksum();
    // Spec §8 scenario 5: no response is sent on the domain just left.
    AppOutcome::NoResponse
}

fn handle_update_key(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    if body.len() < 7 {
        return fail(code);
    }
    let index = body[0];
    let Some(slot) = ctx.config.domain_mut(index) else {
        ctx.error_log.record(crate::hal::ERR_INVALID_ADDR_TABLE_INDEX);
        return fail(code);
    };
    for i in 0..6 {
        slot.key[i] = slot.key[i].wrapping_add(body[1 + i]);
    }
    ctx.config.recompute_checksum();
    ok(code, Vec::new())
}

fn handle_update_addr(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&index) = body.first() else { return fail(code) };
    let Some(entry) = decode_addr_entry(&body[1..]) else { return fail(code) };
    match ctx.config.addr_table.get_mut(index as usize) {
        Some(slot) => {
            *slot = entry;
            ctx.config.recompute_checksum();
            ok(code, Vec::new())
        }
        None => {
            ctx.error_log.record(crate::hal::ERR_INVALID_ADDR_TABLE_INDEX);
            fail(code)
        }
    }
}

fn handle_query_addr(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&index) = body.first() else { return fail(code) };
    match ctx.config.addr_table.get(index as usize) {
        Some(entry) => ok(code, encode_addr_entry(entry)),
        None => {
            ctx.error_log.record(crate::hal::ERR_INVALID_ADDR_TABLE_INDEX);
            fail(code)
        }
    }
}

fn handle_update_group_addr(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let (Some(domain_index), Some(group)) = (ctx.arrival_domain_index, ctx.arrival_group) else {
        return null(code);
    };
    let Some(entry_update) = decode_addr_entry(body) else { return fail(code) };
    let slot = ctx
        .config
        .addr_table
        .iter_mut()
        .find(|e| e.mode == AddressModeTag::Group && e.domain_index == domain_index && e.node_or_group == group);
    match slot {
        Some(slot) => {
            *slot = AddrTableEntry { domain_index, node_or_group: group, ..entry_update };
            ctx.config.recompute_checksum();
            ok(code, Vec::new())
        }
        None => null(code),
    }
}

fn handle_query_domain(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&index) = body.first() else { return fail(code) };
    match ctx.config.domain(index) {
        Some(d) => ok(code, encode_domain(d)),
        None => {
            ctx.error_log.record(crate::hal::ERR_INVALID_ADDR_TABLE_INDEX);
            fail(code)
        }
    }
}

fn handle_update_nv_cnfg(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some((index, rest)) = parse_nv_index(body) else { return fail(code) };
    let Some(entry) = decode_nv_entry(rest) else { return fail(code) };
    match ctx.config.nv_config.get_mut(index as usize) {
        Some(slot) => {
            *slot = entry;
            ctx.config.recompute_checksum();
            ok(code, Vec::new())
        }
        None => {
            ctx.error_log.record(crate::hal::ERR_INVALID_NV_INDEX);
            fail(code)
        }
    }
}

fn handle_query_nv_cnfg(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some((index, _rest)) = parse_nv_index(body) else { return fail(code) };
    let nv_len = ctx.config.nv_config.len();
    if (index as usize) < nv_len {
        return ok(code, encode_nv_entry(&ctx.config.nv_config[index as usize]));
    }
    let alias_index = index as usize - nv_len;
    match ctx.config.nv_alias.get(alias_index) {
        Some(alias) => ok(code, encode_alias_entry(alias)),
        None => {
            ctx.error_log.record(crate::hal::ERR_INVALID_NV_INDEX);
            fail(code)
        }
    }
}

fn handle_set_node_mode(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some(&sub) = body.first() else { return fail(code) };
    match sub {
        0 => ctx.config.state = NodeState::ConfigOffline,
        1 => ctx.config.state = NodeState::ConfigOnline,
        2 => *ctx.reset_requested = Some(crate::types::ResetCause::SoftwareReset),
        3 => {
            let Some(&raw) = body.get(1) else { return fail(code) };
            let Ok(new_state) = NodeState::try_from(raw) else { return fail(code) };
            ctx.config.state = new_state;
            if new_state == NodeState::NoApplUnconfig {
                *ctx.app_running = false;
            }
        }
        _ => return fail(code),
    }
    ctx.config.recompute_checksum();
    ok(code, Vec::new())
}

/// `mode` byte selecting the absolute-memory base for `READ_MEMORY`/
/// `WRITE_MEMORY` (spec §4.7).
const MEM_MODE_ABSOLUTE: u8 = 0;
const MEM_MODE_CONFIG_RELATIVE: u8 = 1;
const MEM_MODE_READ_ONLY_RELATIVE: u8 = 2;
const MEM_MODE_STATS_RELATIVE: u8 = 3;

fn stats_bytes(ctx: &AppContext<'_>) -> Vec<u8> {
    vec![
        ctx.config.reset_cause as u8,
        ctx.config.state as u8,
        ctx.version_number,
        ctx.error_log.len() as u8,
    ]
}

fn memory_base(mode: u8, ctx: &AppContext<'_>) -> Option<usize> {
    match mode {
        MEM_MODE_ABSOLUTE => Some(0),
        MEM_MODE_CONFIG_RELATIVE => Some(crate::config::memory::config_relative_base(ctx.config)),
        MEM_MODE_READ_ONLY_RELATIVE => Some(0),
        MEM_MODE_STATS_RELATIVE => None, // handled separately: a synthetic buffer, not the eep image.
        _ => None,
    }
}

fn handle_read_memory(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    if body.len() < 4 {
        return fail(code);
    }
    let mode = body[0];
    let offset = u16::from_be_bytes([body[1], body[2]]);
    let len = body[3];

    if mode == MEM_MODE_STATS_RELATIVE {
        let buf = stats_bytes(ctx);
        let start = offset as usize;
        let end = start + len as usize;
        return match buf.get(start..end) {
            Some(slice) => ok(code, slice.to_vec()),
            None => fail(code),
        };
    }

    // Design Notes §9 open question 2: an absolute read of address 0 with
    // length exactly 1 reports BASE_FIRMWARE_VERSION instead of the byte
    // actually stored there (the first unique-node-id byte); longer reads
    // at address 0 read the real memory.
    if mode == MEM_MODE_ABSOLUTE && offset == 0 && len == 1 {
        return ok(code, vec![ctx.config.read_only.base_firmware_version]);
    }

    let Some(base) = memory_base(mode, ctx) else { return fail(code) };
    match crate::config::memory::read_at(ctx.config, base as u16 + offset, len) {
        Ok(data) => ok(code, data),
        Err(_) => {
            ctx.error_log.record(crate::hal::ERR_WRITE_PAST_END_OF_APPL_BUFFER);
            fail(code)
        }
    }
}

/// `form` byte bits (spec §4.7 `WRITE_MEMORY` "honours `form` flags").
const FORM_RECALC_CHECKSUM: u8 = 0x01;
const FORM_RESET: u8 = 0x02;

fn handle_write_memory(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    if body.len() < 5 {
        return fail(code);
    }
    let mode = body[0];
    let offset = u16::from_be_bytes([body[1], body[2]]);
    let len = body[3] as usize;
    if body.len() < 4 + len + 1 {
        return fail(code);
    }
    let data = &body[4..4 + len];
    let form = body[4 + len];

    // readWriteProtect: writes are only honoured in the configData window.
    if mode != MEM_MODE_CONFIG_RELATIVE {
        ctx.error_log.record(crate::hal::ERR_WRITE_PAST_END_OF_APPL_BUFFER);
        return fail(code);
    }
    let base = crate::config::memory::config_relative_base(ctx.config) as u16;
    if crate::config::memory::write_at(ctx.config, base + offset, data).is_err() {
        ctx.error_log.record(crate::hal::ERR_WRITE_PAST_END_OF_APPL_BUFFER);
        return fail(code);
    }
    if form & FORM_RECALC_CHECKSUM != 0 {
        ctx.config.recompute_checksum();
    }
    if form & FORM_RESET != 0 {
        *ctx.reset_requested = Some(crate::types::ResetCause::SoftwareReset);
    }
    ok(code, Vec::new())
}

fn handle_wink(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    match body.first() {
        None => AppOutcome::Wink,
        Some(&WINK_SEND_ID_INFO) => {
            let mut out = Vec::with_capacity(14);
            out.extend_from_slice(&ctx.config.read_only.unique_node_id.0);
            out.extend_from_slice(&ctx.config.read_only.program_id);
            ok(code, out)
        }
        // Design Notes §9 open question 3: the original reads a second body
        // byte here unconditionally, an out-of-bounds read for a 2-byte
        // PDU. We don't reproduce undefined behaviour; an unrecognised
        // sub-command is simply ignored.
        Some(_) => AppOutcome::NoResponse,
    }
}

fn handle_expanded(code: u8, body: &[u8], ctx: &mut AppContext<'_>) -> AppOutcome {
    let Some((&sub, rest)) = body.split_first() else { return fail(code) };
    match sub {
        expanded::QUERY_VERSION => {
            let caps = expanded::CAP_OMA | expanded::CAP_PROXY | expanded::CAP_SSI;
            ok(code, vec![expanded::VERSION, caps])
        }
        expanded::UPDATE_DOMAIN_NO_KEY => {
            if rest.len() < 9 {
                return fail(code);
            }
            let index = rest[0];
            let Some(slot) = ctx.config.domain_mut(index) else {
                ctx.error_log.record(crate::hal::ERR_INVALID_ADDR_TABLE_INDEX);
                return fail(code);
            };
            slot.id.copy_from_slice(&rest[1..7]);
            slot.len = rest[7];
            slot.subnet = rest[8];
            if let Some(&node) = rest.get(9) {
                slot.node = node;
            }
            slot.valid = true;
            ctx.config.recompute_checksum();
            ok(code, Vec::new())
        }
        expanded::REPORT_DOMAIN_NO_KEY => {
            let Some(&index) = rest.first() else { return fail(code) };
            match ctx.config.domain(index) {
                Some(d) => {
                    let mut out = Vec::with_capacity(9);
                    out.extend_from_slice(&d.id);
                    out.push(d.len);
                    out.push(d.subnet);
                    out.push(d.node);
                    ok(code, out)
                }
                None => fail(code),
            }
        }
        expanded::REPORT_KEY => {
            let mut out = Vec::with_capacity(12);
            out.extend_from_slice(&ctx.config.domains[0].key);
            out.extend_from_slice(&ctx.config.domains[1].key);
            ok(code, out)
        }
        expanded::UPDATE_KEY => {
            if rest.len() < 13 {
                return fail(code);
            }
            let replace = rest[0] != 0;
            let key12 = &rest[1..13];
            for (i, domain) in ctx.config.domains.iter_mut().enumerate() {
                let chunk = &key12[i * 6..i * 6 + 6];
                if replace {
                    domain.key.copy_from_slice(chunk);
                } else {
                    for j in 0..6 {
                        domain.key[j] = domain.key[j].wrapping_add(chunk[j]);
                    }
                }
            }
            ctx.config.recompute_checksum();
            ok(code, Vec::new())
        }
        _ => fail(code),
    }
}
