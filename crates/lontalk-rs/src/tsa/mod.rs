// crates/lontalk-rs/src/tsa/mod.rs
//! Transport / Session / Auth layer (spec §4.5): TPDU/SPDU/AUTHPDU framing,
//! retry scheduling with exponential per-attempt timers drawn from the
//! `addrTable` entry, duplicate detection, and proxy forwarding. Grounded in
//! `original_source/lcs_tcs.c`'s transport/session state machine.

pub mod auth;

use crate::hal::LonError;
use crate::transaction::DestSignature;
use alloc::vec::Vec;

/// Per-attempt timer values selected by an `addrTable` entry's 4-bit
/// `repeat_timer` field, in milliseconds. Values follow the standard
/// LonTalk repeat-timer progression (§4.5 "exponential timers from the
/// addrTable entry").
pub const REPEAT_TIMER_MS: [u32; 16] =
    [16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072];

pub fn repeat_timer_ms(code: u8) -> u32 {
    REPEAT_TIMER_MS[(code & 0x0F) as usize]
}

/// The four TSA service classes (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsaService {
    Unackd,
    UnackdRpt,
    Ackd,
    Request,
}

/// Common header carried by TPDU/SPDU/AUTHPDU bodies: a response flag plus
/// the 4-bit TID (spec glossary "TID").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsaHeader {
    pub response: bool,
    pub tid: u8,
}

impl TsaHeader {
    pub fn encode(&self) -> u8 {
        (self.response as u8) << 7 | (self.tid & 0x0F)
    }

    pub fn decode(byte: u8) -> Self {
        TsaHeader { response: byte & 0x80 != 0, tid: byte & 0x0F }
    }
}

/// Wraps `payload` behind a `TsaHeader` byte, usable for TPDU, SPDU, and
/// AUTHPDU bodies alike.
pub fn encode_body(header: TsaHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(header.encode());
    out.extend_from_slice(payload);
    out
}

pub fn decode_body(body: &[u8]) -> Result<(TsaHeader, &[u8]), LonError> {
    let &first = body.first().ok_or(LonError::BufferTooShort)?;
    Ok((TsaHeader::decode(first), &body[1..]))
}

/// Tracks the last (tid) seen per peer signature so a retried acknowledged
/// or request message isn't re-delivered to the application (spec §4.5
/// "duplicate detection via the (source, TID, priority) tuple").
pub struct DuplicateTracker {
    seen: Vec<(DestSignature, bool, u8, u64)>,
    ttl_ms: u64,
}

impl DuplicateTracker {
    pub fn new(ttl_ms: u64) -> Self {
        Self { seen: Vec::new(), ttl_ms }
    }

    /// Returns `true` if `(source, priority, tid)` was already recorded and
    /// hasn't expired; otherwise records it and returns `false`.
    pub fn check_and_record(&mut self, source: &DestSignature, priority: bool, tid: u8, now_ms: u64) -> bool {
        self.seen.retain(|(_, _, _, expires)| *expires > now_ms);
        if let Some(entry) = self
            .seen
            .iter_mut()
            .find(|(sig, p, t, _)| sig == source && *p == priority && *t == tid)
        {
            entry.3 = now_ms + self.ttl_ms;
            return true;
        }
        self.seen.push((source.clone(), priority, tid, now_ms + self.ttl_ms));
        false
    }

    /// External-reset / power-up clears duplicate history along with the
    /// TID table (§4.6).
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// One outbound transaction awaiting acknowledgement or responses.
pub struct PendingTransaction {
    pub priority: bool,
    pub tid: u8,
    pub service: TsaService,
    pub npdu: Vec<u8>,
    pub alt_path: bool,
    pub attempts_left: u8,
    pub repeat_timer_ms: u32,
    pub next_attempt_at_ms: u64,
    pub group_size: u8,
    pub responses_collected: u8,
    pub timeout_at_ms: u64,
    pub cancelled: bool,
    /// Proxy bookkeeping: the original request's tag, re-used when the
    /// proxied response comes back (§4.5 "Proxy forwarding").
    pub proxy_reply_tag: Option<u32>,
}

/// Outcome of a `tick` sweep over pending transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsaEvent {
    Retransmit { npdu: Vec<u8>, priority: bool, tid: u8, alt_path: bool },
    Completion { tid: u8, success: bool, proxy_reply_tag: Option<u32> },
}

/// Drives retry/timeout bookkeeping for in-flight transactions. Actual
/// framing/dispatch of individual PDUs is the caller's job; this only
/// tracks attempts-remaining and due times.
pub struct RetryScheduler {
    pending: Vec<PendingTransaction>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn submit(&mut self, txn: PendingTransaction) {
        self.pending.push(txn);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Acknowledges (or, for REQUEST, records one response toward) the
    /// transaction with the given `tid`/`priority`. Returns `true` if this
    /// completed the transaction.
    pub fn on_response(&mut self, priority: bool, tid: u8, now_ms: u64) -> Vec<TsaEvent> {
        let mut events = Vec::new();
        self.pending.retain_mut(|txn| {
            if txn.priority != priority || txn.tid != tid {
                return true;
            }
            match txn.service {
                TsaService::Ackd | TsaService::Unackd | TsaService::UnackdRpt => {
                    events.push(TsaEvent::Completion {
                        tid: txn.tid,
                        success: true,
                        proxy_reply_tag: txn.proxy_reply_tag,
                    });
                    false
                }
                TsaService::Request => {
                    txn.responses_collected = txn.responses_collected.saturating_add(1);
                    if txn.responses_collected >= txn.group_size.max(1) || now_ms >= txn.timeout_at_ms {
                        events.push(TsaEvent::Completion {
                            tid: txn.tid,
                            success: true,
                            proxy_reply_tag: txn.proxy_reply_tag,
                        });
                        false
                    } else {
                        true
                    }
                }
            }
        });
        events
    }

    /// Marks a scheduled transaction cancelled (`AppCancel(tag)`, §5); its
    /// next `tick` will emit a failed completion and drop it.
    pub fn cancel(&mut self, priority: bool, tid: u8) {
        for txn in self.pending.iter_mut() {
            if txn.priority == priority && txn.tid == tid {
                txn.cancelled = true;
            }
        }
    }

    /// Advances all pending transactions by one scheduler sweep, producing
    /// retransmissions for those whose timer has elapsed and completions
    /// for those that are cancelled, exhausted, or timed out.
    pub fn tick(&mut self, now_ms: u64) -> Vec<TsaEvent> {
        let mut events = Vec::new();
        self.pending.retain_mut(|txn| {
            if txn.cancelled {
                events.push(TsaEvent::Completion { tid: txn.tid, success: false, proxy_reply_tag: txn.proxy_reply_tag });
                return false;
            }
            if now_ms < txn.next_attempt_at_ms {
                return true;
            }
            if txn.attempts_left == 0 {
                let success = matches!(txn.service, TsaService::Request) && txn.responses_collected > 0;
                events.push(TsaEvent::Completion { tid: txn.tid, success, proxy_reply_tag: txn.proxy_reply_tag });
                return false;
            }
            txn.attempts_left -= 1;
            txn.next_attempt_at_ms = now_ms + txn.repeat_timer_ms as u64;
            events.push(TsaEvent::Retransmit { npdu: txn.npdu.clone(), priority: txn.priority, tid: txn.tid, alt_path: txn.alt_path });
            true
        });
        events
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> DestSignature {
        DestSignature { domain: alloc::vec![0x2C], addr_fmt: 2, addr_key: 1 }
    }

    #[test]
    fn duplicate_tracker_flags_repeat_within_window() {
        let mut tracker = DuplicateTracker::new(24_000);
        assert!(!tracker.check_and_record(&sig(), false, 3, 0));
        assert!(tracker.check_and_record(&sig(), false, 3, 100));
    }

    #[test]
    fn duplicate_tracker_forgets_after_ttl() {
        let mut tracker = DuplicateTracker::new(1_000);
        assert!(!tracker.check_and_record(&sig(), false, 3, 0));
        assert!(!tracker.check_and_record(&sig(), false, 3, 2_000));
    }

    #[test]
    fn ackd_completes_on_first_response() {
        let mut sched = RetryScheduler::new();
        sched.submit(PendingTransaction {
            priority: false,
            tid: 4,
            service: TsaService::Ackd,
            npdu: alloc::vec![1, 2, 3],
            alt_path: false,
            attempts_left: 3,
            repeat_timer_ms: 100,
            next_attempt_at_ms: 100,
            group_size: 1,
            responses_collected: 0,
            timeout_at_ms: 1_000,
            cancelled: false,
            proxy_reply_tag: None,
        });
        let events = sched.on_response(false, 4, 0);
        assert_eq!(events, alloc::vec![TsaEvent::Completion { tid: 4, success: true, proxy_reply_tag: None }]);
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn exhausted_ackd_reports_failure() {
        let mut sched = RetryScheduler::new();
        sched.submit(PendingTransaction {
            priority: false,
            tid: 4,
            service: TsaService::Ackd,
            npdu: alloc::vec![1],
            alt_path: false,
            attempts_left: 0,
            repeat_timer_ms: 100,
            next_attempt_at_ms: 0,
            group_size: 1,
            responses_collected: 0,
            timeout_at_ms: 0,
            cancelled: false,
            proxy_reply_tag: None,
        });
        let events = sched.tick(0);
        assert_eq!(events, alloc::vec![TsaEvent::Completion { tid: 4, success: false, proxy_reply_tag: None }]);
    }

    #[test]
    fn request_collects_until_group_size() {
        let mut sched = RetryScheduler::new();
        sched.submit(PendingTransaction {
            priority: false,
            tid: 2,
            service: TsaService::Request,
            npdu: alloc::vec![9],
            alt_path: false,
            attempts_left: 3,
            repeat_timer_ms: 100,
            next_attempt_at_ms: 1_000,
            group_size: 2,
            responses_collected: 0,
            timeout_at_ms: 5_000,
            cancelled: false,
            proxy_reply_tag: None,
        });
        assert!(sched.on_response(false, 2, 10).is_empty());
        let events = sched.on_response(false, 2, 20);
        assert_eq!(events, alloc::vec![TsaEvent::Completion { tid: 2, success: true, proxy_reply_tag: None }]);
    }

    #[test]
    fn cancel_emits_failed_completion_on_next_tick() {
        let mut sched = RetryScheduler::new();
        sched.submit(PendingTransaction {
            priority: true,
            tid: 5,
            service: TsaService::Request,
            npdu: alloc::vec![1],
            alt_path: false,
            attempts_left: 3,
            repeat_timer_ms: 100,
            next_attempt_at_ms: 1_000,
            group_size: 1,
            responses_collected: 0,
            timeout_at_ms: 5_000,
            cancelled: false,
            proxy_reply_tag: None,
        });
        sched.cancel(true, 5);
        let events = sched.tick(0);
        assert_eq!(events, alloc::vec![TsaEvent::Completion { tid: 5, success: false, proxy_reply_tag: None }]);
    }

    #[test]
    fn proxy_reply_tag_threads_through_completion() {
        let mut sched = RetryScheduler::new();
        sched.submit(PendingTransaction {
            priority: false,
            tid: 6,
            service: TsaService::Ackd,
            npdu: alloc::vec![1],
            alt_path: false,
            attempts_left: 3,
            repeat_timer_ms: 100,
            next_attempt_at_ms: 100,
            group_size: 1,
            responses_collected: 0,
            timeout_at_ms: 1_000,
            cancelled: false,
            proxy_reply_tag: Some(77),
        });
        let events = sched.on_response(false, 6, 0);
        assert_eq!(
            events,
            alloc::vec![TsaEvent::Completion { tid: 6, success: true, proxy_reply_tag: Some(77) }]
        );
    }
}
