#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;

use gs_core::ExecutionMode;
use serde::Serialize;

/// Entries kept by a ledger created without an explicit capacity.
pub const DEFAULT_LEDGER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Policy,
    State,
    Update,
    Rejection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceEntry {
    /// Position in the full recording history; gaps mean eviction.
    pub seq: u64,
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Bounded log of the most recent evidence entries.
///
/// Once `capacity` entries are held, recording a new one evicts the oldest.
/// `seq` keeps counting across evictions, drains and clears, so a consumer
/// that drains periodically can tell whether it missed anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceLedger {
    capacity: usize,
    next_seq: u64,
    evicted: u64,
    entries: VecDeque<EvidenceEntry>,
}

impl Default for EvidenceLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_seq: 0,
            evicted: 0,
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LEDGER_CAPACITY)),
        }
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(EvidenceEntry {
            seq: self.next_seq,
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
        self.next_seq += 1;
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinks or grows the bound; shrinking evicts the oldest entries.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
    }

    /// Entries dropped to stay within capacity since construction.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Total entries ever recorded, including evicted and drained ones.
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.next_seq
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&EvidenceEntry> {
        self.entries.back()
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hands every held entry to the caller, oldest first.
    pub fn drain(&mut self) -> Vec<EvidenceEntry> {
        self.entries.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// One JSON object per line, oldest first.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Execution mode plus the ledger that records decisions made under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(ExecutionMode::default())
    }
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_ledger(mode, EvidenceLedger::new())
    }

    #[must_use]
    pub fn with_ledger(mode: ExecutionMode, ledger: EvidenceLedger) -> Self {
        let mut ctx = Self { mode, ledger };
        ctx.record(EvidenceKind::Policy, format!("mode initialized to {mode:?}"));
        ctx
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        let previous = self.mode;
        self.mode = mode;
        self.record(
            EvidenceKind::Policy,
            format!("mode switched from {previous:?} to {mode:?}"),
        );
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.record(kind, summary);
    }

    pub fn record_rejection<E>(&mut self, operation: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.record(
            EvidenceKind::Rejection,
            format!("{operation} rejected: {error}"),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use gs_core::ExecutionMode;

    use super::{DEFAULT_LEDGER_CAPACITY, EvidenceKind, EvidenceLedger, RuntimeContext};

    #[test]
    fn context_records_initial_and_switched_mode() {
        let mut ctx = RuntimeContext::default();
        assert_eq!(ctx.mode(), ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        let summaries: Vec<&str> = ctx
            .ledger()
            .entries_of(EvidenceKind::Policy)
            .map(|entry| entry.summary.as_str())
            .collect();
        assert_eq!(
            summaries,
            vec!["mode initialized to Strict", "mode switched from Strict to Hardened"]
        );
        assert_eq!(ctx.ledger().capacity(), DEFAULT_LEDGER_CAPACITY);
    }

    #[test]
    fn rejection_records_operation_and_diagnostic() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.record_rejection("rmsprop.apply param=w", "shape mismatch");

        let entry = ctx.ledger().latest().expect("rejection entry should be present");
        assert_eq!(entry.kind, EvidenceKind::Rejection);
        assert_eq!(entry.summary, "rmsprop.apply param=w rejected: shape mismatch");
    }

    #[test]
    fn full_ledger_evicts_oldest_entries() {
        let mut ledger = EvidenceLedger::with_capacity(3);
        for step in 0..10 {
            ledger.record(EvidenceKind::Update, format!("step={step}"));
        }

        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.evicted(), 7);
        assert_eq!(ledger.recorded(), 10);
        let seqs: Vec<u64> = ledger.iter().map(|entry| entry.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9]);
        assert_eq!(ledger.latest().map(|entry| entry.summary.as_str()), Some("step=9"));
    }

    #[test]
    fn shrinking_capacity_trims_immediately() {
        let mut ledger = EvidenceLedger::with_capacity(8);
        for step in 0..5 {
            ledger.record(EvidenceKind::State, format!("alloc {step}"));
        }
        ledger.set_capacity(2);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.evicted(), 3);

        ledger.set_capacity(0);
        assert_eq!(ledger.capacity(), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn drain_empties_but_sequence_continues() {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Update, "a");
        ledger.record(EvidenceKind::Update, "b");

        let drained = ledger.drain();
        assert_eq!(drained.len(), 2);
        assert!(ledger.is_empty());
        assert_eq!(ledger.evicted(), 0);

        ledger.record(EvidenceKind::Update, "c");
        assert_eq!(ledger.latest().map(|entry| entry.seq), Some(2));

        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(ledger.recorded(), 3);
    }

    #[test]
    fn jsonl_export_emits_one_object_per_entry() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        ctx.record(EvidenceKind::Update, "param=w step=0");

        let jsonl = ctx.ledger().to_jsonl().expect("ledger should serialize");
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value =
            serde_json::from_str(lines[1]).expect("each line should be valid json");
        assert_eq!(parsed["kind"], "update");
        assert_eq!(parsed["seq"], 1);
        assert_eq!(parsed["summary"], "param=w step=0");
        assert!(parsed["ts_unix_ms"].is_u64());
    }
}
