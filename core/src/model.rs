//! Panel data model: call records, per-queue panel state and announcement
//! requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Most recent calls kept per queue
pub const MAX_RECORDS: usize = 10;

/// Upper bound for `repeticoes`
pub const MAX_REPEAT_COUNT: u32 = 10;

/// Upper bound for `intervaloRepeticao` and `tempoExibicao`, in seconds
pub const MAX_PARAM_SECS: u64 = 3_600;

/// Canonical identity of a call.
///
/// Single-call messages carry a backend-assigned entry id; snapshot messages
/// only carry the origin timestamp. Every record stores exactly one key and
/// every dedup path compares keys, so the two message kinds share one
/// identity rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallKey {
    /// Backend queue-entry id (`entradaFilaId`)
    Entry(String),
    /// Queue plus origin instant (`dataHoraChamada`, normalized to UTC)
    Origin { queue_id: String, at: DateTime<Utc> },
}

impl CallKey {
    pub fn entry(id: impl Into<String>) -> Self {
        CallKey::Entry(id.into())
    }

    pub fn origin(queue_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        CallKey::Origin {
            queue_id: queue_id.into(),
            at,
        }
    }
}

/// One call shown on the panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub key: CallKey,
    pub queue_id: String,
    pub subject_name: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub is_new: bool,
    /// Ticket number (`senha`), single-call messages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_name: Option<String>,
}

/// Reconciled view of one queue: newest first, at most [`MAX_RECORDS`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueuePanelState {
    pub queue_id: String,
    pub records: Vec<CallRecord>,
}

impl QueuePanelState {
    pub fn new(queue_id: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &CallKey) -> Option<&CallRecord> {
        self.records.iter().find(|r| &r.key == key)
    }

    /// The record currently highlighted, if any
    pub fn new_record(&self) -> Option<&CallRecord> {
        self.records.iter().find(|r| r.is_new)
    }

    pub fn new_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_new).count()
    }

    /// Clears the highlight of the record with `key`. Returns true if a flag
    /// actually changed.
    pub(crate) fn clear_new(&mut self, key: &CallKey) -> bool {
        match self.records.iter_mut().find(|r| &r.key == key) {
            Some(record) if record.is_new => {
                record.is_new = false;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear_all_flags(&mut self) -> bool {
        let mut changed = false;
        for record in self.records.iter_mut().filter(|r| r.is_new) {
            record.is_new = false;
            changed = true;
        }
        changed
    }

    /// Merges a snapshot into the view.
    ///
    /// The current call replaces any record with its key; recent calls are
    /// only inserted when their key is absent so existing flags survive. When
    /// a current call is given, it becomes the only flagged record. Returns
    /// whether the current call is still present after truncation.
    pub(crate) fn merge_snapshot(
        &mut self,
        current: Option<CallRecord>,
        recent: Vec<CallRecord>,
    ) -> bool {
        let mut working: HashMap<CallKey, CallRecord> = self
            .records
            .drain(..)
            .map(|r| (r.key.clone(), r))
            .collect();

        let current_key = current.map(|record| {
            let key = record.key.clone();
            working.insert(key.clone(), record);
            key
        });

        for record in recent {
            working.entry(record.key.clone()).or_insert(record);
        }

        // Entry and Origin keys can describe the same instant; one record
        // per instant survives, preferring the current call, then a flagged
        // record, then the entry-keyed one.
        let is_current = |r: &CallRecord| current_key.as_ref() == Some(&r.key);
        let mut records: Vec<CallRecord> = working.into_values().collect();
        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| is_current(b).cmp(&is_current(a)))
                .then_with(|| b.is_new.cmp(&a.is_new))
                .then_with(|| a.key.cmp(&b.key))
        });
        records.dedup_by(|later, kept| later.timestamp == kept.timestamp);
        records.truncate(MAX_RECORDS);

        let mut retained = false;
        if let Some(key) = current_key.as_ref() {
            for record in records.iter_mut() {
                record.is_new = &record.key == key;
                retained |= record.is_new;
            }
        }

        self.records = records;
        retained
    }

    /// Puts a single call at the head, replacing any record with the same
    /// key, and makes it the only flagged record.
    pub(crate) fn push_single(&mut self, mut record: CallRecord) {
        self.records.retain(|r| r.key != record.key);
        for r in self.records.iter_mut() {
            r.is_new = false;
        }
        record.is_new = true;
        self.records.insert(0, record);
        self.records.truncate(MAX_RECORDS);
    }

    /// True when records are strictly descending by timestamp
    pub fn is_sorted_desc(&self) -> bool {
        self.records
            .windows(2)
            .all(|w| w[0].timestamp > w[1].timestamp)
    }
}

/// Request to speak a call out loud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementRequest {
    pub text: String,
    pub repeat_count: u32,
    pub repeat_interval_secs: u64,
}

impl AnnouncementRequest {
    /// Repeat count is clamped to `1..=MAX_REPEAT_COUNT` and the interval to
    /// `1..=MAX_PARAM_SECS`.
    pub fn new(text: impl Into<String>, repeat_count: u32, repeat_interval_secs: u64) -> Self {
        Self {
            text: text.into(),
            repeat_count: repeat_count.clamp(1, MAX_REPEAT_COUNT),
            repeat_interval_secs: repeat_interval_secs.clamp(1, MAX_PARAM_SECS),
        }
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::from_secs(self.repeat_interval_secs)
    }

    /// Delay of the i-th utterance relative to the announce call, `None` when
    /// it does not fit in a `Duration`.
    pub fn offset_of(&self, index: u32) -> Option<Duration> {
        self.repeat_interval().checked_mul(index)
    }
}

/// Substitutes `{nome}`, `{local}` and `{senha}` in an announcement template.
pub fn render_announcement(template: &str, record: &CallRecord) -> String {
    template
        .replace("{nome}", &record.subject_name)
        .replace("{local}", &record.location)
        .replace("{senha}", record.ticket.as_deref().unwrap_or(""))
        .trim()
        .trim_end_matches(',')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(queue: &str, name: &str, secs: i64) -> CallRecord {
        let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        CallRecord {
            key: CallKey::origin(queue, at),
            queue_id: queue.into(),
            subject_name: name.into(),
            location: "Sala 1".into(),
            timestamp: at,
            is_new: false,
            ticket: None,
            queue_name: None,
            sector_name: None,
        }
    }

    #[test]
    fn merge_keeps_existing_flags_for_recent_calls() {
        let mut state = QueuePanelState::new("q1");
        state.merge_snapshot(Some(record("q1", "Ana", 10)), vec![]);
        assert!(state.records[0].is_new);

        // Same call re-sent as history only: flag must not be touched
        state.merge_snapshot(None, vec![record("q1", "Ana", 10), record("q1", "Bia", 5)]);
        assert_eq!(state.len(), 2);
        assert_eq!(state.records[0].subject_name, "Ana");
        assert!(state.records[0].is_new);
        assert!(!state.records[1].is_new);
    }

    #[test]
    fn merge_sorts_and_truncates() {
        let mut state = QueuePanelState::new("q1");
        let recent: Vec<_> = (0..15).map(|i| record("q1", "x", i)).collect();
        let retained = state.merge_snapshot(None, recent);
        assert!(!retained);
        assert_eq!(state.len(), MAX_RECORDS);
        assert!(state.is_sorted_desc());
        assert_eq!(state.records[0].timestamp, record("q1", "x", 14).timestamp);
    }

    #[test]
    fn current_call_truncated_away_is_not_retained() {
        let mut state = QueuePanelState::new("q1");
        let recent: Vec<_> = (10..20).map(|i| record("q1", "x", i)).collect();
        let retained = state.merge_snapshot(Some(record("q1", "old", 0)), recent);
        assert!(!retained);
        assert_eq!(state.new_count(), 0);
    }

    #[test]
    fn announcement_request_clamps_to_one() {
        let req = AnnouncementRequest::new("Ana", 0, 0);
        assert_eq!(req.repeat_count, 1);
        assert_eq!(req.repeat_interval_secs, 1);
        assert_eq!(req.offset_of(2), Some(Duration::from_secs(2)));
    }

    #[test]
    fn announcement_request_caps_huge_values() {
        let req = AnnouncementRequest::new("Ana", u32::MAX, u64::MAX);
        assert_eq!(req.repeat_count, MAX_REPEAT_COUNT);
        assert_eq!(req.repeat_interval_secs, MAX_PARAM_SECS);

        // Hand-built requests skip the clamp
        let raw = AnnouncementRequest {
            text: "Ana".into(),
            repeat_count: 3,
            repeat_interval_secs: u64::MAX,
        };
        assert_eq!(raw.offset_of(0), Some(Duration::ZERO));
        assert_eq!(raw.offset_of(2), None);
    }

    #[test]
    fn same_instant_from_both_message_kinds_keeps_one_record() {
        let mut state = QueuePanelState::new("q1");
        let mut single = record("q1", "Ana", 10);
        single.key = CallKey::entry("42");
        single.ticket = Some("A01".into());
        state.push_single(single);

        // The snapshot re-sends the same call keyed by its origin instant
        state.merge_snapshot(None, vec![record("q1", "Ana", 10), record("q1", "Bia", 5)]);
        assert_eq!(state.len(), 2);
        assert!(state.is_sorted_desc());
        assert_eq!(state.records[0].key, CallKey::entry("42"));
        assert!(state.records[0].is_new);

        // A current call at that instant wins the tie
        state.merge_snapshot(Some(record("q1", "Ana", 10)), vec![]);
        assert_eq!(state.len(), 2);
        assert!(state.is_sorted_desc());
        assert_eq!(state.records[0].key, record("q1", "Ana", 10).key);
        assert_eq!(state.new_count(), 1);
    }

    #[test]
    fn template_substitution() {
        let mut r = record("q1", "Ana", 0);
        r.ticket = Some("A12".into());
        assert_eq!(
            render_announcement("Senha {senha}, {nome}, {local}", &r),
            "Senha A12, Ana, Sala 1"
        );

        r.location = String::new();
        assert_eq!(render_announcement("{nome}, {local}", &r), "Ana");
    }
}
