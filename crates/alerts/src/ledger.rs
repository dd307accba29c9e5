use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shoptrack_core::{AlertId, ItemId};

use crate::record::{AlertCandidate, AlertKind, AlertRecord, AlertStatus, DedupKey, Resolution, UpsertOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub kind: Option<AlertKind>,
    pub item_id: Option<ItemId>,
}

impl AlertFilter {
    pub fn matches(&self, record: &AlertRecord) -> bool {
        self.status.is_none_or(|s| record.status() == s)
            && self.kind.is_none_or(|k| record.kind == k)
            && self.item_id.as_ref().is_none_or(|i| &record.item_id == i)
    }
}

/// Counts reported by `GET /alerts/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
}

impl AlertStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a AlertRecord>) -> Self {
        let mut stats = AlertStats::default();
        for r in records {
            stats.total += 1;
            *stats.by_status.entry(r.status().as_str().to_string()).or_default() += 1;
            *stats.by_kind.entry(r.kind.as_str().to_string()).or_default() += 1;
            *stats.by_severity.entry(r.severity.as_str().to_string()).or_default() += 1;
        }
        stats
    }
}

/// In-memory alert table with the dedup rule applied on every write.
///
/// Invariant: for each dedup key, at most one record is open
/// (not acknowledged, resolved, dismissed or expired); `open` indexes exactly those.
#[derive(Debug, Clone)]
pub struct AlertLedger {
    ttl: chrono::Duration,
    records: BTreeMap<AlertId, AlertRecord>,
    open: HashMap<DedupKey, AlertId>,
}

impl AlertLedger {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            ttl,
            records: BTreeMap::new(),
            open: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn upsert(&mut self, candidate: AlertCandidate) -> UpsertOutcome {
        if let Some(id) = self.open.get(&candidate.dedup_key).copied() {
            if let Some(existing) = self.records.get_mut(&id) {
                if existing.expires_at > candidate.observed_at {
                    let from = existing.absorb(candidate, self.ttl);
                    let record = existing.clone();
                    return match from {
                        Some(from) => UpsertOutcome::Escalated { record, from },
                        None => UpsertOutcome::Updated(record),
                    };
                }
                // Lapsed but not yet swept by cleanup: retire it now.
                existing.expired = true;
            }
            self.open.remove(&candidate.dedup_key);
        }

        let record = AlertRecord::open(candidate, self.ttl);
        self.open.insert(record.dedup_key.clone(), record.id);
        self.records.insert(record.id, record.clone());
        UpsertOutcome::Created(record)
    }

    /// Acknowledge an alert. Acknowledging twice keeps the first acknowledgement.
    pub fn acknowledge(
        &mut self,
        id: AlertId,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<AlertRecord> {
        let record = self.records.get_mut(&id)?;
        if !record.acknowledged {
            record.acknowledged = true;
            record.acknowledged_at = Some(at);
            record.acknowledged_by = by;
            if self.open.get(&record.dedup_key) == Some(&id) {
                self.open.remove(&record.dedup_key);
            }
        }
        Some(record.clone())
    }

    /// Resolve or dismiss an alert. The first closure is kept.
    pub fn close(
        &mut self,
        id: AlertId,
        resolution: Resolution,
        by: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<AlertRecord> {
        let record = self.records.get_mut(&id)?;
        if record.resolution.is_none() {
            record.resolution = Some(resolution);
            record.resolved_at = Some(at);
            record.resolved_by = by;
            if self.open.get(&record.dedup_key) == Some(&id) {
                self.open.remove(&record.dedup_key);
            }
        }
        Some(record.clone())
    }

    /// Mark every open alert whose `expires_at` has passed. Returns how many changed.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<(DedupKey, AlertId)> = self
            .open
            .iter()
            .filter(|(_, id)| self.records.get(id).is_some_and(|r| r.expires_at <= now))
            .map(|(k, id)| (k.clone(), *id))
            .collect();
        for (key, id) in &due {
            if let Some(r) = self.records.get_mut(id) {
                r.expired = true;
            }
            self.open.remove(key);
        }
        due.len()
    }

    pub fn get(&self, id: AlertId) -> Option<&AlertRecord> {
        self.records.get(&id)
    }

    /// Newest first.
    pub fn list(&self, filter: &AlertFilter) -> Vec<AlertRecord> {
        let mut out: Vec<AlertRecord> = self
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn open_for(&self, key: &DedupKey) -> Option<&AlertRecord> {
        self.open.get(key).and_then(|id| self.records.get(id))
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats::from_records(self.records.values())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Severity, TimeBucket};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(h)
    }

    fn cand(item: &str, sev: Severity, at: DateTime<Utc>) -> AlertCandidate {
        AlertCandidate {
            dedup_key: DedupKey::new(ItemId::new(item), AlertKind::LowStock, TimeBucket(0)),
            severity: sev,
            observed_at: at,
            message: format!("{item} low"),
            score: None,
            stock: Some(3),
        }
    }

    #[test]
    fn repeat_trigger_updates_instead_of_inserting() {
        let mut ledger = AlertLedger::new(chrono::Duration::hours(24));
        assert!(matches!(ledger.upsert(cand("y", Severity::Medium, t(0))), UpsertOutcome::Created(_)));
        assert!(matches!(ledger.upsert(cand("y", Severity::Medium, t(1))), UpsertOutcome::Updated(_)));
        assert!(matches!(
            ledger.upsert(cand("y", Severity::High, t(2))),
            UpsertOutcome::Escalated { from: Severity::Medium, .. }
        ));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.list(&AlertFilter::default())[0].triggered_at, t(2));
    }

    #[test]
    fn acknowledged_alert_recurs_as_new_record() {
        let mut ledger = AlertLedger::new(chrono::Duration::hours(24));
        let first = ledger.upsert(cand("y", Severity::Medium, t(0))).record().id;
        ledger.acknowledge(first, Some("ops".into()), t(1)).unwrap();

        let second = ledger.upsert(cand("y", Severity::Medium, t(2)));
        assert!(matches!(second, UpsertOutcome::Created(_)));
        assert_ne!(second.record().id, first);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn expiry_releases_the_dedup_key() {
        let mut ledger = AlertLedger::new(chrono::Duration::hours(2));
        ledger.upsert(cand("y", Severity::Medium, t(0)));
        assert_eq!(ledger.expire_due(t(1)), 0);
        assert_eq!(ledger.expire_due(t(2)), 1);

        let stats = ledger.stats();
        assert_eq!(stats.by_status.get("EXPIRED"), Some(&1));
        assert!(matches!(ledger.upsert(cand("y", Severity::Medium, t(3))), UpsertOutcome::Created(_)));
    }

    #[test]
    fn lapsed_record_is_retired_on_upsert_without_cleanup() {
        let mut ledger = AlertLedger::new(chrono::Duration::hours(2));
        ledger.upsert(cand("y", Severity::Medium, t(0)));
        assert!(matches!(ledger.upsert(cand("y", Severity::Medium, t(5))), UpsertOutcome::Created(_)));
        let active = ledger.list(&AlertFilter {
            status: Some(AlertStatus::Active),
            ..AlertFilter::default()
        });
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn closed_alert_keeps_its_first_resolution() {
        let mut ledger = AlertLedger::new(chrono::Duration::hours(24));
        let id = ledger.upsert(cand("y", Severity::High, t(0))).record().id;
        ledger.acknowledge(id, Some("ops".into()), t(1)).unwrap();

        let resolved = ledger.close(id, Resolution::Resolved, Some("lead".into()), t(2)).unwrap();
        assert_eq!(resolved.status(), AlertStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("lead"));

        let again = ledger.close(id, Resolution::Dismissed, None, t(3)).unwrap();
        assert_eq!(again.status(), AlertStatus::Resolved);
        assert_eq!(again.resolved_at, Some(t(2)));
        assert!(ledger.close(AlertId::new(), Resolution::Resolved, None, t(3)).is_none());
    }

    #[test]
    fn dismissed_alert_frees_the_key_and_is_never_expired() {
        let mut ledger = AlertLedger::new(chrono::Duration::hours(2));
        let first = ledger.upsert(cand("y", Severity::Medium, t(0))).record().id;
        ledger.close(first, Resolution::Dismissed, None, t(1)).unwrap();

        assert_eq!(ledger.expire_due(t(5)), 0);
        assert_eq!(ledger.get(first).unwrap().status(), AlertStatus::Dismissed);
        assert!(matches!(ledger.upsert(cand("y", Severity::Medium, t(1))), UpsertOutcome::Created(_)));
        assert_eq!(ledger.stats().by_status.get("DISMISSED"), Some(&1));
    }

    proptest! {
        #[test]
        fn never_two_open_records_per_key(
            ops in proptest::collection::vec((0u8..3, 0u8..4, 0i64..6, any::<bool>()), 1..60)
        ) {
            let mut ledger = AlertLedger::new(chrono::Duration::hours(48));
            let items = ["a", "b", "c"];
            let sevs = [Severity::Low, Severity::Medium, Severity::High, Severity::Critical];
            for (step, (item, sev, hour, ack)) in ops.into_iter().enumerate() {
                let out = ledger.upsert(cand(items[item as usize], sevs[sev as usize], t(hour)));
                if ack {
                    ledger.acknowledge(out.record().id, None, t(step as i64));
                }
            }
            let mut open: HashMap<DedupKey, usize> = HashMap::new();
            for r in ledger.list(&AlertFilter::default()) {
                if r.is_open() {
                    *open.entry(r.dedup_key.clone()).or_default() += 1;
                }
            }
            prop_assert!(open.values().all(|n| *n == 1));
        }
    }
}
