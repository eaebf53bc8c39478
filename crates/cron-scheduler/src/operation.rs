//! Deferred mutations of the entry table.
//!
//! The loop task owns the [`EntryTable`]; everything else reaches it by
//! submitting an [`Operation`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::entry::{by_next, Entry};

/// A mutation or query applied by the loop, in submission order.
#[derive(Debug)]
pub enum Operation {
    /// Add an entry, replacing any entry with the same name
    Insert(Entry),
    /// Remove the named entry, if present
    Remove(String),
    /// Reply with a copy of all entries ordered by next fire time
    Snapshot(oneshot::Sender<Vec<Entry>>),
}

/// Entries keyed by job name plus their fire order.
#[derive(Debug, Default)]
pub(crate) struct EntryTable {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

impl EntryTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Apply one operation. Inserted entries are ticked against `now`.
    pub(crate) fn apply(&mut self, op: Operation, now: DateTime<Utc>) {
        match op {
            Operation::Insert(mut entry) => {
                entry.tick(now);
                self.entries.insert(entry.name().to_string(), entry);
            }
            Operation::Remove(name) => {
                self.entries.remove(&name);
            }
            Operation::Snapshot(reply) => {
                // Requester may have given up waiting.
                let _ = reply.send(self.snapshot());
                return;
            }
        }
        self.reorder();
    }

    fn reorder(&mut self) {
        let mut sorted: Vec<&Entry> = self.entries.values().collect();
        sorted.sort_by(|a, b| by_next(a, b));
        self.order = sorted.into_iter().map(|e| e.name().to_string()).collect();
    }

    /// Copy of every entry, ordered by next fire time.
    pub(crate) fn snapshot(&self) -> Vec<Entry> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .cloned()
            .collect()
    }

    /// Earliest scheduled fire time.
    pub(crate) fn earliest(&self) -> Option<DateTime<Utc>> {
        self.order
            .first()
            .and_then(|name| self.entries.get(name))
            .and_then(Entry::next)
    }

    /// Tick every entry due at `effective` and return copies of them.
    ///
    /// Due entries form a prefix of the fire order, so the walk stops at
    /// the first entry with a different next time.
    pub(crate) fn advance_due(&mut self, effective: DateTime<Utc>) -> Vec<Entry> {
        let mut due = Vec::new();
        for name in &self.order {
            let Some(entry) = self.entries.get_mut(name) else {
                continue;
            };
            if entry.next() != Some(effective) {
                break;
            }
            entry.tick(effective);
            due.push(entry.clone());
        }
        self.reorder();
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cron_types::Job;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn insert(name: &str, rhythm: &str) -> Operation {
        let job = Job::new(name, rhythm);
        let schedule = cron_rhythm::parse(rhythm).unwrap().schedule;
        Operation::Insert(Entry::new(job, schedule, "t/", None))
    }

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(Entry::name).collect()
    }

    #[test]
    fn test_insert_ticks_and_orders() {
        let mut table = EntryTable::default();
        table.apply(insert("slow", "@every 10s"), at(0));
        table.apply(insert("fast", "@every 3s"), at(0));

        assert_eq!(table.earliest(), Some(at(3)));
        assert_eq!(names(&table.snapshot()), vec!["fast", "slow"]);
    }

    #[test]
    fn test_insert_replaces_same_name() {
        let mut table = EntryTable::default();
        table.apply(insert("a", "@every 10s"), at(0));
        table.apply(insert("a", "@every 2s"), at(0));
        assert_eq!(table.len(), 1);
        assert_eq!(table.earliest(), Some(at(2)));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut table = EntryTable::default();
        table.apply(insert("a", "@every 1s"), at(0));
        table.apply(Operation::Remove("ghost".to_string()), at(0));
        table.apply(Operation::Remove("a".to_string()), at(0));
        table.apply(Operation::Remove("a".to_string()), at(0));
        assert_eq!(table.len(), 0);
        assert_eq!(table.earliest(), None);
    }

    #[test]
    fn test_snapshot_operation_replies() {
        let mut table = EntryTable::default();
        table.apply(insert("a", "@every 1s"), at(0));
        let (tx, mut rx) = oneshot::channel();
        table.apply(Operation::Snapshot(tx), at(0));
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(names(&snapshot), vec!["a"]);
    }

    #[test]
    fn test_advance_due_fires_only_the_due_prefix() {
        let mut table = EntryTable::default();
        table.apply(insert("two-a", "@every 2s"), at(0));
        table.apply(insert("two-b", "@every 2s"), at(0));
        table.apply(insert("five", "@every 5s"), at(0));

        let mut fired = names(&table.advance_due(at(2)))
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        fired.sort();
        assert_eq!(fired, vec!["two-a", "two-b"]);
        assert_eq!(table.earliest(), Some(at(4)));

        let fired = table.advance_due(at(4));
        assert_eq!(fired.len(), 2);
        assert!(fired.iter().all(|e| e.prev() == Some(at(4)) && e.next() == Some(at(6))));

        let fired = table.advance_due(at(5));
        assert_eq!(names(&fired), vec!["five"]);
    }
}
