//! Append-only access event log.

use crate::error::AccessError;
use crate::store::EventStore;
use crate::types::{AccessEvent, Action, NewAccessEvent};
use chrono::{DateTime, Duration, SubsecRound, Utc};

type Clock = Box<dyn FnMut() -> DateTime<Utc> + Send>;

/// Records entry/exit events with server-assigned, strictly increasing timestamps.
///
/// There is no update or delete path.
pub struct AccessEventLog<E> {
    store: E,
    clock: Clock,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<E: EventStore> AccessEventLog<E> {
    pub fn new(store: E) -> Self {
        Self::with_clock(store, Box::new(Utc::now))
    }

    /// Use a custom time source instead of the system clock.
    pub fn with_clock(store: E, clock: Clock) -> Self {
        Self {
            store,
            clock,
            last_timestamp: None,
        }
    }

    /// Append one event stamped with the current time.
    ///
    /// If the clock has not advanced past the previous event (or went
    /// backwards) the new timestamp is bumped one microsecond past it, so
    /// timestamp order always equals write order.
    pub fn record(
        &mut self,
        identity_id: Option<i64>,
        student_id: &str,
        display_name: &str,
        action: Action,
        location: &str,
    ) -> Result<AccessEvent, AccessError> {
        if student_id.trim().is_empty() {
            return Err(AccessError::InvalidInput("student_id must not be empty".into()));
        }
        if location.trim().is_empty() {
            return Err(AccessError::InvalidInput("location must not be empty".into()));
        }

        let timestamp = self.next_timestamp()?;
        let event = self.store.append(NewAccessEvent {
            identity_id,
            student_id: student_id.to_string(),
            display_name: display_name.to_string(),
            action,
            location: location.to_string(),
            timestamp,
        })?;
        self.last_timestamp = Some(timestamp);

        tracing::info!(
            event_id = event.id,
            student_id = %event.student_id,
            action = %event.action,
            location = %event.location,
            "access event recorded"
        );
        Ok(event)
    }

    /// Up to `limit` events, most recent first. `limit` must be positive.
    pub fn recent(&self, limit: usize) -> Result<Vec<AccessEvent>, AccessError> {
        if limit == 0 {
            return Err(AccessError::InvalidInput("limit must be positive".into()));
        }
        Ok(self.store.read_recent(limit)?)
    }

    fn next_timestamp(&mut self) -> Result<DateTime<Utc>, AccessError> {
        if self.last_timestamp.is_none() {
            // Continue after whatever an earlier process already wrote.
            self.last_timestamp = self.store.read_recent(1)?.first().map(|e| e.timestamp);
        }

        // Stores keep microsecond precision.
        let now = (self.clock)().trunc_subsecs(6);
        Ok(match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn fixed_clock(times: Vec<DateTime<Utc>>) -> Clock {
        let mut iter = times.into_iter();
        Box::new(move || iter.next().expect("clock exhausted"))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_recent_returns_newest_first_truncated() {
        let store = MemoryStore::new();
        let mut log = AccessEventLog::with_clock(store, fixed_clock(vec![at(1), at(2), at(3)]));

        log.record(Some(1), "S1", "Ada Lovelace", Action::Entry, "Main Entrance").unwrap();
        log.record(Some(2), "S2", "Alan Turing", Action::Entry, "Main Entrance").unwrap();
        log.record(Some(1), "S1", "Ada Lovelace", Action::Exit, "Main Entrance").unwrap();

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, at(3));
        assert_eq!(recent[0].action, Action::Exit);
        assert_eq!(recent[1].timestamp, at(2));
        assert_eq!(recent[1].student_id, "S2");
    }

    #[test]
    fn test_recent_shorter_log() {
        let mut log = AccessEventLog::new(MemoryStore::new());
        log.record(None, "S1", "Ada", Action::Entry, "Lab").unwrap();
        assert_eq!(log.recent(50).unwrap().len(), 1);
    }

    #[test]
    fn test_recent_rejects_zero_limit() {
        let log = AccessEventLog::new(MemoryStore::new());
        assert!(matches!(log.recent(0), Err(AccessError::InvalidInput(_))));
    }

    #[test]
    fn test_timestamps_strictly_increase_when_clock_stalls_or_rewinds() {
        let store = MemoryStore::new();
        let mut log = AccessEventLog::with_clock(
            store,
            fixed_clock(vec![at(10), at(10), at(5), at(11)]),
        );

        let stamps: Vec<_> = (0..4)
            .map(|_| {
                log.record(Some(1), "S1", "Ada", Action::Entry, "Gate")
                    .unwrap()
                    .timestamp
            })
            .collect();

        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }

        let recent = log.recent(10).unwrap();
        let ids: Vec<_> = recent.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_timestamps_continue_after_existing_events() {
        let store = MemoryStore::new();
        let mut first = AccessEventLog::with_clock(store.clone(), fixed_clock(vec![at(100)]));
        first.record(None, "S1", "Ada", Action::Entry, "Gate").unwrap();

        let mut second = AccessEventLog::with_clock(store, fixed_clock(vec![at(50)]));
        let event = second.record(None, "S1", "Ada", Action::Exit, "Gate").unwrap();
        assert!(event.timestamp > at(100));
    }

    #[test]
    fn test_record_rejects_blank_student_id() {
        let store = MemoryStore::new();
        let mut log = AccessEventLog::new(store.clone());
        let err = log.record(None, " ", "Ada", Action::Entry, "Gate").unwrap_err();
        assert!(matches!(err, AccessError::InvalidInput(_)));
        assert_eq!(store.event_count(), 0);
    }

    #[test]
    fn test_record_storage_unavailable() {
        let store = MemoryStore::new();
        let mut log = AccessEventLog::new(store.clone());
        store.set_unavailable(true);
        let err = log.record(Some(1), "S1", "Ada", Action::Entry, "Gate").unwrap_err();
        assert!(matches!(err, AccessError::StorageUnavailable(_)));

        store.set_unavailable(false);
        assert!(log.record(Some(1), "S1", "Ada", Action::Entry, "Gate").is_ok());
    }
}
