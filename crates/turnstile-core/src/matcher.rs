//! Nearest-neighbour identity resolution over an immutable registry snapshot.

use crate::error::AccessError;
use crate::types::Embedding;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Distance below which a nearest candidate is accepted.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// One matchable identity in a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub student_id: String,
    pub display_name: String,
    pub internal_id: i64,
    pub embedding: Embedding,
}

/// Immutable view of the registry, keyed by student id.
///
/// Rebuilt wholesale on every reload; iteration order is the key order,
/// which makes tie-breaking deterministic.
#[derive(Debug, Clone)]
pub struct Snapshot {
    dim: usize,
    entries: BTreeMap<String, SnapshotEntry>,
}

impl Snapshot {
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries(dim: usize, entries: impl IntoIterator<Item = SnapshotEntry>) -> Self {
        Self {
            dim,
            entries: entries
                .into_iter()
                .map(|e| (e.student_id.clone(), e))
                .collect(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, student_id: &str) -> Option<&SnapshotEntry> {
        self.entries.get(student_id)
    }

    pub fn contains_internal_id(&self, internal_id: i64) -> bool {
        self.entries.values().any(|e| e.internal_id == internal_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }
}

/// Nearest enrolled identity for a probe, with its distance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub student_id: String,
    pub display_name: String,
    pub internal_id: i64,
    pub distance: f32,
}

/// Outcome of applying the acceptance threshold to a nearest candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", content = "candidate")]
pub enum Verdict {
    Recognized(Candidate),
    /// Above threshold (nearest kept for diagnostics) or empty registry.
    Unknown(Option<Candidate>),
}

/// Threshold policy layered on top of the matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptancePolicy {
    pub threshold: f32,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl AcceptancePolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// `distance < threshold` is recognized; equality is not.
    pub fn classify(&self, candidate: Option<Candidate>) -> Verdict {
        match candidate {
            Some(c) if c.distance < self.threshold => Verdict::Recognized(c),
            other => Verdict::Unknown(other),
        }
    }
}

/// Holds the current snapshot and answers nearest-neighbour queries.
pub struct Matcher {
    snapshot: Arc<Snapshot>,
}

impl Matcher {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }

    /// Shared handle to the snapshot currently in use.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Replace the snapshot in one step. Handles taken earlier keep the old one.
    pub fn reload(&mut self, snapshot: Snapshot) {
        tracing::debug!(
            previous = self.snapshot.len(),
            current = snapshot.len(),
            "matcher snapshot swapped"
        );
        self.snapshot = Arc::new(snapshot);
    }

    /// Find the enrolled identity closest to `probe`.
    ///
    /// Returns `None` only when the snapshot is empty. The first entry with
    /// the minimum distance wins. Every entry is visited.
    pub fn nearest(&self, probe: &Embedding) -> Result<Option<Candidate>, AccessError> {
        if probe.dim() != self.snapshot.dim() {
            return Err(AccessError::dimension_mismatch(
                self.snapshot.dim(),
                probe.dim(),
            ));
        }
        if probe.values.iter().any(|v| !v.is_finite()) {
            return Err(AccessError::InvalidInput(
                "embedding contains non-finite values".into(),
            ));
        }

        let mut best: Option<(&SnapshotEntry, f32)> = None;
        for entry in self.snapshot.iter() {
            let distance = probe.euclidean_distance(&entry.embedding)?;
            let closer = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((entry, distance));
            }
        }

        Ok(best.map(|(entry, distance)| Candidate {
            student_id: entry.student_id.clone(),
            display_name: entry.display_name.clone(),
            internal_id: entry.internal_id,
            distance,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(student_id: &str, internal_id: i64, values: Vec<f32>) -> SnapshotEntry {
        SnapshotEntry {
            student_id: student_id.into(),
            display_name: format!("Name {student_id}"),
            internal_id,
            embedding: Embedding::new(values),
        }
    }

    fn matcher(entries: Vec<SnapshotEntry>) -> Matcher {
        Matcher::new(Snapshot::from_entries(3, entries))
    }

    #[test]
    fn test_nearest_empty_snapshot() {
        let m = Matcher::new(Snapshot::empty(3));
        assert_eq!(m.nearest(&Embedding::new(vec![0.0; 3])).unwrap(), None);
    }

    #[test]
    fn test_nearest_picks_minimum_distance() {
        let m = matcher(vec![
            entry("A", 1, vec![1.0, 0.0, 0.0]),
            entry("B", 2, vec![0.0, 1.0, 0.0]),
            entry("C", 3, vec![0.0, 0.0, 0.2]),
        ]);
        let c = m.nearest(&Embedding::new(vec![0.0, 0.0, 0.0])).unwrap().unwrap();
        assert_eq!(c.student_id, "C");
        assert_eq!(c.internal_id, 3);
        assert!((c.distance - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_visits_all_entries() {
        // Best match sorts last.
        let m = matcher(vec![
            entry("A", 1, vec![5.0, 5.0, 5.0]),
            entry("B", 2, vec![4.0, 4.0, 4.0]),
            entry("Z", 3, vec![0.1, 0.0, 0.0]),
        ]);
        let c = m.nearest(&Embedding::new(vec![0.0; 3])).unwrap().unwrap();
        assert_eq!(c.student_id, "Z");
    }

    #[test]
    fn test_nearest_returns_candidate_above_threshold() {
        let m = matcher(vec![entry("A", 1, vec![3.0, 4.0, 0.0])]);
        let c = m.nearest(&Embedding::new(vec![0.0; 3])).unwrap().unwrap();
        assert!((c.distance - 5.0).abs() < 1e-6);
        assert!(matches!(
            AcceptancePolicy::default().classify(Some(c)),
            Verdict::Unknown(Some(_))
        ));
    }

    #[test]
    fn test_nearest_tie_is_deterministic() {
        let m = matcher(vec![
            entry("B", 2, vec![0.0, 1.0, 0.0]),
            entry("A", 1, vec![1.0, 0.0, 0.0]),
        ]);
        let probe = Embedding::new(vec![0.0; 3]);
        let first = m.nearest(&probe).unwrap().unwrap();
        for _ in 0..10 {
            assert_eq!(m.nearest(&probe).unwrap().unwrap(), first);
        }
        assert_eq!(first.student_id, "A");
    }

    #[test]
    fn test_nearest_rejects_dimension_mismatch() {
        let m = matcher(vec![entry("A", 1, vec![0.0; 3])]);
        let err = m.nearest(&Embedding::new(vec![0.0; 4])).unwrap_err();
        assert!(matches!(err, AccessError::InvalidInput(_)));
    }

    #[test]
    fn test_nearest_rejects_nan() {
        let m = matcher(vec![entry("A", 1, vec![0.0; 3])]);
        let err = m
            .nearest(&Embedding::new(vec![f32::NAN, 0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidInput(_)));
    }

    #[test]
    fn test_classify_threshold_is_exclusive() {
        let policy = AcceptancePolicy::new(0.5);
        let at = Candidate {
            student_id: "A".into(),
            display_name: "A".into(),
            internal_id: 1,
            distance: 0.5,
        };
        let below = Candidate { distance: 0.49, ..at.clone() };

        assert!(matches!(policy.classify(Some(at)), Verdict::Unknown(Some(_))));
        assert!(matches!(policy.classify(Some(below)), Verdict::Recognized(_)));
        assert_eq!(policy.classify(None), Verdict::Unknown(None));
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let mut m = Matcher::new(Snapshot::empty(3));
        let old = m.snapshot();
        m.reload(Snapshot::from_entries(3, vec![entry("A", 1, vec![0.0; 3])]));

        assert!(old.is_empty());
        assert_eq!(m.snapshot().len(), 1);
        assert!(m.snapshot().contains_internal_id(1));
    }

    /// Small xorshift generator so the randomized test needs no extra crate.
    struct XorShift(u64);

    impl XorShift {
        fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next_u64() % n
        }

        /// Uniform in [-1, 1).
        fn unit(&mut self) -> f32 {
            (self.next_u64() >> 40) as f32 / (1u64 << 23) as f32 - 1.0
        }

        fn vector(&mut self, dim: usize) -> Vec<f32> {
            (0..dim).map(|_| self.unit()).collect()
        }
    }

    #[test]
    fn test_nearest_agrees_with_brute_force_minimum() {
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        for _ in 0..500 {
            let dim = 1 + rng.below(8) as usize;
            let count = rng.below(20) as usize;
            let entries: Vec<SnapshotEntry> = (0..count)
                .map(|i| entry(&format!("S{i:03}"), i as i64 + 1, rng.vector(dim)))
                .collect();
            let probe = Embedding::new(rng.vector(dim));
            let m = Matcher::new(Snapshot::from_entries(dim, entries.clone()));

            let found = m.nearest(&probe).unwrap();
            if entries.is_empty() {
                assert_eq!(found, None);
                continue;
            }
            let c = found.expect("non-empty snapshot yields a candidate");

            let minimum = entries
                .iter()
                .map(|e| probe.euclidean_distance(&e.embedding).unwrap())
                .fold(f32::INFINITY, f32::min);
            assert_eq!(c.distance, minimum);

            let chosen = entries
                .iter()
                .find(|e| e.internal_id == c.internal_id)
                .unwrap();
            assert_eq!(chosen.student_id, c.student_id);
            assert_eq!(probe.euclidean_distance(&chosen.embedding).unwrap(), c.distance);
        }
    }
}
