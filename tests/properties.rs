use std::collections::BTreeSet;
use std::sync::Arc;

use trackproof::{
    classify, materialize, resolve, ArrayLike, Correction, CorrectionKind, CorrectionLog, LineageGraph,
    LineageStore, Position, TrackId, TrackTable, Vertex, Volume,
};

/// Small deterministic generator so every run sees the same inputs.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> i64 {
        i64::try_from(self.next() % n).unwrap()
    }
}

const FRAMES: i64 = 12;

fn coords(track: i64, t: i64) -> Position {
    Position::new(t, 0.0, (track * 10 + t) as f64, track as f64)
}

/// Six tracks of random extent; track 2 and 3 are children of track 1.
fn random_store(rng: &mut Lcg) -> LineageStore {
    let mut rows = Vec::new();
    for track in 1..=6 {
        let start = rng.below(4);
        let len = 1 + rng.below(6);
        for t in start..(start + len).min(FRAMES) {
            rows.push(Vertex::at(TrackId(track), coords(track, t)));
        }
    }
    let image: Arc<dyn ArrayLike> = Arc::new(Volume::<u8>::zeros(vec![FRAMES as usize, 1, 2, 2]));
    let graph = LineageGraph::from_pairs([(TrackId(2), [TrackId(1)]), (TrackId(3), [TrackId(1)])]);
    LineageStore::load(TrackTable::from_vertices(rows), image, None, Some(graph)).unwrap()
}

fn random_correction(rng: &mut Lcg, store: &LineageStore) -> Correction {
    let track = TrackId(1 + rng.below(6));
    let other = TrackId(1 + rng.below(6));
    match rng.below(5) {
        0 => {
            let t = rng.below(FRAMES as u64);
            Correction::NewVertex {
                track,
                position: coords(track.0 + rng.below(2), t),
            }
        }
        1 => {
            let t = store
                .track(track)
                .and_then(|vs| vs.get(usize::try_from(rng.below(6)).unwrap() % vs.len()))
                .map_or(0, |v| v.t);
            Correction::LostVertex {
                track,
                position: coords(track.0, t),
            }
        }
        2 => Correction::NewParent { child: track, parent: other },
        3 => Correction::LostParent { child: track, parent: other },
        _ => Correction::Join {
            first: track,
            second: other,
            adjacent: rng.below(2) == 0,
        },
    }
}

fn random_log(rng: &mut Lcg, store: &LineageStore, proposals: usize) -> CorrectionLog {
    let mut log = CorrectionLog::new();
    for _ in 0..proposals {
        log.propose_correction(random_correction(rng, store)).unwrap();
    }
    log
}

#[test]
fn materializing_twice_is_byte_identical() {
    let mut rng = Lcg(7);
    for _ in 0..20 {
        let store = random_store(&mut rng);
        let mut log = random_log(&mut rng, &store, 12);
        resolve(&store, &mut log).unwrap();
        resolve(&store, &mut log).unwrap();

        let snapshot = log.snapshot();
        let a = materialize(&store, &snapshot).working.to_table().to_bytes();
        let b = materialize(&store, &snapshot).working.to_table().to_bytes();
        assert_eq!(a, b);
    }
}

#[test]
fn proposal_order_does_not_change_the_result() {
    let mut rng = Lcg(11);
    for _ in 0..20 {
        let store = random_store(&mut rng);

        // One correction per slot keeps the set conflict-free, so both orders
        // implement the same entries.
        let mut seen = BTreeSet::new();
        let corrections: Vec<Correction> = (0..10)
            .map(|_| random_correction(&mut rng, &store))
            .filter(|c| matches!(c, Correction::NewVertex { .. } | Correction::LostVertex { .. }))
            .filter(|c| seen.insert(c.slot()))
            .collect();

        let mut forward = CorrectionLog::new();
        for c in &corrections {
            forward.propose_correction(*c).unwrap();
        }
        let mut backward = CorrectionLog::new();
        for c in corrections.iter().rev() {
            backward.propose_correction(*c).unwrap();
        }

        resolve(&store, &mut forward).unwrap();
        resolve(&store, &mut backward).unwrap();

        assert_eq!(forward.fingerprint(), backward.fingerprint());
        let a = materialize(&store, &forward.snapshot()).working;
        let b = materialize(&store, &backward.snapshot()).working;
        assert_eq!(a.to_table().to_bytes(), b.to_table().to_bytes());
        assert_eq!(a, b);
    }
}

#[test]
fn vertex_counts_are_conserved() {
    let mut rng = Lcg(23);
    for _ in 0..20 {
        let store = random_store(&mut rng);
        let mut log = CorrectionLog::new();
        for _ in 0..12 {
            let c = random_correction(&mut rng, &store);
            if matches!(c, Correction::NewVertex { .. } | Correction::LostVertex { .. }) {
                log.propose_correction(c).unwrap();
            }
        }
        resolve(&store, &mut log).unwrap();
        resolve(&store, &mut log).unwrap();

        let snapshot = log.snapshot();
        let m = materialize(&store, &snapshot);
        assert!(m.skipped.is_empty());
        let expected = store.vertex_count() + snapshot.count(CorrectionKind::NewVertex)
            - snapshot.count(CorrectionKind::LostVertex);
        assert_eq!(m.working.vertex_count(), expected);
    }
}

#[test]
fn no_proposal_is_ever_lost() {
    let mut rng = Lcg(31);
    for _ in 0..20 {
        let store = random_store(&mut rng);
        let mut log = random_log(&mut rng, &store, 15);
        let total = log.len();

        let report = resolve(&store, &mut log).unwrap();
        assert_eq!(report.implemented.len() + report.unresolved.len(), total);

        let proposed: BTreeSet<_> = log.proposed().map(|e| e.id).collect();
        let implemented: BTreeSet<_> = log.implemented().map(|e| e.id).collect();
        assert!(proposed.is_disjoint(&implemented));
        assert_eq!(proposed.len() + implemented.len(), total);
        for u in &report.unresolved {
            assert!(proposed.contains(&u.id));
        }

        // Implemented entries always materialize cleanly.
        assert!(materialize(&store, &log.snapshot()).skipped.is_empty());
    }
}

#[test]
fn every_vertex_gets_exactly_one_label() {
    let mut rng = Lcg(43);
    for _ in 0..20 {
        let store = random_store(&mut rng);
        let mut log = random_log(&mut rng, &store, 15);
        resolve(&store, &mut log).unwrap();
        resolve(&store, &mut log).unwrap();

        let working = materialize(&store, &log.snapshot()).working;
        let classification = classify(&store, &working, true);
        assert_eq!(classification.tally.total(), working.vertex_count());
        assert_eq!(
            classification.labels.as_ref().map(|l| l.len()),
            Some(working.vertex_count())
        );
    }
}
