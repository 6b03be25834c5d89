use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use trackproof::{
    classify, materialize, plan, resolve, ArrayLike, Correction, CorrectionLog, LineageGraph, LineageStore,
    Position, TrackId, TrackTable, Vertex, Volume,
};

const TRACKS: i64 = 200;
const FRAMES: i64 = 50;

fn coords(track: i64, t: i64) -> Position {
    Position::new(t, 0.0, (track % 64) as f64, (track / 64) as f64)
}

/// 200 tracks of 20 frames each; every odd track is the child of the track before it.
fn make_store() -> LineageStore {
    let rows = (0..TRACKS).flat_map(|track| {
        let start = (track % 2) * 20;
        (start..start + 20).map(move |t| Vertex::at(TrackId(track), coords(track, t)))
    });
    let graph = LineageGraph::from_pairs(
        (1..TRACKS)
            .step_by(2)
            .map(|child| (TrackId(child), [TrackId(child - 1)])),
    );
    let image: Arc<dyn ArrayLike> = Arc::new(Volume::<u8>::zeros(vec![FRAMES as usize, 1, 64, 4]));
    LineageStore::load(TrackTable::from_vertices(rows), image, None, Some(graph)).unwrap()
}

/// A mixed review pass: trims, extensions, relinks and joins.
fn make_log() -> CorrectionLog {
    let mut log = CorrectionLog::new();
    for track in (0..TRACKS).step_by(4) {
        log.propose_correction(Correction::LostVertex {
            track: TrackId(track),
            position: coords(track, 19),
        })
        .unwrap();
        log.propose_correction(Correction::NewVertex {
            track: TrackId(track + 1),
            position: coords(track + 1, 40),
        })
        .unwrap();
        log.propose_correction(Correction::LostParent {
            child: TrackId(track + 3),
            parent: TrackId(track + 2),
        })
        .unwrap();
        log.propose_correction(Correction::Join {
            first: TrackId(track + 2),
            second: TrackId(track + 3),
            adjacent: false,
        })
        .unwrap();
    }
    log
}

fn bench_plan(c: &mut Criterion) {
    let store = make_store();
    let log = make_log();
    let mut group = c.benchmark_group("reconcile");
    group.throughput(Throughput::Elements(log.len() as u64));
    group.bench_function("plan", |b| b.iter(|| plan(&store, &log)));
    group.finish();
}

fn bench_resolve_materialize_classify(c: &mut Criterion) {
    let store = make_store();
    c.bench_function("reconcile/resolve_materialize_classify", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = std::time::Duration::ZERO;
            for _ in 0..iters {
                // Fresh log per iteration so every pass resolves the same proposals.
                let mut log = make_log();
                let start = Instant::now();
                resolve(&store, &mut log).unwrap();
                let working = materialize(&store, &log.snapshot()).working;
                let _ = classify(&store, &working, true);
                elapsed += start.elapsed();
            }
            elapsed
        });
    });
}

fn bench_materialize(c: &mut Criterion) {
    let store = make_store();
    let mut log = make_log();
    resolve(&store, &mut log).unwrap();
    let snapshot = log.snapshot();
    c.bench_function("reconcile/materialize", |b| b.iter(|| materialize(&store, &snapshot)));
}

criterion_group!(
    benches,
    bench_plan,
    bench_resolve_materialize_classify,
    bench_materialize
);
criterion_main!(benches);
