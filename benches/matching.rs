//! Matching throughput benchmarks.
//!
//! Measures per-event evaluation cost as the profile set grows, with the
//! inverted index on and off, and the cost of filter compilation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion as Bench};
use killwatch::{
    Compiler, Criterion, EngineConfig, KillmailEvent, MatchingEngine, OwnerId, Participant,
    Profile, ProfileTarget,
};
use std::sync::Arc;

/// A mix of indexable and scan-only profiles resembling real watch lists.
fn profile(i: u64) -> Profile {
    let criteria = match i % 5 {
        0 => Criterion::leaf("character_id", "eq", 90_000_000 + i),
        1 => Criterion::leaf("alliance_id", "in", vec![99_000_000 + i, 99_000_001 + i]),
        2 => Criterion::and(vec![
            Criterion::leaf("solar_system_id", "eq", 30_000_000 + i % 500),
            Criterion::leaf("total_value", "gt", 1.0e8),
        ]),
        3 => Criterion::or(vec![
            Criterion::leaf("corporation_id", "eq", 98_000_000 + i),
            Criterion::leaf("ship_type_id", "in", vec![19720, 19722, 19724, 19726]),
        ]),
        _ => Criterion::and(vec![
            Criterion::leaf("total_value", "gte", 1.0e10),
            Criterion::leaf("participant_count", "gt", 50),
        ]),
    };
    Profile::new(OwnerId::from("bench"), "bench", criteria)
}

fn engine(profiles: u64, index: bool) -> MatchingEngine {
    let engine = MatchingEngine::new(
        EngineConfig::default()
            .with_index(index)
            .with_max_profiles(profiles as usize + 1),
    )
    .expect("engine");
    for i in 0..profiles {
        let compiled = engine.compiler().compile_profile(&profile(i)).expect("compile");
        engine.upsert(Arc::new(compiled)).expect("upsert");
    }
    engine
}

fn fleet_fight(attackers: u64) -> KillmailEvent {
    let mut event = KillmailEvent::new(
        123_456_789,
        30_000_142,
        4.5e9,
        Participant::new(90_000_010, 98_000_010, 19720).with_alliance(99_000_010),
    );
    for i in 0..attackers {
        event = event.with_attacker(
            Participant::new(90_000_100 + i, 98_000_100 + i % 7, 11567).with_alliance(99_000_020),
        );
    }
    event
}

fn bench_evaluate(c: &mut Bench) {
    let mut group = c.benchmark_group("evaluate");
    let event = fleet_fight(40);
    for profiles in [1_000u64, 10_000, 50_000] {
        for index in [true, false] {
            let engine = engine(profiles, index);
            let label = if index { "indexed" } else { "scan" };
            group.bench_with_input(BenchmarkId::new(label, profiles), &event, |b, event| {
                b.iter(|| black_box(engine.evaluate(black_box(event))))
            });
        }
    }
    group.finish();
}

fn bench_compile(c: &mut Bench) {
    let compiler = Compiler::new();
    let deep = (0..9).fold(Criterion::leaf("character_id", "in", (1..500).collect::<Vec<u64>>()), |tree, i| {
        Criterion::or(vec![tree, Criterion::leaf("solar_system_id", "eq", 30_000_000 + i)])
    });
    c.bench_function("compile_deep_tree", |b| {
        b.iter(|| black_box(compiler.compile(black_box(&deep))))
    });
}

criterion_group!(benches, bench_evaluate, bench_compile);
criterion_main!(benches);
