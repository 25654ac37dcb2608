// Criterion benchmarks for SkillSwap sync

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use skillswap_sync::core::{calculate_overlap, normalize_skill_name, DeclineLedger, Matcher};
use skillswap_sync::models::{OfferedSkill, Skill, UserProfile, WantedSkill, VersionVector};

const SKILLS: &[&str] = &[
    "guitar", "piano", "spanish", "french", "cooking", "rust", "python", "photography",
    "painting", "chess", "yoga", "public speaking", "knitting", "calculus", "swimming",
];

fn create_candidate(id: usize) -> UserProfile {
    let now = Utc::now();
    let mut profile = UserProfile::new(&format!("user-{}", id), &format!("User {}", id), now);
    profile.last_active = now - Duration::minutes((id % 600) as i64);
    profile.offered = (0..3)
        .map(|i| OfferedSkill {
            skill: Skill {
                name: SKILLS[(id + i) % SKILLS.len()].to_string(),
                level: 1 + (id % 5) as u8,
            },
            category: None,
            description: None,
        })
        .collect();
    profile.wanted = (0..3)
        .map(|i| WantedSkill {
            skill: Skill {
                name: SKILLS[(id * 7 + i) % SKILLS.len()].to_string(),
                level: 1,
            },
            priority: 1 + (i % 3) as u8,
        })
        .collect();
    profile
}

fn bench_overlap(c: &mut Criterion) {
    let me = create_candidate(1);
    let other = create_candidate(42);

    c.bench_function("calculate_overlap", |b| {
        b.iter(|| calculate_overlap(black_box(&me), black_box(&other)))
    });
}

fn bench_normalize(c: &mut Criterion) {
    c.bench_function("normalize_skill_name", |b| {
        b.iter(|| normalize_skill_name(black_box("  Public   Speaking  ")))
    });
}

fn bench_find_matches(c: &mut Criterion) {
    let matcher = Matcher::default();
    let me = create_candidate(0);
    let mut group = c.benchmark_group("find_matches");

    for size in [100usize, 1_000, 10_000] {
        let candidates: Vec<UserProfile> = (1..=size).map(create_candidate).collect();
        let mut declines = DeclineLedger::default();
        for i in (1..=size).step_by(10) {
            declines.record("user-0", &format!("user-{}", i), Utc::now());
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), &candidates, |b, candidates| {
            b.iter(|| matcher.find_matches(black_box(&me), candidates, &declines, Utc::now()))
        });
    }

    group.finish();
}

fn bench_version_vectors(c: &mut Criterion) {
    let mut a = VersionVector::default();
    let mut b = VersionVector::default();
    for i in 0..8 {
        a.increment(&format!("device-{}", i));
        b.increment(&format!("device-{}", i + 2));
    }

    c.bench_function("version_vector_compare_merge", |bench| {
        bench.iter(|| {
            let relation = black_box(&a).compare(black_box(&b));
            (relation, a.merge(&b))
        })
    });
}

criterion_group!(benches, bench_overlap, bench_normalize, bench_find_matches, bench_version_vectors);
criterion_main!(benches);
