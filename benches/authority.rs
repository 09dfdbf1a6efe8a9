//! Authority hot-path benchmarks.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

use maze_sync::authority::Authority;
use maze_sync::network::protocol::{Command, CommandRequest, UpdatePosPayload};

fn update(identity: &str, seq: i64) -> CommandRequest {
    let payload = UpdatePosPayload { x: 4, y: 7, lives: 3 };
    CommandRequest::new(identity, seq, Command::UpdatePos(payload))
}

fn bench_fresh_commands(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let authority = Authority::default();
    let authority = &authority;
    let mut seq = 0i64;

    c.bench_function("handle_command_fresh", |b| {
        b.to_async(&rt).iter(|| {
            seq += 1;
            let request = update("bench", seq);
            async move { black_box(authority.handle_command(&request).await) }
        })
    });
}

fn bench_duplicate_commands(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let authority = Authority::default();
    let request = update("bench", 1);
    rt.block_on(authority.handle_command(&request));

    let authority = &authority;
    let request = &request;
    c.bench_function("handle_command_duplicate", |b| {
        b.to_async(&rt)
            .iter(move || async move { black_box(authority.handle_command(request).await) })
    });
}

fn bench_state_query(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("handle_state_query");

    for players in [10usize, 100, 1000] {
        let authority = Arc::new(Authority::default());
        rt.block_on(async {
            for i in 0..players {
                authority.handle_command(&update(&format!("player-{}", i), 1)).await;
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(players), &authority, |b, authority| {
            b.to_async(&rt)
                .iter(move || async move { black_box(authority.handle_state_query().await) })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fresh_commands, bench_duplicate_commands, bench_state_query);
criterion_main!(benches);
