// unit_cache.rs - Benchmarks for compilation unit loading through the shared cache
//
// Run with: cargo bench --bench unit_cache --features test-support
// Compare baselines: cargo bench --bench unit_cache --features test-support -- --baseline before

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use golsp::config::ServerConfig;
use golsp::state::ServerState;
use golsp::test_utils::fixture_workspace::{generate, package_name, FixtureConfig, FixtureWorkspace};

fn state_for(workspace: &FixtureWorkspace) -> ServerState {
    let state = ServerState::new(ServerConfig::default());
    state.set_workspace_root(Some(workspace.root().to_path_buf()));
    state
}

/// Last package of the chain, which transitively imports every other one.
fn leaf_file(workspace: &FixtureWorkspace, config: &FixtureConfig) -> std::path::PathBuf {
    workspace.path(&format!("{}/f0.go", package_name(config.packages - 1)))
}

fn bench_cold_load(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("unit_cache/cold_load");
    for config in [FixtureConfig::small(), FixtureConfig::medium()] {
        let workspace = generate(&config);
        let path = leaf_file(&workspace, &config);
        group.bench_with_input(
            BenchmarkId::from_parameter(config.packages),
            &path,
            |b, path| {
                b.to_async(&rt).iter_batched(
                    || state_for(&workspace),
                    |state| async move {
                        let cancel = CancellationToken::new();
                        let unit = state.loader().unit_for_file(path, &cancel).await.unwrap();
                        black_box(unit);
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_warm_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = FixtureConfig::medium();
    let workspace = generate(&config);
    let path = leaf_file(&workspace, &config);
    let state = state_for(&workspace);
    let cancel = CancellationToken::new();
    rt.block_on(state.loader().unit_for_file(&path, &cancel)).unwrap();
    let (state, path, cancel) = (&state, &path, &cancel);

    c.bench_function("unit_cache/warm_hit", |b| {
        b.to_async(&rt).iter(|| async move {
            let unit = state.loader().unit_for_file(path, cancel).await.unwrap();
            black_box(unit);
        });
    });
}

fn bench_invalidate_reload(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = FixtureConfig::medium();
    let workspace = generate(&config);
    let leaf = leaf_file(&workspace, &config);
    let root_package = workspace.path(&format!("{}/f0.go", package_name(0)));
    let state = state_for(&workspace);
    let cancel = CancellationToken::new();
    rt.block_on(state.loader().unit_for_file(&leaf, &cancel)).unwrap();
    let (state, leaf, root_package, cancel) = (&state, &leaf, &root_package, &cancel);

    c.bench_function("unit_cache/invalidate_reload", |b| {
        b.to_async(&rt).iter(|| async move {
            state.invalidate(root_package);
            let unit = state.loader().unit_for_file(leaf, cancel).await.unwrap();
            black_box(unit);
        });
    });
}

criterion_group!(benches, bench_cold_load, bench_warm_hit, bench_invalidate_reload);
criterion_main!(benches);
