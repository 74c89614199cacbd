use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vizij_pose_search_core::{
    build_index, search, FeatureVectorBuilder, PoseSearchMode, SearchContext,
};
use vizij_pose_search_fixtures::{databases, mk_locomotion_database};

fn bench_search(c: &mut Criterion) {
    let config = databases::config("locomotion").expect("locomotion fixture");
    let database = mk_locomotion_database(config);
    let index = build_index(&database).expect("index builds");

    let mut builder = FeatureVectorBuilder::new(index.schema());
    builder.copy_from_search_index(&index, index.num_poses() / 3);
    let query = builder.normalized_values().to_vec();

    let mut group = c.benchmark_group("search");
    for (name, mode) in [
        ("brute_force", PoseSearchMode::BruteForce),
        ("pca_kd_tree", PoseSearchMode::PcaKdTree),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let ctx = SearchContext::new(black_box(&query)).with_mode(mode);
                black_box(search(&index, &ctx))
            })
        });
    }
    group.finish();

    c.bench_function("build_index", |b| {
        b.iter(|| black_box(build_index(&database).expect("index builds")))
    });
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
