use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mesh_upstream::{
    Cluster, FallbackPolicy, HealthFlag, HostConfig, LbConfig, LbType, LoadBalancerContext,
    MatchCriteria, SubsetConfig,
};

/// Hosts spread over 4 zones and 2 versions
fn host_configs(count: usize) -> Vec<HostConfig> {
    (0..count)
        .map(|i| {
            let zone = format!("z{}", i % 4);
            let version = format!("v{}", i % 2);
            HostConfig::new(format!("10.{}.{}.{}:8080", i / 65536, (i / 256) % 256, i % 256))
                .with_metadata([("zone", zone), ("version", version)].into_iter().collect())
        })
        .collect()
}

fn subset_lb() -> LbConfig {
    LbConfig::subset(SubsetConfig {
        fallback_policy: FallbackPolicy::AnyEndpoint,
        selectors: vec![
            vec!["zone".to_string(), "version".to_string()],
            vec!["zone".to_string()],
        ],
        ..Default::default()
    })
}

fn cluster(lb: LbConfig, count: usize) -> Cluster {
    let cluster = Cluster::new("bench", lb).expect("valid lb config");
    cluster.update_hosts(host_configs(count));
    cluster
}

/// Flip one host's health back and forth in a subset cluster
fn bench_health_refresh(c: &mut Criterion) {
    let mut group = c.benchmark_group("health_refresh");

    for host_count in [100, 1000].iter() {
        let cluster = cluster(subset_lb(), *host_count);
        let address = host_configs(*host_count)[host_count / 2].address.clone();

        group.bench_with_input(
            BenchmarkId::new("set_and_clear", host_count),
            host_count,
            |b, _| {
                b.iter(|| {
                    cluster.set_health_flag(&address, HealthFlag::FAILED_OUTLIER_CHECK);
                    cluster.clear_health_flag(&address, HealthFlag::FAILED_OUTLIER_CHECK);
                    black_box(cluster.host_set().healthy_count());
                });
            },
        );
    }

    group.finish();
}

/// Membership reconciliation on a 1000-host cluster
fn bench_membership(c: &mut Criterion) {
    let mut group = c.benchmark_group("membership");
    let configs = host_configs(1001);
    let (base, extra) = configs.split_at(1000);

    for (name, lb) in [("round_robin", LbConfig::new(LbType::RoundRobin)), ("subset", subset_lb())] {
        let cluster = cluster(lb, 1000);

        group.bench_function(BenchmarkId::new("update_unchanged", name), |b| {
            b.iter(|| black_box(cluster.update_hosts(base.to_vec())));
        });

        group.bench_function(BenchmarkId::new("remove_and_append", name), |b| {
            b.iter(|| {
                black_box(cluster.append_hosts(extra.to_vec()));
                black_box(cluster.remove_hosts(&[extra[0].address.as_str()]));
            });
        });
    }

    group.finish();
}

fn bench_choose_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("choose_host");

    for lb_type in [LbType::Random, LbType::RoundRobin, LbType::WeightedRoundRobin] {
        let cluster = cluster(LbConfig::new(lb_type), 100);
        group.bench_function(BenchmarkId::new("simple", format!("{:?}", lb_type)), |b| {
            b.iter(|| black_box(cluster.choose_host(None)));
        });
    }

    let cluster = cluster(subset_lb(), 100);
    let matched: MatchCriteria = [("zone", "z1"), ("version", "v1")].into_iter().collect();
    let unmatched: MatchCriteria = [("zone", "z9")].into_iter().collect();
    for (name, criteria) in [("subset_match", &matched), ("subset_fallback", &unmatched)] {
        let context: &dyn LoadBalancerContext = criteria;
        group.bench_function(name, |b| {
            b.iter(|| black_box(cluster.choose_host(Some(context))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_health_refresh, bench_membership, bench_choose_host);
criterion_main!(benches);
