use std::{net::Ipv4Addr, sync::Arc};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use manet_model::LinkQuality;
use manet_tc::{LinkPlan, RecordingBackend, RuleCompiler};

/// Full reconfiguration against the in-memory backend: numbering, class derivation and the
/// sequence of backend calls, without the cost of spawning `tc`.
fn full_rebuild(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("full_rebuild");
    for peers in [2u32, 10, 50, 88] {
        let links: Vec<_> = (1..=peers)
            .map(|peer| LinkPlan {
                peer,
                destination: Ipv4Addr::from(u32::from(Ipv4Addr::new(172, 31, 0, 10)) + peer),
                quality: LinkQuality {
                    latency_ms: 2.0 + f64::from(peer),
                    loss_percent: f64::from(peer % 5),
                    reachable: peer % 7 != 0,
                    distance_m: 40.0 * f64::from(peer),
                },
            })
            .collect();

        group.throughput(Throughput::Elements(u64::from(peers)));
        group.bench_with_input(BenchmarkId::from_parameter(peers), &links, |b, links| {
            b.to_async(&rt).iter(|| async {
                let backend = Arc::new(RecordingBackend::new());
                let mut compiler = RuleCompiler::new(backend);
                compiler.apply(1000, links).await.unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, full_rebuild);
criterion_main!(benches);
