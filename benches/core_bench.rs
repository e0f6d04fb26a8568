//! Benchmarks for noderig core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use noderig::core::graph::Plan;
use noderig::core::parser;
use noderig::core::registry::Registry;
use noderig::provenance::hasher;
use noderig::resources::version::{deb_version_cmp, rpmvercmp};
use noderig::resources::{Resource, Rpm, RunCommand};

fn bench_version_compare(c: &mut Criterion) {
    let pairs = [
        ("1.14.1", "1.14.10"),
        ("2.4.6", "2.4.6"),
        ("1.0~rc1", "1.0"),
        ("5.2.1+git20190702", "5.2.1+git20190711"),
        ("7.29.0.el7_9", "7.29.0.el7"),
    ];
    c.bench_function("rpmvercmp", |b| {
        b.iter(|| {
            for (x, y) in &pairs {
                black_box(rpmvercmp(black_box(x), black_box(y)));
            }
        });
    });
    let debs = [
        ("1:1.14.1-00", "1.14.1-00"),
        ("1.0~rc1-1", "1.0-1"),
        ("18.09.7-0ubuntu1", "18.09.7-0ubuntu1~18.04"),
    ];
    c.bench_function("deb_version_cmp", |b| {
        b.iter(|| {
            for (x, y) in &debs {
                black_box(deb_version_cmp(black_box(x), black_box(y)));
            }
        });
    });
}

fn bench_hash_desired(c: &mut Criterion) {
    let rpm = Resource::Rpm(Rpm::new("kubelet", Some("1.14.1"), Some("0")).unwrap());
    c.bench_function("hash_desired_rpm", |b| {
        b.iter(|| black_box(hasher::hash_desired(black_box(&rpm))));
    });
}

fn bench_manifest_parse(c: &mut Criterion) {
    let yaml = r#"
version: "1.0"
name: bench-cluster
machines:
  m1:
    hostname: m1
    addr: 10.0.0.1
  m2:
    hostname: m2
    addr: 10.0.0.2
resources:
  docker:
    type: rpm
    machine: [m1, m2]
    name: docker-ce
    version: "18.09.7"
  kubelet:
    type: rpm
    machine: [m1, m2]
    name: kubelet
    version: "1.14.1"
    disable_excludes: kubernetes
    depends_on: [docker]
  kubeadm-config:
    type: file
    machine: m1
    path: /etc/noderig/kubeadm-config.yaml
    content: |
      apiVersion: kubeadm.k8s.io/v1beta1
      kind: ClusterConfiguration
    mode: "0600"
    depends_on: [kubelet]
  kubelet-service:
    type: service
    machine: [m1, m2]
    unit: kubelet
    depends_on: [kubelet]
"#;
    let registry = Registry::builtin();
    c.bench_function("manifest_parse_and_plan", |b| {
        b.iter(|| {
            let manifest = parser::parse_manifest(black_box(yaml)).unwrap();
            black_box(parser::build_plans(&manifest, &registry, None).unwrap());
        });
    });
}

fn bench_plan_build(c: &mut Criterion) {
    // Linear chain of N resources, submitted in reverse
    let mut group = c.benchmark_group("plan_build");
    for n in [10, 50, 100] {
        let resources: Vec<(String, Resource)> = (0..n)
            .rev()
            .map(|i| {
                (
                    format!("node-{i:04}"),
                    Resource::Command(RunCommand::new(&format!("echo {i}")).unwrap()),
                )
            })
            .collect();
        let edges: Vec<(String, String)> = (1..n)
            .map(|i| (format!("node-{:04}", i - 1), format!("node-{i:04}")))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let plan = Plan::build("bench", black_box(resources.clone()), &edges).unwrap();
                black_box(plan);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_version_compare,
    bench_hash_desired,
    bench_manifest_parse,
    bench_plan_build
);
criterion_main!(benches);
