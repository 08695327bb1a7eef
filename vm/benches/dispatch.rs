use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vm::config::{DomainCreateInfo, InterpOptions};
use vm::demos::{self, Demo};
use vm::Domain;

fn domain_with(options: &str) -> Domain {
    Domain::new(DomainCreateInfo {
        options: InterpOptions::parse(options),
        ..DomainCreateInfo::default()
    })
    .expect("domain")
}

fn run_case(c: &mut Criterion, name: &str, options: &str, install: impl Fn(&Domain) -> Demo) {
    let domain = domain_with(options);
    let demo = install(&domain);
    // First call transforms and fills the dispatch caches.
    let warmup = domain.invoke(demo.entry, &demo.args).expect("warmup");
    assert_eq!(warmup.as_i32(), demo.expected);

    c.bench_function(name, |b| {
        b.iter(|| {
            let result = domain
                .invoke(demo.entry, black_box(&demo.args))
                .expect("invoke");
            black_box(result);
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    run_case(c, "fib_20", "", |domain| demos::fib(domain, 20).expect("fib"));
    run_case(c, "interface_calls_1000", "", |domain| {
        demos::dispatch(domain, 1000).expect("dispatch")
    });
    run_case(c, "interface_calls_1000_counting_ops", "count-ops", |domain| {
        demos::dispatch(domain, 1000).expect("dispatch")
    });
    run_case(c, "exceptions", "", |domain| demos::exceptions(domain).expect("exceptions"));
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
