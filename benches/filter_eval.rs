//! Per-event hot path benchmark
//!
//! Every delivered event pays for predicate evaluation and, when admitted,
//! structured extraction. Both run on the pump thread, so they bound the
//! event rate a session can sustain.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench filter_eval
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use krabtrace::dns::ReverseLookupCache;
use krabtrace::extractor::PropertyExtractor;
use krabtrace::parser::default_parsers;
use krabtrace::providers;
use krabtrace::{EventRecord, Predicate, Property};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

fn network_event(pid: u32) -> EventRecord {
    EventRecord::builder(providers::KERNEL_NETWORK, providers::KERNEL_NETWORK_ID, 10)
        .process(pid)
        .property(Property::ipv4("daddr", Ipv4Addr::new(93, 184, 216, 34)))
        .property(Property::ipv4("saddr", Ipv4Addr::new(10, 0, 0, 2)))
        .property(Property::u16("dport", 443))
        .property(Property::unicode("ImageName", "C:\\Windows\\System32\\svchost.exe"))
        .build()
}

/// Predicate trees of increasing width, built the way the correlator does
fn bench_predicate_evaluate(c: &mut Criterion) {
    let record = network_event(4242);
    let mut group = c.benchmark_group("predicate_evaluate");

    for width in [1usize, 4, 16] {
        let ids: Vec<u16> = (0..width as u16).map(|i| 100 + i).chain([10]).collect();
        let predicate = Predicate::process_id_equals(4242)
            .and(Predicate::event_id_in(&ids).unwrap_or_else(Predicate::any))
            .and(Predicate::string_contains("ImageName", "SVCHOST", false));

        group.bench_with_input(BenchmarkId::from_parameter(width), &predicate, |b, p| {
            b.iter(|| p.evaluate(black_box(&record)));
        });
    }
    group.finish();
}

fn bench_expression_parse(c: &mut Criterion) {
    c.bench_function("predicate_from_expr", |b| {
        b.iter(|| Predicate::from_expr(black_box("pid=4242,event=10|26|42|58,!ImageName~=svchost")))
    });
}

fn bench_extract(c: &mut Criterion) {
    let cache = Arc::new(ReverseLookupCache::new());
    cache.record_resolution(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), "example.com");
    let extractor = PropertyExtractor::new(false, Arc::new(default_parsers(Some(cache))));
    let record = network_event(1);

    c.bench_function("extract_network_event", |b| {
        b.iter(|| extractor.extract(black_box(&record)))
    });
}

criterion_group!(benches, bench_predicate_evaluate, bench_expression_parse, bench_extract);
criterion_main!(benches);
