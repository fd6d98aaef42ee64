//! Latency benchmarks for the block pipeline
//!
//! A busy block carries a few thousand transactions; filtering, attribution
//! merging and prompt building for such a block should stay well under the
//! settle delay before the next fetch.

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use whalescope_ingestor::decoder::{PrevOut, RawInput, RawOutput, RawTransaction};
use whalescope_ingestor::enricher::apply_attributions;
use whalescope_ingestor::filter::TransactionFilter;
use whalescope_ingestor::summarizer::{build_prompt, DEFAULT_INSTRUCTIONS};

const BTC: u64 = 100_000_000;
const BLOCK_SIZE: usize = 3000;

/// Synthetic block where every tenth transaction moves more than 1 BTC
fn synthetic_block() -> Vec<RawTransaction> {
    (0..BLOCK_SIZE)
        .map(|i| {
            let value = if i % 10 == 0 { 5 * BTC } else { BTC / 100 };
            RawTransaction {
                hash: format!("{:064x}", i),
                inputs: vec![RawInput {
                    prev_out: Some(PrevOut {
                        addr: Some(format!("bc1qinput{}", i)),
                        value: Some(value + 10_000),
                    }),
                }],
                out: vec![
                    RawOutput {
                        addr: Some(format!("bc1qdest{}", i)),
                        value,
                    },
                    RawOutput {
                        addr: Some(format!("bc1qchange{}", i)),
                        value: 5_000,
                    },
                ],
            }
        })
        .collect()
}

/// Benchmark filtering a full block
fn bench_filter_block(c: &mut Criterion) {
    let block = synthetic_block();
    let filter = TransactionFilter::default();

    c.bench_function("filter_block_3000_tx", |b| {
        b.iter(|| black_box(filter.filter(black_box(&block))))
    });
}

/// Benchmark merging attributions into the filtered records
fn bench_apply_attributions(c: &mut Criterion) {
    let filter = TransactionFilter::default();
    let filtered = filter.filter(&synthetic_block());
    let attributions: HashMap<String, String> = filtered
        .addresses
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 == 0)
        .map(|(i, address)| (address.clone(), format!("entity-{}", i % 7)))
        .collect();

    c.bench_function("apply_attributions", |b| {
        b.iter(|| {
            let mut records = filtered.records.clone();
            for record in records.iter_mut() {
                apply_attributions(record, &attributions, filter.threshold_sats());
            }
            black_box(records)
        })
    });
}

/// Benchmark building the summarizer prompt
fn bench_build_prompt(c: &mut Criterion) {
    let filtered = TransactionFilter::default().filter(&synthetic_block());

    c.bench_function("build_prompt", |b| {
        b.iter(|| black_box(build_prompt(DEFAULT_INSTRUCTIONS, black_box(&filtered.records)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_filter_block,
    bench_apply_attributions,
    bench_build_prompt
);

criterion_main!(benches);
