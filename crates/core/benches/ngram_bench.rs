//! Criterion benchmarks for draft proposal.
//!
//! Covers the n-gram prompt lookup over long histories and the suffix
//! table's incremental update plus lookup.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use specbatch_core::batch::{RequestHistory, SlotIndex};
use specbatch_core::engine::spec_decode::{NgramConfig, NgramProposer, SuffixConfig, SuffixProposer};
use specbatch_core::request::RequestId;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pseudo-random history with a repeated phrase near both ends, so the
/// lookup has to scan the whole sequence before it matches.
fn make_history(len: usize) -> Vec<u32> {
    let phrase = [11, 12, 13, 14, 15, 16];
    let mut tokens: Vec<u32> = (0..len as u32)
        .map(|i| 100 + (i.wrapping_mul(2_654_435_761) >> 20) % 30_000)
        .collect();
    tokens[..phrase.len()].copy_from_slice(&phrase);
    let tail = len - 3;
    tokens[tail..].copy_from_slice(&phrase[..3]);
    tokens
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_ngram_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ngram_lookup");
    let proposer = NgramProposer::new(NgramConfig {
        min_n: 1,
        max_n: 5,
        num_speculative_tokens: 4,
    });

    for &len in &[512, 4_096, 32_768] {
        let history = make_history(len);
        group.bench_with_input(BenchmarkId::new("history", len), &history, |b, h| {
            b.iter(|| black_box(proposer.propose(black_box(h), 4)));
        });
    }
    group.finish();
}

fn bench_suffix_decode_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("suffix_decode_step");

    for &len in &[512, 4_096] {
        let tokens = make_history(len);
        group.bench_with_input(BenchmarkId::new("history", len), &tokens, |b, tokens| {
            b.iter_batched(
                || {
                    let mut proposer = SuffixProposer::new(SuffixConfig::default());
                    let history = RequestHistory {
                        req_id: RequestId::from("bench"),
                        slot: SlotIndex::new(0),
                        admission_seq: 0,
                        token_ids: tokens[..tokens.len() - 1].to_vec(),
                    };
                    proposer.propose(&history, 4);
                    (proposer, tokens.clone())
                },
                |(mut proposer, tokens)| {
                    let history = RequestHistory {
                        req_id: RequestId::from("bench"),
                        slot: SlotIndex::new(0),
                        admission_seq: 0,
                        token_ids: tokens,
                    };
                    black_box(proposer.propose(&history, 4))
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(drafting, bench_ngram_lookup, bench_suffix_decode_step);
criterion_main!(drafting);
