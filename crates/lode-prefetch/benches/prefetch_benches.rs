//! Criterion benchmark for the input prefetcher.
//!
//! The backing view sleeps on every lookup to stand in for a disk-resident
//! coin database, which is the latency the prefetcher exists to amortise.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lode_core::coins::{CoinCache, CoinView, MemoryCoinView};
use lode_core::types::{
    Block, BlockHeader, Coin, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};
use lode_prefetch::InputFetcher;

const BATCH_SIZE: usize = 128;
const LOOKUP_DELAY: Duration = Duration::from_micros(20);
const TXS: u64 = 256;
const INPUTS_PER_TX: u64 = 4;

/// Deterministic 32-byte hash derived from a counter.
fn hash(i: u64) -> Hash256 {
    Hash256(*blake3::hash(&i.to_le_bytes()).as_bytes())
}

fn sample_coin(i: u64) -> Coin {
    Coin {
        output: TxOutput { value: i + 1, script_pubkey: vec![0x51; 25] },
        height: i,
        is_coinbase: false,
    }
}

/// A block spending `TXS * INPUTS_PER_TX` distinct outpoints, plus a backing
/// view that serves all of them after a per-lookup delay.
fn sample_workload() -> (Block, Arc<dyn CoinView>) {
    let mut view = MemoryCoinView::with_delay(LOOKUP_DELAY);
    let mut transactions = vec![Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: vec![],
            public_key: vec![],
        }],
        outputs: vec![TxOutput { value: 50, script_pubkey: vec![0x51; 25] }],
        lock_time: 0,
    }];

    for t in 0..TXS {
        let inputs: Vec<TxInput> = (0..INPUTS_PER_TX)
            .map(|j| {
                let n = t * INPUTS_PER_TX + j;
                let previous_output = OutPoint { txid: hash(n), index: j as u32 };
                view.insert(previous_output.clone(), sample_coin(n));
                TxInput {
                    previous_output,
                    signature: vec![0u8; 64],
                    public_key: vec![0u8; 32],
                }
            })
            .collect();
        transactions.push(Transaction {
            version: 1,
            inputs,
            outputs: vec![TxOutput { value: 1, script_pubkey: vec![0x51; 25] }],
            lock_time: t,
        });
    }

    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: hash(u64::MAX),
            merkle_root: hash(u64::MAX - 1),
            timestamp: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce: 0,
        },
        transactions,
    };
    (block, Arc::new(view))
}

fn bench_fetch_inputs(c: &mut Criterion) {
    let (block, backing) = sample_workload();
    let total = (TXS * INPUTS_PER_TX) as usize;

    // The dispatching thread participates in the work, so leave it a core.
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
        .saturating_sub(1)
        .max(2);
    let fetcher = InputFetcher::new(BATCH_SIZE, workers);

    c.bench_function("fetch_inputs_cold_cache_1024_inputs", |b| {
        b.iter(|| {
            let mut cache = CoinCache::new();
            fetcher.fetch_inputs(&mut cache, &backing, black_box(&block));
            assert_eq!(cache.len(), total);
            cache
        })
    });

    // With every coin already cached the call is pure scan overhead.
    let mut warm_cache = CoinCache::new();
    fetcher.fetch_inputs(&mut warm_cache, &backing, &block);
    c.bench_function("fetch_inputs_warm_cache_1024_inputs", |b| {
        b.iter(|| {
            fetcher.fetch_inputs(&mut warm_cache, &backing, black_box(&block));
            assert_eq!(warm_cache.len(), total);
        })
    });
}

criterion_group!(benches, bench_fetch_inputs);
criterion_main!(benches);
