//! Parallel input prefetcher.
//!
//! [`InputFetcher`] owns a fixed pool of worker threads that outlive any
//! single block. Per call, the dispatching thread scans the block, publishes
//! the outpoints to fetch, then joins the workers in claiming batches off the
//! tail of the list. Each participant looks its batch up in the backing view
//! and parks the found coins in its own result slot; once the cursor and the
//! in-flight count both reach zero the dispatcher merges every slot into the
//! cache with a non-overwriting insert.
//!
//! The fetcher is an accelerator, not an oracle: a missing coin or a store
//! error drains the remaining work and the call still returns cleanly. The
//! cache simply ends up less warm than it could have been, and validation
//! re-discovers the problem on its own serial pass.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use lode_core::coins::{CacheReader, CoinCache, CoinView};
use lode_core::types::{Block, Coin, Hash256, OutPoint};

/// Everything one call shares with the workers.
///
/// Built and published by the dispatcher before any worker is woken,
/// read-only afterwards. Workers reach it through the coordinator state and
/// drop their handles when the call is drained.
struct CallContext {
    /// Outpoints to fetch. Claims are taken off the tail.
    outpoints: Vec<OutPoint>,
    /// Txids of every non-coinbase transaction in the block. An outpoint
    /// created by the block itself cannot be in the backing view.
    txids: HashSet<Hash256>,
    /// The backing view to read from.
    backing: Arc<dyn CoinView>,
    /// Read handle onto the cache being warmed.
    cache: CacheReader,
}

/// State guarded by the coordinator mutex.
struct FetchState {
    /// Cursor into `outpoints`; the unclaimed prefix is `[0, last_index)`.
    last_index: usize,
    /// Outpoints published but not yet settled by the claimant.
    in_flight: usize,
    /// Workers currently blocked on `work_available`.
    idle_workers: usize,
    /// Set once at shutdown.
    stop: bool,
    /// Published per-call context; `None` between calls.
    ctx: Option<Arc<CallContext>>,
}

/// A batch claimed off the tail of the outpoint list.
enum Claim {
    Batch {
        ctx: Arc<CallContext>,
        start: usize,
        end: usize,
    },
    Terminal,
}

/// Shared coordination state: one mutex, two wait signals, per-participant
/// result slots.
struct Coordinator {
    state: Mutex<FetchState>,
    /// Workers sleep here when the outpoint list is empty.
    work_available: Condvar,
    /// The dispatcher sleeps here while settled work is still outstanding.
    dispatcher_progress: Condvar,
    /// Result slot per participant. Slot `k` is written only by participant
    /// `k`; the dispatcher owns the last slot and drains all of them after
    /// the call has gone quiescent.
    results: Vec<Mutex<Vec<(OutPoint, Coin)>>>,
    /// Upper bound on one claim.
    batch_size: usize,
    /// Configured worker count; the dispatcher participates on top of this.
    worker_count: usize,
}

impl Coordinator {
    fn lock_state(&self) -> MutexGuard<'_, FetchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle the previous claim, then take the next one.
    ///
    /// Settling happens in the same critical section as the next claim, so a
    /// participant touches the lock once per batch. Returns `Terminal` when
    /// the pool is stopping, or — for the dispatcher — when the current call
    /// is fully drained.
    fn next_claim(&self, settled: usize, is_dispatcher: bool) -> Claim {
        let mut state = self.lock_state();

        if settled > 0 {
            state.in_flight -= settled;
            if !is_dispatcher && state.in_flight == 0 {
                self.dispatcher_progress.notify_one();
            }
        }

        while state.last_index == 0 {
            if state.stop {
                return Claim::Terminal;
            }
            if is_dispatcher {
                if state.in_flight == 0 {
                    return Claim::Terminal;
                }
                state = self
                    .dispatcher_progress
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            } else {
                state.idle_workers += 1;
                state = self
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                state.idle_workers -= 1;
            }
        }

        // ctx is published together with the counters; an empty slot with a
        // non-zero cursor cannot happen.
        let Some(ctx) = state.ctx.as_ref().map(Arc::clone) else {
            return Claim::Terminal;
        };

        // Divide the remaining work by the number of hands that could pick
        // it up, dispatcher included. Small batches while the pool is busy,
        // growing as it drains; always at least one outpoint.
        let pickers = self.worker_count + 1 + state.idle_workers;
        let take = (state.last_index / pickers)
            .min(self.batch_size)
            .max(1);
        let end = state.last_index;
        state.last_index = end - take;

        Claim::Batch {
            ctx,
            start: end - take,
            end,
        }
    }

    /// Abandon all unclaimed work for the current call.
    ///
    /// The remaining claims held by other participants still settle on their
    /// own; the settle that brings `in_flight` to zero wakes the dispatcher.
    fn abandon_unclaimed(&self) {
        let mut state = self.lock_state();
        state.in_flight -= state.last_index;
        state.last_index = 0;
    }

    /// Claim-and-process loop shared by workers and the dispatcher.
    ///
    /// `slot` selects the result vector this participant may write.
    fn run_participant(&self, slot: usize, is_dispatcher: bool) {
        let mut settled = 0;
        loop {
            let (ctx, start, end) = match self.next_claim(settled, is_dispatcher) {
                Claim::Terminal => return,
                Claim::Batch { ctx, start, end } => (ctx, start, end),
            };
            settled = end - start;

            let mut found: Vec<(OutPoint, Coin)> = Vec::with_capacity(settled);
            let mut abort = false;
            for outpoint in &ctx.outpoints[start..end] {
                if ctx.txids.contains(&outpoint.txid) {
                    // Created by this very block; the backing view cannot
                    // have it and a lookup would read as a false miss.
                    continue;
                }
                if ctx.cache.has(outpoint) {
                    continue;
                }
                match ctx.backing.get(outpoint) {
                    Ok(Some(coin)) => found.push((outpoint.clone(), coin)),
                    Ok(None) => {
                        // Missing input: the block will fail validation, so
                        // the rest of the prefetch is wasted work.
                        trace!(%outpoint, "input missing in backing view, draining prefetch");
                        abort = true;
                        break;
                    }
                    Err(err) => {
                        // Transient store error; validation will classify it.
                        trace!(%outpoint, %err, "backing view read failed, draining prefetch");
                        abort = true;
                        break;
                    }
                }
            }

            if !found.is_empty() {
                self.results[slot]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .append(&mut found);
            }
            if abort {
                self.abandon_unclaimed();
            }
        }
    }
}

/// Prefetches a block's inputs from a backing [`CoinView`] into a
/// [`CoinCache`] using a pool of long-lived worker threads.
///
/// Create once, reuse for every block. [`InputFetcher::fetch_inputs`] is
/// single-producer: calls on the same fetcher must be serialised by the
/// caller. Dropping the fetcher stops and joins the workers.
pub struct InputFetcher {
    coordinator: Arc<Coordinator>,
    workers: Vec<JoinHandle<()>>,
}

impl InputFetcher {
    /// Create a fetcher with `worker_count` threads and the given per-claim
    /// batch limit.
    ///
    /// With fewer than two workers the pool spawns nothing and
    /// [`InputFetcher::fetch_inputs`] becomes a no-op: funnelling lookups
    /// through a single worker is slower than the serial lookups validation
    /// does anyway. Callers should size the pool to the hardware minus one,
    /// since the dispatching thread participates in the work.
    pub fn new(batch_size: usize, worker_count: usize) -> Self {
        let coordinator = Arc::new(Coordinator {
            state: Mutex::new(FetchState {
                last_index: 0,
                in_flight: 0,
                idle_workers: 0,
                stop: false,
                ctx: None,
            }),
            work_available: Condvar::new(),
            dispatcher_progress: Condvar::new(),
            results: (0..=worker_count).map(|_| Mutex::new(Vec::new())).collect(),
            batch_size,
            worker_count,
        });

        let mut workers = Vec::new();
        if worker_count >= 2 {
            workers.reserve(worker_count);
            for index in 0..worker_count {
                let coordinator = Arc::clone(&coordinator);
                let handle = thread::Builder::new()
                    .name(format!("lodefetch.{index}"))
                    .spawn(move || coordinator.run_participant(index, false))
                    .expect("spawn prefetch worker");
                workers.push(handle);
            }
        }

        Self { coordinator, workers }
    }

    /// Number of live worker threads. Zero means the fetcher is inert.
    pub fn worker_threads(&self) -> usize {
        self.workers.len()
    }

    /// Warm `cache` with the coins the block's inputs will need.
    ///
    /// Scans the block, fetches every referenced outpoint that is neither
    /// created by the block itself nor already cached, and inserts the found
    /// coins with a non-overwriting emplace. Existing cache entries (spent
    /// sentinels included) are never touched. Nothing is reported back:
    /// missing coins and store errors only cut the prefetch short.
    pub fn fetch_inputs(
        &self,
        cache: &mut CoinCache,
        backing: &Arc<dyn CoinView>,
        block: &Block,
    ) {
        if self.workers.is_empty() || block.transactions.len() <= 1 {
            return;
        }

        let mut outpoints = Vec::new();
        let mut txids = HashSet::with_capacity(block.transactions.len() - 1);
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                outpoints.push(input.previous_output.clone());
            }
            if let Ok(txid) = tx.txid() {
                txids.insert(txid);
            }
        }
        if outpoints.is_empty() {
            return;
        }

        let total = outpoints.len();
        let ctx = Arc::new(CallContext {
            outpoints,
            txids,
            backing: Arc::clone(backing),
            cache: cache.reader(),
        });

        {
            let mut state = self.coordinator.lock_state();
            state.ctx = Some(Arc::clone(&ctx));
            state.in_flight = total;
            state.last_index = total;
        }
        self.coordinator.work_available.notify_all();

        // Work the queue alongside the pool; returns once every published
        // outpoint has been settled or abandoned.
        self.coordinator.run_participant(self.coordinator.worker_count, true);

        // All claims are settled, so no worker is writing its slot anymore.
        let mut inserted = 0usize;
        for slot in &self.coordinator.results {
            let mut pairs = slot.lock().unwrap_or_else(PoisonError::into_inner);
            for (outpoint, coin) in pairs.drain(..) {
                if cache.insert_if_absent(outpoint, coin) {
                    inserted += 1;
                }
            }
        }

        self.coordinator.lock_state().ctx = None;
        debug!(total, inserted, "prefetched block inputs");
    }

    /// True when no call is in progress and nothing is left over from the
    /// previous one.
    pub fn is_quiescent(&self) -> bool {
        let state = self.coordinator.lock_state();
        state.last_index == 0
            && state.in_flight == 0
            && state.ctx.is_none()
            && self
                .coordinator
                .results
                .iter()
                .all(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).is_empty())
    }
}

impl Drop for InputFetcher {
    fn drop(&mut self) {
        self.coordinator.lock_state().stop = true;
        self.coordinator.work_available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
