use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{CairnError, Result};
use crate::id::{IdAuthority, IdBlock};

/// Minimum number of ids left in a block when prefetch of the next block
/// starts, regardless of the configured buffer percentage.
const RENEW_ID_COUNT: u64 = 100;

/// Granularity of condvar waits, so a concurrent `close()` is noticed even
/// without a wakeup.
const WAIT_SLICE: Duration = Duration::from_millis(50);

enum FetchOutcome {
    Block(IdBlock),
    /// Authority signalled that the (partition, namespace) id space is
    /// drained. Permanent.
    Exhausted,
    Backend(String),
    /// Worker observed a stop request before issuing the remote call.
    Aborted,
}

enum WaitOutcome {
    Ready,
    TimedOut,
    Interrupted,
}

/// One background fetch. The result is published under `outcome` and
/// consumed by the next `next_id` that holds the pool lock.
struct FetchJob {
    outcome: Mutex<Option<FetchOutcome>>,
    done: Condvar,
    stop_requested: AtomicBool,
    /// Caller gave up on the fetch and the result will never be read.
    discarded: AtomicBool,
}

impl FetchJob {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
        }
    }

    fn publish(&self, outcome: FetchOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn take_outcome(&self) -> Option<FetchOutcome> {
        self.outcome.lock().take()
    }

    fn is_done(&self) -> bool {
        self.outcome.lock().is_some()
    }

    fn wait_until(&self, deadline: Instant, closed: &AtomicBool) -> WaitOutcome {
        let mut guard = self.outcome.lock();
        loop {
            if guard.is_some() {
                return WaitOutcome::Ready;
            }
            if closed.load(Ordering::Acquire) {
                return WaitOutcome::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            self.done.wait_for(&mut guard, slice);
        }
    }

    /// Blocks until the worker publishes, with no deadline. Used by `close`
    /// for parked fetches; the authority contract bounds each call.
    fn await_done(&self) {
        let mut guard = self.outcome.lock();
        while guard.is_none() {
            self.done.wait_for(&mut guard, WAIT_SLICE);
        }
    }
}

struct PoolState {
    current: IdBlock,
    index: u64,
    renew_index: u64,
    pending: Option<Arc<FetchJob>>,
    exhausted: bool,
    closed: bool,
    /// Timed-out fetches against a non-interruptible authority, parked here
    /// and drained by `close()`.
    close_blockers: VecDeque<Arc<FetchJob>>,
}

/// Allocates unique, monotonically increasing ids for one
/// (partition, namespace) pair, bounded above by `upper_bound` (exclusive).
///
/// All public operations serialize on the pool's lock. A single background
/// worker fetches blocks; at any time there is at most one current block and
/// one pending fetch. Waiters drop the pool lock while blocking on a fetch
/// so `close()` can interrupt them.
pub struct BlockPool {
    authority: Arc<dyn IdAuthority>,
    partition: u32,
    namespace: u32,
    upper_bound: u64,
    renew_timeout: Duration,
    renew_buffer_percentage: f64,
    state: Mutex<PoolState>,
    closed_hint: AtomicBool,
    sender: Mutex<Option<Sender<Arc<FetchJob>>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BlockPool {
    pub fn new(
        authority: Arc<dyn IdAuthority>,
        partition: u32,
        namespace: u32,
        upper_bound: u64,
        renew_timeout: Duration,
        renew_buffer_percentage: f64,
    ) -> Result<Self> {
        if upper_bound == 0 {
            return Err(CairnError::InvalidArgument(
                "id upper bound must be positive".into(),
            ));
        }
        if renew_timeout.is_zero() {
            return Err(CairnError::InvalidArgument(
                "renew timeout must be positive".into(),
            ));
        }
        if !(renew_buffer_percentage > 0.0 && renew_buffer_percentage <= 1.0) {
            return Err(CairnError::InvalidArgument(
                "renew buffer percentage must be in (0.0, 1.0]".into(),
            ));
        }

        let (sender, receiver): (Sender<Arc<FetchJob>>, Receiver<Arc<FetchJob>>) = mpsc::channel();
        let worker_authority = Arc::clone(&authority);
        let worker = thread::Builder::new()
            .name(format!("cairn-id({partition})({namespace})"))
            .spawn(move || {
                fetch_loop(receiver, worker_authority, partition, namespace, renew_timeout);
            })
            .map_err(|e| CairnError::PoolBackend(format!("failed to spawn id worker: {e}")))?;

        Ok(Self {
            authority,
            partition,
            namespace,
            upper_bound,
            renew_timeout,
            renew_buffer_percentage,
            state: Mutex::new(PoolState {
                current: IdBlock::empty(),
                index: 0,
                renew_index: 0,
                pending: None,
                exhausted: false,
                closed: false,
                close_blockers: VecDeque::with_capacity(4),
            }),
            closed_hint: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn namespace(&self) -> u32 {
        self.namespace
    }

    /// Hands out the next id.
    ///
    /// Fails with `PoolExhausted` once the authority is drained or
    /// `upper_bound` is reached, `PoolClosed` after `close()`,
    /// `PoolTimeout` when a block fetch exceeds the renew timeout,
    /// `Interrupted` when the pool is closed under a blocked caller, and
    /// `PoolBackend` (retryable) on authority I/O failure.
    pub fn next_id(&self) -> Result<u64> {
        let mut deadline: Option<Instant> = None;
        loop {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CairnError::PoolClosed {
                    partition: self.partition,
                    namespace: self.namespace,
                });
            }
            if state.exhausted {
                return Err(CairnError::PoolExhausted {
                    partition: self.partition,
                    namespace: self.namespace,
                });
            }

            if state.index < state.current.num_ids() {
                if state.index == state.renew_index && state.pending.is_none() {
                    self.start_fetch(&mut state);
                }
                let id = state.current.get_id(state.index);
                state.index += 1;
                if id >= self.upper_bound {
                    state.exhausted = true;
                    return Err(CairnError::PoolExhausted {
                        partition: self.partition,
                        namespace: self.namespace,
                    });
                }
                trace!(
                    partition = self.partition,
                    namespace = self.namespace,
                    id,
                    "returned id"
                );
                return Ok(id);
            }

            // Current block drained: swap in the pending block, starting the
            // fetch if nothing is outstanding.
            if state.pending.is_none() {
                self.start_fetch(&mut state);
            }
            let job = match state.pending.clone() {
                Some(job) => job,
                None => {
                    // start_fetch declined: pool was closed underneath us.
                    return Err(CairnError::PoolClosed {
                        partition: self.partition,
                        namespace: self.namespace,
                    });
                }
            };

            if let Some(outcome) = job.take_outcome() {
                state.pending = None;
                match outcome {
                    FetchOutcome::Block(block) => {
                        self.install_block(&mut state, block);
                        continue;
                    }
                    FetchOutcome::Exhausted => {
                        state.exhausted = true;
                        return Err(CairnError::PoolExhausted {
                            partition: self.partition,
                            namespace: self.namespace,
                        });
                    }
                    FetchOutcome::Backend(message) => {
                        return Err(CairnError::PoolBackend(message));
                    }
                    FetchOutcome::Aborted => {
                        return Err(CairnError::PoolBackend(
                            "id block retrieval aborted by caller".into(),
                        ));
                    }
                }
            }

            // Wait off the pool lock so close() can interrupt us and other
            // callers are not serialized behind the wait.
            drop(state);
            let wait_deadline =
                *deadline.get_or_insert_with(|| Instant::now() + self.renew_timeout);
            match job.wait_until(wait_deadline, &self.closed_hint) {
                WaitOutcome::Ready => continue,
                WaitOutcome::Interrupted => {
                    return Err(CairnError::Interrupted("id block renewal"));
                }
                WaitOutcome::TimedOut => {
                    let mut state = self.state.lock();
                    let still_pending = state
                        .pending
                        .as_ref()
                        .map(|p| Arc::ptr_eq(p, &job))
                        .unwrap_or(false);
                    if still_pending && !job.is_done() {
                        job.stop_requested.store(true, Ordering::Release);
                        state.pending = None;
                        if self.authority.supports_interruption() {
                            job.discarded.store(true, Ordering::Release);
                        } else {
                            // Clean one dead element out of the queue every
                            // time we append to it.
                            if state
                                .close_blockers
                                .front()
                                .map(|f| f.is_done())
                                .unwrap_or(false)
                            {
                                state.close_blockers.pop_front();
                            }
                            state.close_blockers.push_back(job);
                        }
                        warn!(
                            partition = self.partition,
                            namespace = self.namespace,
                            timeout_ms = self.renew_timeout.as_millis() as u64,
                            "id block allocation timed out"
                        );
                        return Err(CairnError::PoolTimeout {
                            partition: self.partition,
                            namespace: self.namespace,
                            millis: self.renew_timeout.as_millis() as u64,
                        });
                    }
                    // The result arrived, or another caller already handled
                    // the timeout; re-examine under the lock.
                    continue;
                }
            }
        }
    }

    /// Closes the pool. Idempotent. Blocks until the outstanding fetch (if
    /// any) completes or is stop-requested, then drains parked fetches and
    /// joins the worker. After return, `next_id` fails with `PoolClosed`.
    pub fn close(&self) {
        self.closed_hint.store(true, Ordering::Release);
        let (pending, blockers) = {
            let mut state = self.state.lock();
            state.closed = true;
            (
                state.pending.take(),
                std::mem::take(&mut state.close_blockers),
            )
        };

        if let Some(job) = pending {
            job.stop_requested.store(true, Ordering::Release);
            let deadline = Instant::now() + self.renew_timeout;
            while !job.is_done() && Instant::now() < deadline {
                thread::sleep(WAIT_SLICE.min(Duration::from_millis(5)));
            }
            if !job.is_done() {
                job.discarded.store(true, Ordering::Release);
                warn!(
                    partition = self.partition,
                    namespace = self.namespace,
                    "closing pool with id block fetch still in flight"
                );
            }
        }
        for job in blockers {
            job.await_done();
            debug!(
                partition = self.partition,
                namespace = self.namespace,
                "drained parked id block fetch"
            );
        }

        *self.sender.lock() = None;
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        debug!(
            partition = self.partition,
            namespace = self.namespace,
            "id pool closed"
        );
    }

    fn start_fetch(&self, state: &mut PoolState) {
        if state.closed || state.pending.is_some() {
            return;
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        let job = Arc::new(FetchJob::new());
        debug!(
            partition = self.partition,
            namespace = self.namespace,
            index = state.index,
            "starting id block renewal"
        );
        if sender.send(Arc::clone(&job)).is_ok() {
            state.pending = Some(job);
        }
    }

    fn install_block(&self, state: &mut PoolState, block: IdBlock) {
        let num_ids = block.num_ids();
        let buffer = (num_ids as f64 * self.renew_buffer_percentage).round() as u64;
        state.renew_index = num_ids.saturating_sub(RENEW_ID_COUNT.max(buffer));
        state.current = block;
        state.index = 0;
        debug!(
            partition = self.partition,
            namespace = self.namespace,
            start = block.start(),
            num_ids,
            renew_index = state.renew_index,
            "acquired id block"
        );
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn fetch_loop(
    receiver: Receiver<Arc<FetchJob>>,
    authority: Arc<dyn IdAuthority>,
    partition: u32,
    namespace: u32,
    renew_timeout: Duration,
) {
    while let Ok(job) = receiver.recv() {
        if job.stop_requested.load(Ordering::Acquire) {
            debug!(
                partition,
                namespace, "aborting id block retrieval after stop request"
            );
            job.publish(FetchOutcome::Aborted);
            continue;
        }
        let started = Instant::now();
        let outcome = match authority.get_id_block(partition, namespace, renew_timeout) {
            Ok(block) if block.num_ids() == 0 => {
                FetchOutcome::Backend("authority returned an empty id block".into())
            }
            Ok(block) => {
                debug!(
                    partition,
                    namespace,
                    start = block.start(),
                    num_ids = block.num_ids(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "retrieved id block from authority"
                );
                FetchOutcome::Block(block)
            }
            Err(CairnError::PoolExhausted { .. }) => FetchOutcome::Exhausted,
            Err(e) => FetchOutcome::Backend(e.to_string()),
        };
        if job.discarded.load(Ordering::Acquire) {
            debug!(partition, namespace, "discarding result of cancelled id block fetch");
        }
        job.publish(outcome);
    }
}
