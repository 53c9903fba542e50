//! Background acquisition.
//!
//! The acquisition loop is the sole writer of the paired ring. Each cycle it:
//! 1. Picks the next source round-robin (`(last + 1) mod N`, starting at 0)
//! 2. Asks that source for a frame with a bounded wait
//! 3. On success, copies the frame and its provenance into the ring
//! 4. On failure, logs and moves on without writing or retrying
//!
//! The index advances whatever the outcome, so a source that keeps failing
//! never starves the others.

use anyhow::{anyhow, bail, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::ingest::FrameSource;
use crate::paired::{Deposit, PairedBuffer};
use crate::provenance::{Provenance, SourceId};

/// Round-robin cursor over a fixed number of sources.
#[derive(Clone, Debug)]
pub struct RoundRobin {
    count: usize,
    last: Option<usize>,
}

impl RoundRobin {
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            bail!("round robin needs at least one source");
        }
        Ok(Self { count, last: None })
    }

    /// Advance and return the next index.
    pub fn next_index(&mut self) -> usize {
        let next = match self.last {
            Some(last) => (last + 1) % self.count,
            None => 0,
        };
        self.last = Some(next);
        next
    }
}

#[derive(Debug, Default)]
struct SourceCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time counters for one source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Counters shared between the acquisition thread and observers.
#[derive(Debug)]
pub struct LoopStats {
    cycles: AtomicU64,
    evictions: AtomicU64,
    discards: AtomicU64,
    sources: Vec<SourceCounters>,
}

impl LoopStats {
    fn new(source_count: usize) -> Self {
        Self {
            cycles: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            sources: (0..source_count).map(|_| SourceCounters::default()).collect(),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Deposits that overwrote an unread frame.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Retrieved frames dropped because the write slot was still held by a consumer.
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    pub fn source(&self, id: SourceId) -> Option<SourceStats> {
        self.sources.get(id.0).map(|counters| SourceStats {
            attempts: counters.attempts.load(Ordering::Relaxed),
            successes: counters.successes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        })
    }

    pub fn per_source(&self) -> Vec<SourceStats> {
        (0..self.sources.len())
            .filter_map(|index| self.source(SourceId(index)))
            .collect()
    }
}

/// Acquisition tuning.
#[derive(Clone, Debug)]
pub struct AcquisitionConfig {
    /// Upper bound on one `retrieve_next` call.
    pub retrieve_timeout: Duration,
    /// Minimum wall time per cycle; `None` runs cycles back to back.
    pub min_cycle_interval: Option<Duration>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            retrieve_timeout: Duration::from_millis(100),
            min_cycle_interval: None,
        }
    }
}

impl AcquisitionConfig {
    /// Pace cycles so each of `source_count` sources is visited `fps` times a second.
    pub fn paced(retrieve_timeout: Duration, fps: u32, source_count: usize) -> Self {
        let cycles_per_sec = (fps as u64).saturating_mul(source_count as u64);
        let min_cycle_interval = (cycles_per_sec > 0)
            .then(|| Duration::from_nanos(1_000_000_000 / cycles_per_sec));
        Self {
            retrieve_timeout,
            min_cycle_interval,
        }
    }
}

/// Result of one acquisition cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Deposited { source: SourceId, evicted: bool },
    /// A frame was retrieved but the write slot was still held by a consumer.
    Discarded { source: SourceId },
    Failed { source: SourceId },
}

impl CycleOutcome {
    pub fn source(&self) -> SourceId {
        match self {
            CycleOutcome::Deposited { source, .. }
            | CycleOutcome::Discarded { source }
            | CycleOutcome::Failed { source } => *source,
        }
    }
}

/// The state a running loop owns: sources, schedule, and the ring it feeds.
pub struct Acquirer {
    sources: Vec<Box<dyn FrameSource>>,
    schedule: RoundRobin,
    buffer: Arc<PairedBuffer>,
    stats: Arc<LoopStats>,
    config: AcquisitionConfig,
    next_sequence: u64,
}

impl Acquirer {
    pub fn new(
        sources: Vec<Box<dyn FrameSource>>,
        buffer: Arc<PairedBuffer>,
        config: AcquisitionConfig,
    ) -> Result<Self> {
        let schedule = RoundRobin::new(sources.len())?;
        let stats = Arc::new(LoopStats::new(sources.len()));
        Ok(Self {
            sources,
            schedule,
            buffer,
            stats,
            config,
            next_sequence: 0,
        })
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Run one acquisition cycle.
    pub fn cycle(&mut self, cancel: &CancelToken) -> CycleOutcome {
        let index = self.schedule.next_index();
        let source_id = SourceId(index);
        let counters = &self.stats.sources[index];
        let source = &mut self.sources[index];

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        counters.attempts.fetch_add(1, Ordering::Relaxed);

        let deposited = source
            .retrieve_next(self.config.retrieve_timeout, cancel)
            .and_then(|frame| {
                let provenance = Provenance::new(source_id, self.next_sequence);
                self.buffer.deposit(&frame, provenance)
            });

        match deposited {
            Ok(Deposit::SlotBusy) => {
                counters.successes.fetch_add(1, Ordering::Relaxed);
                self.stats.discards.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "write slot still held by a consumer: frame from source {} dropped",
                    index
                );
                CycleOutcome::Discarded { source: source_id }
            }
            Ok(deposit) => {
                let evicted = deposit == Deposit::Evicted;
                self.next_sequence += 1;
                counters.successes.fetch_add(1, Ordering::Relaxed);
                if evicted {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    log::debug!("ring full: oldest frame evicted for source {}", index);
                }
                CycleOutcome::Deposited {
                    source: source_id,
                    evicted,
                }
            }
            Err(err) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                if !cancel.is_cancelled() {
                    log::warn!("source {} ({}) produced no frame: {:#}", index, source.name(), err);
                }
                CycleOutcome::Failed { source: source_id }
            }
        }
    }

    /// Cycle until `shutdown` is cancelled, then hand the sources back.
    fn run(mut self, shutdown: CancelToken) -> Vec<Box<dyn FrameSource>> {
        log::info!(
            "acquisition loop started with {} source(s)",
            self.sources.len()
        );
        while !shutdown.is_cancelled() {
            let started = Instant::now();
            self.cycle(&shutdown);
            if let Some(interval) = self.config.min_cycle_interval {
                let elapsed = started.elapsed();
                if elapsed < interval && shutdown.wait_timeout(interval - elapsed) {
                    break;
                }
            }
        }
        log::info!(
            "acquisition loop stopped after {} cycles",
            self.stats.cycles()
        );
        self.sources
    }

    pub fn into_sources(self) -> Vec<Box<dyn FrameSource>> {
        self.sources
    }
}

/// Lifecycle of an acquisition loop. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

/// Owns the acquisition thread.
pub struct AcquisitionLoop {
    state: LoopState,
    pending: Option<Acquirer>,
    stats: Arc<LoopStats>,
    shutdown: CancelToken,
    join: Option<JoinHandle<Vec<Box<dyn FrameSource>>>>,
}

impl AcquisitionLoop {
    pub fn new(acquirer: Acquirer) -> Self {
        Self {
            state: LoopState::Idle,
            stats: acquirer.stats(),
            pending: Some(acquirer),
            shutdown: CancelToken::new(),
            join: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    /// Spawn the acquisition thread. No-op while running; an error once stopped.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LoopState::Running => return Ok(()),
            LoopState::Stopped => bail!("acquisition loop already stopped"),
            LoopState::Idle => {}
        }
        let acquirer = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("acquisition loop has no sources"))?;
        let shutdown = self.shutdown.clone();
        let join = std::thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || acquirer.run(shutdown))
            .map_err(|e| anyhow!("failed to spawn acquisition thread: {}", e))?;
        self.join = Some(join);
        self.state = LoopState::Running;
        Ok(())
    }

    /// Signal the loop to stop, wait for it, and return its sources.
    ///
    /// A retrieval in flight sees the cancellation through its `CancelToken`.
    /// Calling `stop` again returns no sources.
    pub fn stop(&mut self) -> Result<Vec<Box<dyn FrameSource>>> {
        self.state = LoopState::Stopped;
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            return join
                .join()
                .map_err(|_| anyhow!("acquisition thread panicked"));
        }
        Ok(self
            .pending
            .take()
            .map(Acquirer::into_sources)
            .unwrap_or_default())
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.state == LoopState::Running {
            if let Err(err) = self.stop() {
                log::error!("acquisition loop shutdown failed: {}", err);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
