//! Contention workload and its report.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use permitgate::{
    CancellationToken, PermitConfig, PermitError, PermitManager, SlotSnapshot, StateKey,
};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct Options {
    pub readers: usize,
    pub writers: usize,
    pub cycles: usize,
    pub max_permits: usize,
    pub timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            readers: 8,
            writers: 2,
            cycles: 50,
            max_permits: 4,
            timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub readers: usize,
    pub writers: usize,
    pub cycles: usize,
    pub max_permits: usize,
    pub shared_grants: usize,
    pub exclusive_grants: usize,
    pub acquire_timeouts: usize,
    pub deactivate_timeouts: usize,
    pub peak_holders: usize,
    /// Longest catalog a reader observed.
    pub largest_catalog: usize,
    pub violations: usize,
    pub elapsed_ms: u128,
    pub slot: SlotSnapshot,
}

/// Instance published under the stress key. Writers append under an
/// exclusive permit; readers only look.
struct Catalog {
    version: usize,
    entries: Mutex<Vec<usize>>,
}

impl Catalog {
    fn new(version: usize) -> Self {
        Self {
            version,
            entries: Mutex::new(Vec::new()),
        }
    }
}

/// Shared observations checked against the permit contract.
#[derive(Default)]
struct Probe {
    holders: AtomicUsize,
    peak_holders: AtomicUsize,
    largest_catalog: AtomicUsize,
    exclusive_held: AtomicBool,
    shared_grants: AtomicUsize,
    exclusive_grants: AtomicUsize,
    acquire_timeouts: AtomicUsize,
    violations: AtomicUsize,
}

impl Probe {
    fn enter(&self, exclusive: bool, max_permits: usize) {
        let holders = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_holders.fetch_max(holders, Ordering::SeqCst);

        let violated = if exclusive {
            self.exclusive_held.store(true, Ordering::SeqCst);
            holders != 1
        } else {
            holders > max_permits || self.exclusive_held.load(Ordering::SeqCst)
        };
        if violated {
            self.violations.fetch_add(1, Ordering::SeqCst);
            tracing::error!(holders, exclusive, "Permit contract violated");
        }
    }

    fn exit(&self, exclusive: bool) {
        if exclusive {
            self.exclusive_held.store(false, Ordering::SeqCst);
        }
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

pub async fn run(options: Options) -> anyhow::Result<Report> {
    let started = Instant::now();
    let manager = Arc::new(PermitManager::with_config(PermitConfig::from_env()));
    let key: StateKey<Catalog> = StateKey::with_max_permits("catalog", options.max_permits)?;
    let probe = Arc::new(Probe::default());
    let stop = CancellationToken::new();

    manager.activate(&key, Catalog::new(1))?;

    let mut workers = Vec::with_capacity(options.readers + options.writers);
    for exclusive in std::iter::repeat_n(false, options.readers)
        .chain(std::iter::repeat_n(true, options.writers))
    {
        workers.push(tokio::spawn(worker(
            Arc::clone(&manager),
            key.clone(),
            Arc::clone(&probe),
            stop.clone(),
            exclusive,
            options.timeout,
        )));
    }

    let mut deactivate_timeouts = 0;
    for cycle in 0..options.cycles {
        tokio::time::sleep(Duration::from_millis(2)).await;

        match manager.deactivate_timeout(&key, options.timeout).await {
            Ok(()) => {}
            Err(PermitError::Timeout { .. }) => {
                deactivate_timeouts += 1;
                tracing::warn!(cycle, "Deactivation timed out; waiting without bound");
                manager.deactivate(&key).await?;
            }
            Err(e) => return Err(e).context("deactivation failed"),
        }
        manager.activate(&key, Catalog::new(cycle + 2))?;
    }

    stop.cancel();
    for result in futures::future::join_all(workers).await {
        result.context("worker panicked")??;
    }

    let report = Report {
        readers: options.readers,
        writers: options.writers,
        cycles: options.cycles,
        max_permits: options.max_permits,
        shared_grants: probe.shared_grants.load(Ordering::SeqCst),
        exclusive_grants: probe.exclusive_grants.load(Ordering::SeqCst),
        acquire_timeouts: probe.acquire_timeouts.load(Ordering::SeqCst),
        deactivate_timeouts,
        peak_holders: probe.peak_holders.load(Ordering::SeqCst),
        largest_catalog: probe.largest_catalog.load(Ordering::SeqCst),
        violations: probe.violations.load(Ordering::SeqCst),
        elapsed_ms: started.elapsed().as_millis(),
        slot: manager.snapshot(&key),
    };

    if report.violations > 0 {
        bail!("{} permit contract violations observed", report.violations);
    }
    Ok(report)
}

async fn worker(
    manager: Arc<PermitManager>,
    key: StateKey<Catalog>,
    probe: Arc<Probe>,
    stop: CancellationToken,
    exclusive: bool,
    timeout: Duration,
) -> anyhow::Result<()> {
    loop {
        let acquired = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            acquired = manager.acquire_permit_timeout(&key, exclusive, timeout) => acquired,
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(PermitError::Timeout { .. }) => {
                probe.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(e) => return Err(e).context("acquire failed"),
        };

        probe.enter(exclusive, key.max_permits());
        if exclusive {
            probe.exclusive_grants.fetch_add(1, Ordering::Relaxed);
            permit
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(permit.version);
        } else {
            probe.shared_grants.fetch_add(1, Ordering::Relaxed);
            let len = permit
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len();
            probe.largest_catalog.fetch_max(len, Ordering::Relaxed);
        }
        tokio::task::yield_now().await;
        probe.exit(exclusive);

        permit.release()?;
    }
}
