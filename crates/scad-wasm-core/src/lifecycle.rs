//! Instance lifecycle tracking.
//!
//! [`InstanceLifecycleManager`] keeps a non-owning registry of kernel
//! instances and sweeps it periodically:
//!
//! - records idle longer than the idle timeout are evicted and reported to
//!   the eviction callback (the owner decides what eviction means)
//! - records whose instance has already been dropped are removed silently
//! - under memory pressure, scratch files of every live instance are removed
//!   and the GC hint callback is invoked
//!
//! Memory accounting is approximate: the sum of file sizes in each
//! instance's scratch directory, or a host-provided [`MemoryProbe`].

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::instance::WasmInstance;
use crate::render::is_scratch_file;
use crate::vfs::join_guest_path;
use scad_wasm_common::LifecycleConfig;

/// Called with the id of each record evicted for idleness.
pub type EvictionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Best-effort request to the host to reclaim memory.
pub type GcHint = Arc<dyn Fn() + Send + Sync>;

/// Host memory usage reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    /// Bytes in use.
    pub used_bytes: u64,
    /// Bytes available in total.
    pub limit_bytes: u64,
}

/// Source of real memory usage, when the host can provide one.
pub trait MemoryProbe: Send + Sync {
    /// Current usage, or `None` if unavailable right now.
    fn sample(&self) -> Option<MemorySample>;
}

struct InstanceRecord {
    instance: Weak<dyn WasmInstance>,
    created_at: Instant,
    last_used: Instant,
}

/// Usage of a single registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUsage {
    pub id: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub scratch_bytes: u64,
}

/// Approximate memory usage across registered instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub per_instance: Vec<InstanceUsage>,
    pub total_estimate: u64,
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids evicted for idleness.
    pub evicted: Vec<String>,
    /// Ids whose instance no longer existed.
    pub dropped: Vec<String>,
    /// Memory pressure observed, in percent of the limit.
    pub pressure_percent: u64,
    /// Scratch files removed by forced cleanup.
    pub cleaned_files: usize,
    /// Whether the GC hint was invoked.
    pub gc_hinted: bool,
}

/// Registry of kernel instances with periodic sweeping.
pub struct InstanceLifecycleManager {
    records: DashMap<String, InstanceRecord>,
    config: LifecycleConfig,
    scratch_dir: String,
    on_evict: Option<EvictionCallback>,
    gc_hint: Option<GcHint>,
    probe: Option<Arc<dyn MemoryProbe>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceLifecycleManager {
    /// Create a manager inspecting `scratch_dir` inside each instance.
    pub fn new(config: LifecycleConfig, scratch_dir: impl Into<String>) -> Self {
        Self {
            records: DashMap::new(),
            config,
            scratch_dir: scratch_dir.into(),
            on_evict: None,
            gc_hint: None,
            probe: None,
            sweeper: Mutex::new(None),
        }
    }

    /// Set the eviction callback.
    #[must_use]
    pub fn with_eviction_callback(mut self, callback: EvictionCallback) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Set the GC hint callback.
    #[must_use]
    pub fn with_gc_hint(mut self, hint: GcHint) -> Self {
        self.gc_hint = Some(hint);
        self
    }

    /// Use a host memory probe instead of the scratch-file estimate.
    #[must_use]
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Register (or replace) an instance under `id`.
    pub fn register_instance(&self, id: impl Into<String>, instance: &Arc<dyn WasmInstance>) {
        let id = id.into();
        let now = Instant::now();
        debug!(instance_id = %id, "Instance registered");
        self.records.insert(
            id,
            InstanceRecord {
                instance: Arc::downgrade(instance),
                created_at: now,
                last_used: now,
            },
        );
    }

    /// Remove an instance. Returns `false` if it was not registered.
    pub fn unregister_instance(&self, id: &str) -> bool {
        let removed = self.records.remove(id).is_some();
        if removed {
            debug!(instance_id = %id, "Instance unregistered");
        }
        removed
    }

    /// Mark an instance as used now. Returns `false` if it is not registered.
    pub fn touch_instance(&self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Whether `id` is registered.
    pub fn is_registered(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.records.len()
    }

    /// Approximate usage of every live registered instance.
    pub fn get_memory_stats(&self) -> MemoryStats {
        let now = Instant::now();
        let mut per_instance: Vec<InstanceUsage> = self
            .records
            .iter()
            .filter_map(|entry| {
                let instance = entry.instance.upgrade()?;
                Some(InstanceUsage {
                    id: entry.key().clone(),
                    age_ms: millis(now.saturating_duration_since(entry.created_at)),
                    idle_ms: millis(now.saturating_duration_since(entry.last_used)),
                    scratch_bytes: self.scratch_bytes(instance.as_ref()),
                })
            })
            .collect();
        per_instance.sort_by(|a, b| a.id.cmp(&b.id));

        let total_estimate = per_instance.iter().map(|u| u.scratch_bytes).sum();
        MemoryStats {
            per_instance,
            total_estimate,
        }
    }

    fn scratch_bytes(&self, instance: &dyn WasmInstance) -> u64 {
        let fs = instance.fs();
        fs.list_dir(&self.scratch_dir)
            .unwrap_or_default()
            .iter()
            .filter_map(|name| fs.file_size(&join_guest_path(&self.scratch_dir, name)).ok())
            .sum()
    }

    /// Current memory pressure in percent.
    pub fn memory_pressure(&self) -> u64 {
        let sample = self
            .probe
            .as_ref()
            .and_then(|probe| probe.sample())
            .unwrap_or_else(|| MemorySample {
                used_bytes: self.get_memory_stats().total_estimate,
                limit_bytes: self.config.memory_budget_bytes(),
            });

        if sample.limit_bytes == 0 {
            return 0;
        }
        let percent = u128::from(sample.used_bytes) * 100 / u128::from(sample.limit_bytes);
        u64::try_from(percent).unwrap_or(u64::MAX)
    }

    /// Remove scratch files from every live instance. Returns the number removed.
    pub fn force_cleanup(&self) -> usize {
        let instances: Vec<Arc<dyn WasmInstance>> = self
            .records
            .iter()
            .filter_map(|entry| entry.instance.upgrade())
            .collect();

        let mut removed = 0;
        for instance in instances {
            let fs = instance.fs();
            for name in fs.list_dir(&self.scratch_dir).unwrap_or_default() {
                if !is_scratch_file(&name) {
                    continue;
                }
                let path = join_guest_path(&self.scratch_dir, &name);
                match fs.unlink(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => debug!(path = %path, error = %e, "Scratch file not removed"),
                }
            }
        }
        removed
    }

    /// Run one sweep.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut report = SweepReport::default();

        let mut idle = Vec::new();
        self.records.retain(|id, record| {
            if record.instance.strong_count() == 0 {
                report.dropped.push(id.clone());
                false
            } else if now.saturating_duration_since(record.last_used) > idle_timeout {
                idle.push(id.clone());
                false
            } else {
                true
            }
        });

        // Callbacks run after `retain` releases the shard locks.
        for id in &idle {
            info!(instance_id = %id, idle_timeout_ms = self.config.idle_timeout_ms, "Evicting idle instance");
            if let Some(callback) = &self.on_evict {
                callback(id);
            }
        }
        report.evicted = idle;

        report.pressure_percent = self.memory_pressure();
        if report.pressure_percent > u64::from(self.config.memory_pressure_percent) {
            warn!(
                pressure_percent = report.pressure_percent,
                threshold_percent = self.config.memory_pressure_percent,
                "Memory pressure, cleaning scratch files"
            );
            report.cleaned_files = self.force_cleanup();
            if let Some(hint) = &self.gc_hint {
                hint();
                report.gc_hinted = true;
            }
        }

        debug!(
            evicted = report.evicted.len(),
            dropped = report.dropped.len(),
            remaining = self.records.len(),
            "Sweep finished"
        );
        report
    }

    /// Start the periodic sweep. Must be called within a tokio runtime.
    ///
    /// The loop holds only a weak reference and ends when the manager is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let period = self.config.sweep_interval();
        let manager = Arc::downgrade(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep();
            }
        }));
        info!(interval_ms = self.config.sweep_interval_ms, "Lifecycle sweep started");
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Lifecycle sweep stopped");
        }
    }

    /// Whether the periodic sweep is running.
    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl Drop for InstanceLifecycleManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for InstanceLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLifecycleManager")
            .field("instances", &self.records.len())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
