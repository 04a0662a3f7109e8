// ABOUTME: Pre-warmed sandbox pools per session type
// ABOUTME: Acquire pops a ready sandbox and replenishes in the background; maintenance evicts dead entries

use crate::controller::{SandboxController, SandboxOptions};
use crate::settings::PoolSettings;
use crate::types::{SandboxHandle, SessionType};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Default)]
struct PoolState {
    ready: HashMap<SessionType, VecDeque<SandboxHandle>>,
    /// Creations in flight per type, counted toward the target
    pending: HashMap<SessionType, usize>,
    draining: bool,
}

pub struct PoolManager {
    controller: Arc<SandboxController>,
    targets: HashMap<SessionType, usize>,
    state: Mutex<PoolState>,
}

impl PoolManager {
    pub fn new(controller: Arc<SandboxController>, settings: &PoolSettings) -> Self {
        let targets = SessionType::ALL
            .iter()
            .map(|t| (*t, settings.target_for(*t)))
            .collect();

        Self {
            controller,
            targets,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn target(&self, sandbox_type: SessionType) -> usize {
        self.targets.get(&sandbox_type).copied().unwrap_or(0)
    }

    /// Ready sandboxes currently pooled for `sandbox_type`
    pub fn size(&self, sandbox_type: SessionType) -> usize {
        self.state()
            .ready
            .get(&sandbox_type)
            .map_or(0, VecDeque::len)
    }

    /// Fill every pool to its target, waiting for all creations
    pub async fn initialize(&self) {
        for sandbox_type in SessionType::ALL {
            self.fill(sandbox_type).await;
            info!(
                "Pool for {} initialized with {}/{} sandboxes",
                sandbox_type,
                self.size(sandbox_type),
                self.target(sandbox_type)
            );
        }
    }

    /// Take a ready sandbox if one is pooled. Replenishment runs in the background
    /// and is never awaited here, so a hit costs no runtime call.
    pub fn acquire(self: &Arc<Self>, sandbox_type: SessionType) -> Option<SandboxHandle> {
        let handle = {
            let mut state = self.state();
            if state.draining {
                return None;
            }
            state
                .ready
                .get_mut(&sandbox_type)
                .and_then(VecDeque::pop_front)
        };

        match &handle {
            Some(h) => debug!(sandbox_id = %h.id, "Pool hit for {}", sandbox_type),
            None => debug!("Pool miss for {}", sandbox_type),
        }

        if self.target(sandbox_type) > 0 {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.fill(sandbox_type).await;
            });
        }

        handle
    }

    /// Evict sandboxes that stopped running, then top every pool back up
    pub async fn maintain(&self) {
        let snapshot: Vec<SandboxHandle> = {
            let state = self.state();
            state.ready.values().flatten().cloned().collect()
        };

        let mut dead = Vec::new();
        for handle in snapshot {
            if !self.controller.is_running(&handle).await {
                dead.push(handle);
            }
        }

        if !dead.is_empty() {
            // Only entries still queued are evicted; one acquired during the
            // liveness checks belongs to its session now
            let evicted: Vec<SandboxHandle> = {
                let mut state = self.state();
                let mut evicted = Vec::new();
                for queue in state.ready.values_mut() {
                    let (gone, kept): (VecDeque<_>, VecDeque<_>) = queue
                        .drain(..)
                        .partition(|h| dead.iter().any(|d| d.id == h.id));
                    *queue = kept;
                    evicted.extend(gone);
                }
                evicted
            };

            for handle in &evicted {
                warn!(sandbox_id = %handle.id, "Evicting dead pooled sandbox");
                if let Err(e) = self.controller.destroy_sandbox(handle).await {
                    warn!(sandbox_id = %handle.id, "Failed to remove dead sandbox: {}", e);
                }
            }
        }

        for sandbox_type in SessionType::ALL {
            self.fill(sandbox_type).await;
        }
    }

    /// Run `maintain` every `interval` until the task is aborted
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                pool.maintain().await;
            }
        })
    }

    /// Stop replenishing and destroy every pooled sandbox, returning how many were destroyed
    pub async fn drain(&self) -> usize {
        let handles: Vec<SandboxHandle> = {
            let mut state = self.state();
            state.draining = true;
            state.ready.drain().flat_map(|(_, queue)| queue).collect()
        };

        let count = handles.len();
        for handle in handles {
            if let Err(e) = self.controller.destroy_sandbox(&handle).await {
                warn!(sandbox_id = %handle.id, "Failed to destroy pooled sandbox: {}", e);
            }
        }

        info!("Drained {} pooled sandboxes", count);
        count
    }

    /// Create sandboxes until ready plus in-flight reaches the target
    async fn fill(&self, sandbox_type: SessionType) {
        let target = self.target(sandbox_type);
        let deficit = {
            let mut state = self.state();
            if state.draining {
                return;
            }
            let ready = state.ready.get(&sandbox_type).map_or(0, VecDeque::len);
            let pending = state.pending.entry(sandbox_type).or_insert(0);
            let deficit = target.saturating_sub(ready + *pending);
            *pending += deficit;
            deficit
        };

        for _ in 0..deficit {
            let created = self
                .controller
                .create_sandbox(sandbox_type, SandboxOptions::default())
                .await;

            let orphan = {
                let mut state = self.state();
                if let Some(pending) = state.pending.get_mut(&sandbox_type) {
                    *pending = pending.saturating_sub(1);
                }
                match created {
                    Ok(handle) if state.draining => Some(handle),
                    Ok(handle) => {
                        debug!(sandbox_id = %handle.id, "Added {} sandbox to pool", sandbox_type);
                        state.ready.entry(sandbox_type).or_default().push_back(handle);
                        None
                    }
                    Err(e) => {
                        warn!("Failed to replenish {} pool: {}", sandbox_type, e);
                        None
                    }
                }
            };

            // Created while draining; nobody will take it
            if let Some(handle) = orphan {
                if let Err(e) = self.controller.destroy_sandbox(&handle).await {
                    warn!(sandbox_id = %handle.id, "Failed to destroy sandbox: {}", e);
                }
            }
        }
    }
}
