//! Incremental classifier. Owns the in-memory classification state of every
//! test and serializes recomputation per test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::window::{classify, WindowStats};
use crate::classify::{quarantine, ClassificationState, ClassifyError, TransitionEvent, TransitionLog};
use crate::config::ClassifierConfig;
use crate::storage::{HistoryStore, StoreError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One async mutex per key. Work on different keys never contends.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn remove(&self, key: &str) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }
}

pub struct FlakeClassifier {
    store: HistoryStore,
    config: ClassifierConfig,
    transitions: TransitionLog,
    locks: KeyedLocks,
    states: RwLock<HashMap<String, ClassificationState>>,
    events: broadcast::Sender<TransitionEvent>,
}

impl FlakeClassifier {
    pub fn new(store: HistoryStore, config: ClassifierConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transitions: TransitionLog::new(store.pool().clone()),
            store,
            config,
            locks: KeyedLocks::default(),
            states: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn transitions(&self) -> &TransitionLog {
        &self.transitions
    }

    /// Receive every transition emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Recompute one test's state from its current window. Returns the
    /// transition, if the classification changed. On `InsufficientHistory`
    /// the previous state is left untouched.
    pub async fn recompute(&self, identity_id: &str) -> Result<Option<TransitionEvent>, ClassifyError> {
        let _guard = self.locks.lock(identity_id).await;

        let next = self.compute(identity_id).await?;
        let previous = self.state(identity_id);

        if let Some(prev) = &previous {
            if prev.last_seq > next.last_seq {
                debug!(test = %identity_id, current = prev.last_seq, computed = next.last_seq, "stale recompute discarded");
                return Ok(None);
            }
        }

        let event = match &previous {
            Some(prev) if prev.classification != next.classification => Some(TransitionEvent {
                id: Uuid::new_v4(),
                identity_id: next.identity_id.clone(),
                title: next.title.clone(),
                from: prev.classification,
                to: next.classification,
                flake_score: next.flake_score,
                history_seq: next.last_seq,
                at: next.updated_at,
            }),
            _ => None,
        };

        if let Some(event) = &event {
            let log = self.transitions.clone();
            let record = event.clone();
            tokio::task::spawn_blocking(move || log.record(&record))
                .await
                .map_err(StoreError::from)??;

            info!(
                test = %event.title,
                from = %event.from,
                to = %event.to,
                flake_score = event.flake_score,
                "classification changed"
            );
            // No subscribers is fine.
            let _ = self.events.send(event.clone());
        }

        self.install(next);
        Ok(event)
    }

    /// Rebuild every test's state from stored history. Emits no transitions.
    pub async fn rebuild(&self) -> Result<usize, ClassifyError> {
        let store = self.store.clone();
        let ids = tokio::task::spawn_blocking(move || store.identity_ids())
            .await
            .map_err(StoreError::from)??;

        let mut rebuilt = 0;
        for id in ids {
            let _guard = self.locks.lock(&id).await;
            match self.compute(&id).await {
                Ok(state) => {
                    self.install(state);
                    rebuilt += 1;
                }
                Err(ClassifyError::InsufficientHistory { .. }) => {
                    debug!(test = %id, "no classifiable history during rebuild");
                }
                Err(e) => return Err(e),
            }
        }
        info!(tests = rebuilt, "classification state rebuilt");
        Ok(rebuilt)
    }

    pub fn state(&self, identity_id: &str) -> Option<ClassificationState> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.get(identity_id).cloned()
    }

    /// All states, highest flake score first.
    pub fn snapshot(&self) -> Vec<ClassificationState> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ClassificationState> = states.values().cloned().collect();
        all.sort_by(|a, b| {
            b.flake_score
                .total_cmp(&a.flake_score)
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });
        all
    }

    /// Drop the state of retired tests.
    pub fn forget(&self, ids: &[String]) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            states.remove(id);
            self.locks.remove(id);
        }
    }

    /// Flip the quarantine overlay on a live state.
    pub fn set_quarantined(&self, identity_id: &str, quarantined: bool) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(identity_id) {
            state.quarantined = quarantined;
        }
    }

    fn install(&self, state: ClassificationState) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        match states.get(&state.identity_id) {
            Some(current) if current.last_seq > state.last_seq => {
                warn!(test = %state.identity_id, "refusing to install an older state");
            }
            _ => {
                states.insert(state.identity_id.clone(), state);
            }
        }
    }

    async fn compute(&self, identity_id: &str) -> Result<ClassificationState, ClassifyError> {
        let store = self.store.clone();
        let config = self.config.clone();
        let id = identity_id.to_string();
        tokio::task::spawn_blocking(move || compute_state(&store, &config, &id))
            .await
            .map_err(StoreError::from)?
    }
}

fn compute_state(
    store: &HistoryStore,
    config: &ClassifierConfig,
    identity_id: &str,
) -> Result<ClassificationState, ClassifyError> {
    let insufficient = || ClassifyError::InsufficientHistory {
        identity_id: identity_id.to_string(),
    };

    let Some(identity) = store.identity(identity_id)? else {
        return Err(insufficient());
    };
    let window = store.classification_window(identity_id, config.window_size)?;
    let stats = WindowStats::compute(identity_id, &window, config.score_decay)?;
    let newest = window.first().ok_or_else(insufficient)?;

    Ok(ClassificationState {
        identity_id: identity.id,
        title: identity.title,
        classification: classify(&stats, config),
        flake_score: stats.flake_score,
        flake_rate: stats.flake_rate,
        fail_rate: stats.fail_rate,
        consecutive_fail_streak: stats.consecutive_fail_streak,
        window_size: stats.size,
        mean_duration_ms: stats.mean_duration_ms,
        last_status: newest.status,
        last_error_signature: newest.error_signature.clone(),
        last_seq: newest.seq,
        updated_at: Utc::now(),
        quarantined: quarantine::contains(store.pool(), identity_id)?,
    })
}
