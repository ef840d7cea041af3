//! In-memory action recorder.
//!
//! Subscribes to an agent and keeps every published action with its
//! observation order and timestamp. Useful for tests, debugging and demos;
//! nothing is persisted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use actionflow_events::Action;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::Agent;
use crate::bus::Subscription;
use crate::lock;

#[derive(Debug, Clone, Serialize)]
pub struct RecordedAction {
    /// 1-based position in the order this recorder observed actions.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub action: Action,
}

pub struct ActionRecorder {
    records: Arc<Mutex<Vec<RecordedAction>>>,
    subscription: Subscription,
}

impl ActionRecorder {
    pub fn attach(agent: &Agent) -> Self {
        let records: Arc<Mutex<Vec<RecordedAction>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let observed = AtomicU64::new(0);
        let subscription = agent.subscribe(move |action| {
            let mut records = lock(&sink);
            let seq = observed.fetch_add(1, Ordering::Relaxed) + 1;
            records.push(RecordedAction {
                seq,
                ts: Utc::now(),
                action: action.clone(),
            });
        });
        Self {
            records,
            subscription,
        }
    }

    pub fn records(&self) -> Vec<RecordedAction> {
        lock(&self.records).clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        lock(&self.records).iter().map(|r| r.action.clone()).collect()
    }

    /// Action types in observation order.
    pub fn types(&self) -> Vec<String> {
        lock(&self.records)
            .iter()
            .map(|r| r.action.action_type().to_string())
            .collect()
    }

    pub fn count_of(&self, action_type: &str) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| r.action.action_type() == action_type)
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop recorded actions. Sequence numbers keep counting.
    pub fn clear(&self) {
        lock(&self.records).clear();
    }

    /// Stop recording. Already recorded actions stay readable.
    pub fn detach(&self) -> bool {
        self.subscription.unsubscribe()
    }
}
