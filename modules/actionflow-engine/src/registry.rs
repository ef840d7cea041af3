//! Handler registry: ordered filter and on-handler lists.
//!
//! Registration order is dispatch order within a kind. Matching returns a
//! snapshot, so handlers registering or unregistering during a dispatch never
//! disturb the iteration in progress.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use actionflow_events::{Action, Pattern, PatternError};

use crate::concurrency::HandlerOptions;
use crate::handler::{FilterFn, HandlerId, HandlerKind, OnFn};
use crate::lock;
use crate::scope::ScopeId;

pub(crate) enum Callback {
    Filter(FilterFn),
    On(OnFn),
}

impl Callback {
    fn kind(&self) -> HandlerKind {
        match self {
            Self::Filter(_) => HandlerKind::Filter,
            Self::On(_) => HandlerKind::On,
        }
    }
}

pub(crate) struct Registration {
    pub id: HandlerId,
    pub pattern: Pattern,
    pub options: HandlerOptions,
    pub owner: Option<ScopeId>,
    pub callback: Callback,
    active: AtomicBool,
}

impl Registration {
    pub fn kind(&self) -> HandlerKind {
        self.callback.kind()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    filters: Mutex<Vec<Arc<Registration>>>,
    ons: Mutex<Vec<Arc<Registration>>>,
}

impl Registry {
    /// `prepare` runs after the id is assigned and before the handler becomes
    /// matchable.
    pub fn register(
        &self,
        pattern: Pattern,
        callback: Callback,
        options: HandlerOptions,
        owner: Option<ScopeId>,
        prepare: impl FnOnce(HandlerId, HandlerKind),
    ) -> Result<Arc<Registration>, PatternError> {
        pattern.validate()?;

        let id = self.reserve_id();
        let registration = Arc::new(Registration {
            id,
            pattern,
            options,
            owner,
            callback,
            active: AtomicBool::new(true),
        });

        prepare(id, registration.kind());
        lock(self.list(registration.kind())).push(registration.clone());
        Ok(registration)
    }

    /// Remove a handler. `None` when it was never registered or already gone.
    pub fn unregister(&self, id: HandlerId) -> Option<Arc<Registration>> {
        for kind in [HandlerKind::Filter, HandlerKind::On] {
            let mut list = lock(self.list(kind));
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                let registration = list.remove(pos);
                registration.active.store(false, Ordering::Release);
                return Some(registration);
            }
        }
        None
    }

    /// Remove every handler registered by the scope, filters first.
    pub fn unregister_by_owner(&self, owner: ScopeId) -> Vec<Arc<Registration>> {
        let mut removed = Vec::new();
        for kind in [HandlerKind::Filter, HandlerKind::On] {
            lock(self.list(kind)).retain(|r| {
                if r.owner == Some(owner) {
                    r.active.store(false, Ordering::Release);
                    removed.push(r.clone());
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Handlers of `kind` matching the action, in registration order.
    /// Predicates run after the list lock is released.
    pub fn matching(&self, kind: HandlerKind, action: &Action) -> Vec<Arc<Registration>> {
        let snapshot: Vec<_> = lock(self.list(kind)).clone();
        snapshot
            .into_iter()
            .filter(|r| r.pattern.matches(action))
            .collect()
    }

    /// Reserve an id for an execution source that is not a registered
    /// handler.
    pub fn reserve_id(&self) -> HandlerId {
        HandlerId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        [HandlerKind::Filter, HandlerKind::On]
            .into_iter()
            .any(|kind| lock(self.list(kind)).iter().any(|r| r.id == id))
    }

    pub fn len(&self, kind: HandlerKind) -> usize {
        lock(self.list(kind)).len()
    }

    fn list(&self, kind: HandlerKind) -> &Mutex<Vec<Arc<Registration>>> {
        match kind {
            HandlerKind::Filter => &self.filters,
            HandlerKind::On => &self.ons,
        }
    }
}
