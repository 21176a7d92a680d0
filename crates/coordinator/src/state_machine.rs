//! A small observable state holder shared by the query, stage and
//! distributed scheduler state machines.
//!
//! Transitions are atomic with respect to each other. Listeners are never
//! run on the thread performing the transition: each notification is spawned
//! onto the notification executor, so listeners may freely call back into
//! the state machine that notified them. No ordering between listeners is
//! guaranteed.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;

pub type StateChangeListener<T> = Arc<dyn Fn(T) + Send + Sync>;

pub trait State: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn is_done(&self) -> bool;
}

pub struct StateMachine<T: State> {
    name: String,
    executor: Handle,
    state: watch::Sender<T>,
    listeners: Mutex<Vec<StateChangeListener<T>>>,
}

impl<T: State> StateMachine<T> {
    pub fn new(name: impl Into<String>, executor: Handle, initial_state: T) -> Self {
        let (state, _) = watch::channel(initial_state);
        Self {
            name: name.into(),
            executor,
            state,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> T {
        *self.state.borrow()
    }

    /// Moves to `new_state` unless the current state is terminal, equal to
    /// `new_state`, or rejected by `predicate`. Returns whether the state changed.
    pub fn set_if(&self, new_state: T, predicate: impl FnOnce(T) -> bool) -> bool {
        let mut listeners = self.listeners.lock();
        let changed = self.state.send_if_modified(|current| {
            if current.is_done() || *current == new_state || !predicate(*current) {
                return false;
            }
            *current = new_state;
            true
        });
        if !changed {
            return false;
        }
        tracing::trace!("{} is {:?}", self.name, new_state);
        self.fire(&listeners, new_state);
        if new_state.is_done() {
            // no further transitions can happen
            listeners.clear();
        }
        true
    }

    pub fn set(&self, new_state: T) -> bool {
        self.set_if(new_state, |_| true)
    }

    /// Registers a listener for every subsequent transition. A listener added
    /// after the state became terminal is notified once with that state.
    pub fn add_listener(&self, listener: impl Fn(T) + Send + Sync + 'static) {
        let listener: StateChangeListener<T> = Arc::new(listener);
        let mut listeners = self.listeners.lock();
        let current = self.get();
        if current.is_done() {
            self.fire(std::slice::from_ref(&listener), current);
            return;
        }
        listeners.push(listener);
    }

    /// Resolves with the first observed state matching `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(T) -> bool) -> T {
        let mut receiver = self.state.subscribe();
        let result = match receiver.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => self.get(),
        };
        result
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.state.subscribe()
    }

    fn fire(&self, listeners: &[StateChangeListener<T>], state: T) {
        for listener in listeners {
            let listener = listener.clone();
            self.executor.spawn(async move { listener(state) });
        }
    }
}

impl<T: State> fmt::Debug for StateMachine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("state", &self.get())
            .finish()
    }
}
