//! Shutdown registry
//!
//! Every component that must be silenced when a provisioning episode ends
//! (advertising, the portal server, the local radio mode) registers one
//! action here. The registry is the single synchronization point that
//! guarantees each action runs at most once, whichever path ends the episode.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Mutex,
};

use log::{debug, error, info, warn};

use crate::{error::ProvisionError, lock};

pub const DEFAULT_CAPACITY: usize = 5;

type ShutdownFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Identity of a registered action, in registration order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(usize);

pub struct ShutdownAction {
    name: String,
    run: ShutdownFn,
}

impl ShutdownAction {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ShutdownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownAction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct Inner {
    actions: Vec<(ActionId, ShutdownAction)>,
    next_id: usize,
    triggered: bool,
}

pub struct ShutdownRegistry {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ShutdownRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                actions: Vec::with_capacity(capacity),
                next_id: 0,
                triggered: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of actions waiting for the sweep
    pub fn len(&self) -> usize {
        lock(&self.inner).actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_triggered(&self) -> bool {
        lock(&self.inner).triggered
    }

    pub fn register(&self, action: ShutdownAction) -> Result<ActionId, ProvisionError> {
        let mut inner = lock(&self.inner);

        if inner.triggered {
            return Err(ProvisionError::RegistryClosed { name: action.name });
        }
        if inner.actions.len() >= self.capacity {
            return Err(ProvisionError::CapacityExceeded {
                capacity: self.capacity,
                name: action.name,
            });
        }

        let id = ActionId(inner.next_id);
        inner.next_id += 1;
        debug!("registry: registered shutdown action {:?} `{}`", id, action.name);
        inner.actions.push((id, action));
        Ok(id)
    }

    /// Run every registered action once, in registration order.
    ///
    /// Only the first call does anything; later calls return 0. Actions run
    /// outside the lock, and a failing or panicking action is logged without
    /// stopping the rest of the sweep.
    pub fn trigger_all(&self) -> usize {
        let actions = {
            let mut inner = lock(&self.inner);
            if inner.triggered {
                debug!("registry: shutdown already triggered");
                return 0;
            }
            inner.triggered = true;
            std::mem::take(&mut inner.actions)
        };

        info!("registry: running {} shutdown action(s)", actions.len());

        let count = actions.len();
        for (id, action) in actions {
            let ShutdownAction { name, run } = action;
            match panic::catch_unwind(AssertUnwindSafe(run)) {
                Ok(Ok(())) => info!("registry: {:?} `{}` stopped", id, name),
                Ok(Err(e)) => warn!("registry: {:?} `{}` failed to stop: {:#}", id, name, e),
                Err(_) => error!("registry: {:?} `{}` panicked while stopping", id, name),
            }
        }
        count
    }
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
