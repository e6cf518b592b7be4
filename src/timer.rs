//! Provisioning countdown
//!
//! The timer is the only thing bounding how long local configuration mode
//! stays radio-on. It is armed once per episode; firing and cancelling race
//! on the same lock so exactly one of them wins.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::{error::ProvisionError, lock, registry::ShutdownRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    Fired,
    Cancelled,
}

pub struct ProvisioningTimer {
    registry: Arc<ShutdownRegistry>,
    state: Arc<Mutex<TimerState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProvisioningTimer {
    pub fn new(registry: Arc<ShutdownRegistry>) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(TimerState::Idle)),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TimerState {
        *lock(&self.state)
    }

    /// Start the countdown. Must be called from within a tokio runtime.
    ///
    /// On expiry `on_fired` runs as soon as the timer has won against
    /// `cancel`, then the registry is swept, then `on_expired` runs.
    pub fn arm<P, F>(
        &self,
        duration: Duration,
        on_fired: P,
        on_expired: F,
    ) -> Result<(), ProvisionError>
    where
        P: FnOnce() + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock(&self.state);
            if *state != TimerState::Idle {
                error!("timer: arm called in state {:?}", *state);
                return Err(ProvisionError::AlreadyArmed);
            }
            *state = TimerState::Armed;
        }

        let minutes = duration.as_secs() / 60;
        info!(
            "timer: config mode will time out in {} {} ({}s)",
            minutes,
            if minutes == 1 { "minute" } else { "minutes" },
            duration.as_secs()
        );

        let state = self.state.clone();
        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            {
                let mut state = lock(&state);
                if *state != TimerState::Armed {
                    return;
                }
                *state = TimerState::Fired;
            }
            on_fired();

            warn!("timer: provisioning window elapsed, shutting down config mode");
            registry.trigger_all();
            on_expired();
        });

        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Stop the countdown. Returns true when this call won against expiry;
    /// false means the timer already fired, was already cancelled, or was
    /// never armed.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            TimerState::Armed => {
                *state = TimerState::Cancelled;
                drop(state);
                if let Some(task) = lock(&self.task).take() {
                    task.abort();
                }
                info!("timer: provisioning timer stopped");
                true
            }
            other => {
                debug!("timer: cancel ignored in state {:?}", other);
                false
            }
        }
    }
}

impl Drop for ProvisioningTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ShutdownAction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with_counter() -> (Arc<ShutdownRegistry>, Arc<AtomicUsize>) {
        let registry = Arc::new(ShutdownRegistry::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let action_counter = counter.clone();
        registry
            .register(ShutdownAction::new("radio", move || {
                action_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        (registry, counter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_window() {
        let (registry, actions) = registry_with_counter();
        let expired = Arc::new(AtomicUsize::new(0));
        let timer = ProvisioningTimer::new(registry.clone());

        let expired_clone = expired.clone();
        timer
            .arm(Duration::from_secs(300), || {}, move || {
                expired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(timer.state(), TimerState::Armed);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(actions.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(timer.state(), TimerState::Fired);
        assert_eq!(actions.load(Ordering::SeqCst), 1);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(registry.is_triggered());

        // Cancelling after firing is a no-op, not an error
        assert!(!timer.cancel());
        assert_eq!(timer.state(), TimerState::Fired);
        assert_eq!(actions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_expiry() {
        let (registry, actions) = registry_with_counter();
        let timer = ProvisioningTimer::new(registry.clone());
        timer.arm(Duration::from_secs(300), || {}, || {}).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(timer.state(), TimerState::Cancelled);

        tokio::time::sleep(Duration::from_secs(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(actions.load(Ordering::SeqCst), 0);
        assert!(!registry.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_twice_fails() {
        let (registry, _) = registry_with_counter();
        let timer = ProvisioningTimer::new(registry);
        timer.arm(Duration::from_secs(1), || {}, || {}).unwrap();
        assert!(matches!(
            timer.arm(Duration::from_secs(1), || {}, || {}),
            Err(ProvisionError::AlreadyArmed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_countdown() {
        let (registry, actions) = registry_with_counter();
        {
            let timer = ProvisioningTimer::new(registry.clone());
            timer.arm(Duration::from_secs(5), || {}, || {}).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(actions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_fired_runs_before_sweep() {
        let registry = Arc::new(ShutdownRegistry::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let action_order = order.clone();
        registry
            .register(ShutdownAction::new("radio", move || {
                action_order.lock().unwrap().push("sweep");
                Ok(())
            }))
            .unwrap();

        let timer = ProvisioningTimer::new(registry);
        let fired_order = order.clone();
        let expired_order = order.clone();
        timer
            .arm(
                Duration::from_secs(1),
                move || fired_order.lock().unwrap().push("fired"),
                move || expired_order.lock().unwrap().push("expired"),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(*order.lock().unwrap(), vec!["fired", "sweep", "expired"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_races_expiry() {
        for _ in 0..100 {
            let (registry, actions) = registry_with_counter();
            let expired = Arc::new(AtomicUsize::new(0));
            let timer = Arc::new(ProvisioningTimer::new(registry));

            let expired_clone = expired.clone();
            timer
                .arm(Duration::from_millis(1), || {}, move || {
                    expired_clone.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();

            let cancelling = timer.clone();
            let cancelled = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                cancelling.cancel()
            })
            .await
            .unwrap();

            // Let a winning expiry finish its sweep
            tokio::time::sleep(Duration::from_millis(20)).await;

            if cancelled {
                assert_eq!(timer.state(), TimerState::Cancelled);
                assert_eq!(actions.load(Ordering::SeqCst), 0);
                assert_eq!(expired.load(Ordering::SeqCst), 0);
            } else {
                assert_eq!(timer.state(), TimerState::Fired);
                assert_eq!(actions.load(Ordering::SeqCst), 1);
                assert_eq!(expired.load(Ordering::SeqCst), 1);
            }
        }
    }
}
