//! Process-wide scheduler registry, grounded in the `Scheduler._instances`
//! class dict and `Scheduler.instance`/`Scheduler.gc` in the original
//! scheduler.

use crate::server::scheduler::{ExecutionMode, Scheduler, SchedulerConfig};
use crate::server::telemetry;
use lmtp_core::canon::canonical_key;
use lmtp_core::kwargs::Kwargs;
use lmtp_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lmtp_core::backend::ModelBackend;

/// Keeps at most one [`Scheduler`] resident per distinct
/// `(model_identifier, model_args)` pair, keyed by
/// [`lmtp_core::canon::canonical_key`].
pub struct SchedulerRegistry<B: ModelBackend> {
    instances: Mutex<HashMap<String, Arc<Scheduler<B>>>>,
}

impl<B: ModelBackend> Default for SchedulerRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ModelBackend> SchedulerRegistry<B> {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the scheduler for `model_identifier`/`model_args`, creating
    /// it if needed (unless `only_existing`, in which case a missing
    /// scheduler is a policy error). Registers `user` against the returned
    /// scheduler and runs a GC pass before returning, exactly as the
    /// original's `Scheduler.instance` does on every call.
    pub fn instance(
        &self,
        model_identifier: &str,
        model_args: &Kwargs,
        user: Option<u64>,
        only_existing: bool,
        mode: ExecutionMode,
        config: SchedulerConfig,
        retention_min_loaded: usize,
    ) -> Result<Arc<Scheduler<B>>> {
        let key = canonical_key(model_identifier, model_args);

        let scheduler = {
            let mut instances = self.instances.lock();
            match instances.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    if only_existing {
                        return Err(Error::CannotLoadByPolicy {
                            model_identifier: model_identifier.to_string(),
                        });
                    }
                    let created =
                        Scheduler::spawn(model_identifier.to_string(), model_args.clone(), mode, config);
                    instances.insert(key, created.clone());
                    telemetry::increment_active_schedulers();
                    created
                }
            }
        };

        scheduler.touch_last_use();
        if let Some(user) = user {
            scheduler.add_user(user);
        }

        self.gc(retention_min_loaded, Duration::from_secs(10));

        Ok(scheduler)
    }

    pub fn unregister(&self, model_identifier: &str, model_args: &Kwargs, user: u64) {
        let key = canonical_key(model_identifier, model_args);
        if let Some(scheduler) = self.instances.lock().get(&key) {
            scheduler.remove_user(user);
        }
    }

    /// Unloads schedulers with no registered users, but only once at least
    /// `min_loaded` schedulers are resident. `_timeout` is accepted for
    /// signature fidelity with the original `Scheduler.gc(n, timeout)` but
    /// is never read: the original never reads it either.
    pub fn gc(&self, min_loaded: usize, _timeout: Duration) {
        let mut instances = self.instances.lock();
        if instances.len() < min_loaded {
            return;
        }

        let unused: Vec<String> = instances
            .iter()
            .filter(|(_, s)| s.user_count() == 0)
            .map(|(k, _)| k.clone())
            .collect();

        for key in unused {
            if let Some(scheduler) = instances.remove(&key) {
                scheduler.dealloc();
                telemetry::decrement_active_schedulers();
            }
        }
    }
}
