//! Process-wide platform lifecycle.
//!
//! Some device stacks must be initialized once per process before the first
//! encoder is created and torn down after the last one is gone. Each
//! [`Pipeline`](crate::Pipeline) holds a [`PlatformGuard`]; the first guard
//! of a platform runs its init hook and dropping the last runs teardown.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::EncodeError;

/// Init and teardown entry points of one platform.
#[derive(Debug, Clone, Copy)]
pub struct PlatformHooks {
    pub name: &'static str,
    pub init: fn() -> Result<(), EncodeError>,
    pub teardown: fn(),
}

fn registry() -> MutexGuard<'static, HashMap<&'static str, usize>> {
    static USERS: OnceLock<Mutex<HashMap<&'static str, usize>>> = OnceLock::new();
    USERS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| {
            tracing::warn!("platform registry mutex was poisoned, recovering");
            e.into_inner()
        })
}

/// Keeps a platform initialized while alive.
#[derive(Debug)]
pub struct PlatformGuard {
    hooks: PlatformHooks,
}

/// Register a user of `hooks`, running its init hook if this is the first.
///
/// The registry lock is held across the hook so a concurrent acquire never
/// observes a half-initialized platform.
///
/// # Errors
///
/// Whatever the init hook returns; the user count is left unchanged.
pub fn acquire(hooks: PlatformHooks) -> Result<PlatformGuard, EncodeError> {
    let mut users = registry();
    let count = users.entry(hooks.name).or_insert(0);
    if *count == 0 {
        (hooks.init)()?;
        tracing::info!(platform = hooks.name, "Platform initialized");
    }
    *count += 1;
    Ok(PlatformGuard { hooks })
}

impl PlatformGuard {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.hooks.name
    }
}

impl Drop for PlatformGuard {
    fn drop(&mut self) {
        let mut users = registry();
        let Some(count) = users.get_mut(self.hooks.name) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            users.remove(self.hooks.name);
            (self.hooks.teardown)();
            tracing::info!(platform = self.hooks.name, "Platform torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static INITS: AtomicUsize = AtomicUsize::new(0);
    static TEARDOWNS: AtomicUsize = AtomicUsize::new(0);

    fn counting() -> PlatformHooks {
        PlatformHooks {
            name: "platform-test-counting",
            init: || {
                INITS.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            teardown: || {
                TEARDOWNS.fetch_add(1, Ordering::SeqCst);
            },
        }
    }

    #[test]
    fn init_once_teardown_once() {
        let a = acquire(counting()).unwrap();
        let b = acquire(counting()).unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 1);
        drop(a);
        assert_eq!(TEARDOWNS.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(TEARDOWNS.load(Ordering::SeqCst), 1);

        let c = acquire(counting()).unwrap();
        assert_eq!(c.name(), "platform-test-counting");
        assert_eq!(INITS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_init_is_not_counted() {
        let hooks = PlatformHooks {
            name: "platform-test-failing",
            init: || Err(EncodeError::BackendUnavailable("test")),
            teardown: || {},
        };
        assert!(acquire(hooks).is_err());
        assert_eq!(registry().get("platform-test-failing"), Some(&0));
    }
}
