//! Shared permission checker.

use permbridge_core::{BridgeError, BridgeResult, Verdict};
use permbridge_wasm::{GuestInstance, LifecycleState};
use std::sync::{Mutex, MutexGuard};

/// Thread-safe front end over one guest instance
///
/// Calls into the guest are serialized; the guest never sees two callers
/// at once.
pub struct PermissionChecker {
    instance: Mutex<GuestInstance>,
}

impl PermissionChecker {
    /// Wrap a ready instance
    #[must_use]
    pub fn new(instance: GuestInstance) -> Self {
        Self {
            instance: Mutex::new(instance),
        }
    }

    /// Check a permission
    ///
    /// # Errors
    ///
    /// Returns whatever the guest call failed with, or `Poisoned` if an
    /// earlier caller panicked while holding the instance
    pub fn check(&self, subject_id: i32, resource_id: i32, permission: &str) -> BridgeResult<Verdict> {
        self.lock()?
            .check_permission(subject_id, resource_id, permission)
    }

    /// Describe the outcome of a check as a sentence
    ///
    /// Returns `None` when the check failed; the failure is logged.
    #[must_use]
    pub fn describe(&self, subject_id: i32, resource_id: i32, permission: &str) -> Option<String> {
        match self.check(subject_id, resource_id, permission) {
            Ok(verdict) => Some(verdict.sentence(subject_id, permission)),
            Err(e) => {
                tracing::error!(
                    subject_id,
                    resource_id,
                    permission,
                    kind = e.kind(),
                    error = %e,
                    "permission check failed"
                );
                None
            }
        }
    }

    /// Number of host leases not yet released
    ///
    /// # Errors
    ///
    /// Returns `Poisoned` if the lock is poisoned
    pub fn outstanding_leases(&self) -> BridgeResult<usize> {
        Ok(self.lock()?.ledger().outstanding())
    }

    /// Number of lookups the guest has made
    ///
    /// # Errors
    ///
    /// Returns `Poisoned` if the lock is poisoned
    pub fn lookups(&self) -> BridgeResult<u64> {
        Ok(self.lock()?.lookups())
    }

    /// Lifecycle state of the underlying instance
    ///
    /// # Errors
    ///
    /// Returns `Poisoned` if the lock is poisoned
    pub fn state(&self) -> BridgeResult<LifecycleState> {
        Ok(self.lock()?.state())
    }

    fn lock(&self) -> BridgeResult<MutexGuard<'_, GuestInstance>> {
        self.instance.lock().map_err(|_| BridgeError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permbridge_core::{BridgeConfig, JsonDataset};
    use permbridge_wasm::testing::GuestBuilder;
    use std::sync::Arc;
    use std::thread;

    fn checker(builder: GuestBuilder) -> PermissionChecker {
        let dataset = JsonDataset::from_slice(br#"{"perm:1:2:edit": true}"#).unwrap();
        let instance =
            GuestInstance::from_bytes(&builder.build(), Arc::new(dataset), BridgeConfig::default())
                .unwrap();
        PermissionChecker::new(instance)
    }

    #[test]
    fn test_describe() {
        let checker = checker(GuestBuilder::new());
        assert_eq!(checker.describe(1, 2, "edit").as_deref(), Some("user 1 has edit"));
        assert_eq!(
            checker.describe(1, 2, "delete").as_deref(),
            Some("user 1 has not delete")
        );
        assert_eq!(checker.outstanding_leases().unwrap(), 0);
        assert_eq!(checker.lookups().unwrap(), 2);
    }

    #[test]
    fn test_describe_swallows_failure() {
        let checker = checker(GuestBuilder::new().result_override(7));
        assert_eq!(checker.describe(1, 2, "edit"), None);
        assert!(matches!(
            checker.check(1, 2, "edit"),
            Err(BridgeError::UnexpectedResult { value: 7, .. })
        ));
    }

    #[test]
    fn test_shared_across_threads() {
        let checker = Arc::new(checker(GuestBuilder::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let checker = Arc::clone(&checker);
                thread::spawn(move || {
                    for _ in 0..10 {
                        assert!(checker.check(1, 2, "edit").unwrap().is_granted());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(checker.lookups().unwrap(), 40);
        assert_eq!(checker.outstanding_leases().unwrap(), 0);
    }

    #[test]
    fn test_poisoned_lock() {
        let checker = Arc::new(checker(GuestBuilder::new()));
        let poisoner = Arc::clone(&checker);
        let _ = thread::spawn(move || {
            let _guard = poisoner.instance.lock().unwrap();
            panic!("poison the checker");
        })
        .join();

        assert_eq!(checker.check(1, 2, "edit"), Err(BridgeError::Poisoned));
        assert_eq!(checker.describe(1, 2, "edit"), None);
    }
}
