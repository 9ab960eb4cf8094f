//! The injected process-liveness provider used for cross-process
//! dead-lock recovery: something `ExclusiveAccessControl` can ask
//! "is this pid still alive?" without hard-coding a platform check into
//! the lock itself.

/// Reports whether a process id is still alive. Implementations must be
/// conservative: when in doubt, report `true` (alive), since a false
/// "dead" report causes a live lock to be force-taken out from under its
/// holder.
pub trait ProcessLivenessProvider: Send + Sync {
    fn is_alive(&self, pid: i32) -> bool;
}

/// Default provider: probes `/proc/<pid>` on Linux, and otherwise
/// assumes the process is alive (platforms without a cheap liveness
/// check never trigger forced lock recovery; they just spin until the
/// holder lets go or the caller's timeout expires).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProcessProvider;

impl ProcessLivenessProvider for DefaultProcessProvider {
    #[cfg(target_os = "linux")]
    fn is_alive(&self, pid: i32) -> bool {
        std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }

    #[cfg(not(target_os = "linux"))]
    fn is_alive(&self, _pid: i32) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ProcessLivenessProvider;
    use std::collections::HashSet;
    use std::sync::RwLock;

    /// A provider whose "dead" set is controlled by the test, used to
    /// exercise lock-liveness recovery deterministically.
    #[derive(Default)]
    pub struct FakeProcessProvider {
        dead: RwLock<HashSet<i32>>,
    }

    impl FakeProcessProvider {
        pub fn kill(&self, pid: i32) {
            self.dead.write().unwrap().insert(pid);
        }
    }

    impl ProcessLivenessProvider for FakeProcessProvider {
        fn is_alive(&self, pid: i32) -> bool {
            !self.dead.read().unwrap().contains(&pid)
        }
    }
}
