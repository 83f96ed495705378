//! Instance registry: run id -> running sandbox.
//!
//! Every read and write of the table goes through one mutex, so the registry
//! is safe to share between connection handlers.

use crate::config::types::{ContainerTemplate, DaemonError, Result, RunningInstance, SpawnRequest};
use crate::kernel::namespace::NamespaceSpawner;
use crate::kernel::signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Creates and terminates sandbox processes on behalf of the registry.
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &SpawnRequest) -> Result<Pid>;

    fn terminate(&self, pid: Pid) -> Result<()> {
        signal::send_terminate(pid)
    }
}

impl Launcher for NamespaceSpawner {
    fn launch(&self, request: &SpawnRequest) -> Result<Pid> {
        self.spawn(request)
    }
}

pub struct InstanceRegistry<L: Launcher = NamespaceSpawner> {
    launcher: L,
    table: Mutex<HashMap<String, RunningInstance>>,
}

impl<L: Launcher> InstanceRegistry<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            launcher,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, RunningInstance>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch a sandbox and record it under its run id.
    ///
    /// An existing entry for the same run id is replaced, not rejected. On
    /// failure the table is untouched.
    pub fn start(
        &self,
        run_id: &str,
        template_name: &str,
        workspace_path: &Path,
        entry_script: &str,
    ) -> Result<RunningInstance> {
        let template: ContainerTemplate = template_name.parse()?;
        let request = SpawnRequest::new(template, run_id, workspace_path, entry_script)?;
        self.start_request(&request)
    }

    pub fn start_request(&self, request: &SpawnRequest) -> Result<RunningInstance> {
        let pid = self.launcher.launch(request)?;
        let instance = RunningInstance {
            run_id: request.run_id.clone(),
            pid: pid.as_raw(),
            template: request.template,
        };

        if let Some(previous) = self
            .table()
            .insert(request.run_id.clone(), instance.clone())
        {
            log::warn!(
                "run {} re-registered: pid {} replaces pid {} (old sandbox is no longer tracked)",
                request.run_id,
                instance.pid,
                previous.pid
            );
        }
        Ok(instance)
    }

    /// Send the termination signal and forget the run.
    ///
    /// Neither waits for nor confirms exit. A failed signal (for example the
    /// sandbox already died) is logged and the entry is still removed.
    pub fn stop(&self, run_id: &str) -> Result<RunningInstance> {
        let mut table = self.table();
        let instance = table
            .get(run_id)
            .cloned()
            .ok_or_else(|| DaemonError::Lookup(run_id.to_string()))?;

        if let Err(e) = self.launcher.terminate(Pid::from_raw(instance.pid)) {
            log::warn!(
                "run {}: SIGTERM to pid {} failed: {}",
                run_id,
                instance.pid,
                e
            );
        }
        table.remove(run_id);
        Ok(instance)
    }

    pub fn get(&self, run_id: &str) -> Option<RunningInstance> {
        self.table().get(run_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// All tracked instances ordered by run id.
    pub fn snapshot(&self) -> Vec<RunningInstance> {
        let mut instances: Vec<_> = self.table().values().cloned().collect();
        instances.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ErrorKind;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Hands out increasing fake PIDs and records terminations.
    #[derive(Default)]
    struct FakeLauncher {
        next_pid: AtomicI32,
        fail: bool,
        terminated: Mutex<Vec<i32>>,
        launched: Mutex<Vec<SpawnRequest>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, request: &SpawnRequest) -> Result<Pid> {
            if self.fail {
                return Err(DaemonError::Spawn("clone refused".to_string()));
            }
            self.launched.lock().unwrap().push(request.clone());
            Ok(Pid::from_raw(1000 + self.next_pid.fetch_add(1, Ordering::SeqCst)))
        }

        fn terminate(&self, pid: Pid) -> Result<()> {
            self.terminated.lock().unwrap().push(pid.as_raw());
            Ok(())
        }
    }

    fn registry() -> InstanceRegistry<FakeLauncher> {
        InstanceRegistry::new(FakeLauncher::default())
    }

    #[test]
    fn start_then_stop_round_trip() {
        let registry = registry();
        let started = registry
            .start("r1", "node", Path::new("/ws"), "index.js")
            .unwrap();

        let recorded = registry.get("r1").unwrap();
        assert_eq!(recorded, started);
        assert_eq!(recorded.template, ContainerTemplate::Node);

        let stopped = registry.stop("r1").unwrap();
        assert_eq!(stopped.pid, started.pid);
        assert!(registry.get("r1").is_none());
        assert_eq!(*registry.launcher().terminated.lock().unwrap(), vec![started.pid]);

        let err = registry.stop("r1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
    }

    #[test]
    fn stop_unknown_run_leaves_table_alone() {
        let registry = registry();
        registry
            .start("keep", "python", Path::new("/ws"), "main.py")
            .unwrap();

        assert!(registry.stop("ghost").is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.launcher().terminated.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_template_does_not_spawn() {
        let registry = registry();
        let err = registry
            .start("r1", "ruby", Path::new("/ws"), "main.rb")
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(registry.is_empty());
        assert!(registry.launcher().launched.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_launch_leaves_registry_unchanged() {
        let registry = InstanceRegistry::new(FakeLauncher {
            fail: true,
            ..FakeLauncher::default()
        });
        let err = registry
            .start("r1", "node", Path::new("/ws"), "index.js")
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Isolation);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_run_id_overwrites_entry() {
        let registry = registry();
        let first = registry
            .start("r1", "node", Path::new("/ws"), "index.js")
            .unwrap();
        let second = registry
            .start("r1", "python", Path::new("/ws"), "main.py")
            .unwrap();

        assert_ne!(first.pid, second.pid);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("r1").unwrap(), second);
    }

    #[test]
    fn stop_removes_entry_even_if_signal_fails() {
        struct DeadLauncher;
        impl Launcher for DeadLauncher {
            fn launch(&self, _request: &SpawnRequest) -> Result<Pid> {
                Ok(Pid::from_raw(4242))
            }
            fn terminate(&self, _pid: Pid) -> Result<()> {
                Err(DaemonError::Errno(nix::errno::Errno::ESRCH))
            }
        }

        let registry = InstanceRegistry::new(DeadLauncher);
        registry
            .start("r1", "node", Path::new("/ws"), "index.js")
            .unwrap();
        assert!(registry.stop("r1").is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_by_run_id() {
        let registry = registry();
        for run_id in ["b", "c", "a"] {
            registry
                .start(run_id, "node", Path::new("/ws"), "index.js")
                .unwrap();
        }
        let ids: Vec<_> = registry.snapshot().into_iter().map(|i| i.run_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
