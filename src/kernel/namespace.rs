//! Namespace spawner: clones a sandbox into fresh mount, PID and network namespaces
//!
//! The parent returns as soon as `clone` succeeds. Root switching and `exec`
//! happen afterwards in the child with no handshake, so a returned PID means
//! "creation accepted", not "sandbox ready".

use crate::config::daemon::DaemonConfig;
use crate::config::types::{DaemonError, Result, SpawnRequest};
use crate::core::template;
use crate::kernel::mount::{MountPlan, RootfsMounter};
use crate::kernel::signal;

use libc::c_char;
use nix::errno::Errno;
use nix::sched::{clone, CloneFlags};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;

/// Stack handed to the cloned child.
pub const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Child exit status when the root switch fails.
pub const ISOLATION_FAILURE_STATUS: isize = 1;

/// Child exit status when the interpreter cannot be executed.
pub const EXEC_FAILURE_STATUS: isize = 127;

/// Namespaces every sandbox gets.
pub fn namespace_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNET
}

/// Fully resolved launch parameters.
///
/// Built in the parent, then moved into the clone callback. A child cloned
/// from a multi-threaded process must not allocate before `exec` (another
/// thread may have held the allocator lock at clone time), so every string
/// and pointer array the child needs already exists here and the child side
/// only makes syscalls.
#[derive(Debug)]
pub struct SpawnContext {
    run_id: String,
    rootfs_path: PathBuf,
    plan: MountPlan,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

impl SpawnContext {
    pub fn prepare(request: &SpawnRequest, config: &DaemonConfig) -> Result<Self> {
        let argv = template::command_line(request)
            .into_iter()
            .map(|arg| {
                CString::new(arg).map_err(|_| {
                    DaemonError::Config("command line contains NUL byte".to_string())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if argv.is_empty() {
            return Err(DaemonError::Config("empty command line".to_string()));
        }

        let overrides = template::sandbox_environment(request, config);
        let envp = merge_environment(std::env::vars_os(), &overrides)?;

        let rootfs_path = config.rootfs_for(request.template);
        let plan = RootfsMounter::new(&config.staging_dir)
            .plan(&rootfs_path, &request.workspace_path)?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            run_id: request.run_id.clone(),
            rootfs_path,
            plan,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
        })
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn envp(&self) -> &[CString] {
        &self.envp
    }

    pub fn rootfs_path(&self) -> &std::path::Path {
        &self.rootfs_path
    }

    /// Child side: reset the signal mask, switch root, then become the
    /// interpreter. Returns only on failure, with the child's exit status.
    fn enter(&self) -> isize {
        if let Err(errno) = signal::clear_signal_mask() {
            self.report(b"signal mask reset", errno);
            return ISOLATION_FAILURE_STATUS;
        }

        match self.plan.enter() {
            Ok(None) => {}
            Ok(Some(degraded)) => self.report(degraded.step.name().as_bytes(), degraded.errno),
            Err(failure) => {
                self.report(failure.step.name().as_bytes(), failure.errno);
                return ISOLATION_FAILURE_STATUS;
            }
        }

        // SAFETY: both arrays are NULL-terminated and point into CStrings
        // owned by `self`, which outlives the call.
        unsafe {
            libc::execvpe(
                self.argv_ptrs[0],
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            )
        };
        self.report(b"exec", Errno::last());
        EXEC_FAILURE_STATUS
    }

    /// One line on the child's stderr from static and pre-built pieces.
    fn report(&self, what: &[u8], errno: Errno) {
        for part in [
            &b"kyntrixd: run "[..],
            self.run_id.as_bytes(),
            &b": "[..],
            what,
            &b" failed: "[..],
            errno.desc().as_bytes(),
            &b"\n"[..],
        ] {
            // SAFETY: plain write(2) of a live byte slice.
            unsafe { libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len()) };
        }
    }
}

/// Inherited environment with `overrides` replacing same-named entries.
fn merge_environment<I>(inherited: I, overrides: &[(String, String)]) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = (std::ffi::OsString, std::ffi::OsString)>,
{
    let overridden: HashSet<&str> = overrides.iter().map(|(k, _)| k.as_str()).collect();
    let mut envp = Vec::new();

    for (key, value) in inherited {
        if key.to_str().map_or(false, |k| overridden.contains(k)) {
            continue;
        }
        if let Some(entry) = env_entry(&key, &value) {
            envp.push(entry);
        }
    }

    for (key, value) in overrides {
        let entry = env_entry(OsStr::new(key), OsStr::new(value)).ok_or_else(|| {
            DaemonError::Config(format!("environment variable {} contains NUL byte", key))
        })?;
        envp.push(entry);
    }
    Ok(envp)
}

fn env_entry(key: &OsStr, value: &OsStr) -> Option<CString> {
    let mut bytes = Vec::with_capacity(key.len() + value.len() + 1);
    bytes.extend_from_slice(key.as_bytes());
    bytes.push(b'=');
    bytes.extend_from_slice(value.as_bytes());
    CString::new(bytes).ok()
}

/// Launches sandboxes for the daemon.
#[derive(Clone, Debug)]
pub struct NamespaceSpawner {
    config: DaemonConfig,
}

impl NamespaceSpawner {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    /// Clone a new sandbox and return its host PID.
    pub fn spawn(&self, request: &SpawnRequest) -> Result<Pid> {
        let context = SpawnContext::prepare(request, &self.config)?;
        log::debug!(
            "cloning sandbox for run {} (rootfs {})",
            request.run_id,
            context.rootfs_path().display()
        );

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let child = Box::new(move || context.enter());

        // SAFETY: no CLONE_VM, so the child runs on a private copy of this
        // address space. The callback borrows the context and never
        // allocates or frees; the child leaves through exec or _exit.
        let pid = unsafe { clone(child, &mut stack, namespace_flags(), Some(libc::SIGCHLD)) }
            .map_err(|e| {
                DaemonError::Spawn(format!("clone for run {} failed: {}", request.run_id, e))
            })?;

        log::info!(
            "sandbox for run {} cloned as pid {} ({})",
            request.run_id,
            pid,
            request.template
        );
        Ok(pid)
    }
}
