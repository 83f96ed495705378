/// Root filesystem construction for a freshly cloned sandbox
///
/// Runs inside the child's private mount namespace and turns its view of the
/// filesystem into the template root with `/proc`, `/sys`, `/workspace` and
/// `/tmp` in place. Steps run strictly in [`MountStep::SEQUENCE`] order and
/// the first fatal failure aborts; nothing is rolled back because the caller
/// exits and the kernel tears the namespace down.
///
/// The child of a multi-threaded `clone` must not touch the allocator, so
/// every path is converted once in the parent ([`RootfsMounter::plan`]) and
/// [`MountPlan::enter`] reports failures as plain `Copy` values.
use crate::config::types::{DaemonError, Result};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{fchmodat, stat, FchmodatFlags, Mode};
use nix::unistd::{chdir, mkdir, pivot_root};
use nix::NixPath;
use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Name of the directory, relative to the new root, that receives the old root.
pub const OLD_ROOT_DIR: &str = "old_root";

const OLD_ROOT_PATH: &str = "/old_root";
const DIR_MODE: u32 = 0o755;
const TMP_MODE: u32 = 0o1777;

/// Allocation-free core of [`ensure_dir`].
fn ensure_dir_at<P: ?Sized + NixPath>(path: &P, mode: u32) -> nix::Result<()> {
    match stat(path) {
        Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFDIR => return Ok(()),
        Ok(_) => return Err(Errno::ENOTDIR),
        Err(Errno::ENOENT) => {}
        Err(e) => return Err(e),
    }

    let mode = Mode::from_bits_truncate(mode);
    mkdir(path, mode)?;
    // mkdir applies the umask; set the exact bits afterwards.
    fchmodat(None, path, mode, FchmodatFlags::FollowSymlink)
}

/// Make sure `path` is a directory.
///
/// Succeeds without touching anything when a directory is already there and
/// fails when something else occupies the path. A newly created directory
/// gets exactly `mode` (the umask is overridden).
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    ensure_dir_at(path, mode).map_err(|e| match e {
        Errno::ENOTDIR => DaemonError::Isolation(format!(
            "path exists but is not a directory: {}",
            path.display()
        )),
        e => DaemonError::Isolation(format!("ensure_dir({}) failed: {}", path.display(), e)),
    })
}

/// One stage of the root switch. The enum order is the execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountStep {
    /// Mark `/` recursively private so nothing below propagates to the host.
    PrivatePropagation,
    CreateStaging,
    BindRootfs,
    EnterStaging,
    CreateOldRoot,
    PivotRoot,
    ResetWorkdir,
    MountProc,
    MountSys,
    BindWorkspace,
    CreateTmp,
    DetachOldRoot,
}

impl MountStep {
    pub const SEQUENCE: [MountStep; 12] = [
        MountStep::PrivatePropagation,
        MountStep::CreateStaging,
        MountStep::BindRootfs,
        MountStep::EnterStaging,
        MountStep::CreateOldRoot,
        MountStep::PivotRoot,
        MountStep::ResetWorkdir,
        MountStep::MountProc,
        MountStep::MountSys,
        MountStep::BindWorkspace,
        MountStep::CreateTmp,
        MountStep::DetachOldRoot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MountStep::PrivatePropagation => "private-propagation",
            MountStep::CreateStaging => "create-staging",
            MountStep::BindRootfs => "bind-rootfs",
            MountStep::EnterStaging => "enter-staging",
            MountStep::CreateOldRoot => "create-old-root",
            MountStep::PivotRoot => "pivot-root",
            MountStep::ResetWorkdir => "reset-workdir",
            MountStep::MountProc => "mount-proc",
            MountStep::MountSys => "mount-sys",
            MountStep::BindWorkspace => "bind-workspace",
            MountStep::CreateTmp => "create-tmp",
            MountStep::DetachOldRoot => "detach-old-root",
        }
    }

    /// Only the final detach may fail without aborting; the old root then
    /// stays attached under `/old_root` inside this namespace.
    pub fn is_fatal(self) -> bool {
        !matches!(self, MountStep::DetachOldRoot)
    }

    fn run(self, plan: &MountPlan) -> nix::Result<()> {
        match self {
            MountStep::PrivatePropagation => mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            ),
            MountStep::CreateStaging => ensure_dir_at(plan.staging.as_c_str(), DIR_MODE),
            MountStep::BindRootfs => {
                bind_recursive(plan.rootfs.as_c_str(), plan.staging.as_c_str())
            }
            MountStep::EnterStaging => chdir(plan.staging.as_c_str()),
            MountStep::CreateOldRoot => ensure_dir_at(OLD_ROOT_DIR, DIR_MODE),
            MountStep::PivotRoot => pivot_root(".", OLD_ROOT_DIR),
            MountStep::ResetWorkdir => chdir("/"),
            MountStep::MountProc => {
                ensure_dir_at("/proc", DIR_MODE)?;
                mount(
                    Some("proc"),
                    "/proc",
                    Some("proc"),
                    MsFlags::empty(),
                    None::<&str>,
                )
            }
            MountStep::MountSys => {
                ensure_dir_at("/sys", DIR_MODE)?;
                mount(
                    Some("sysfs"),
                    "/sys",
                    Some("sysfs"),
                    MsFlags::empty(),
                    None::<&str>,
                )
            }
            MountStep::BindWorkspace => {
                ensure_dir_at("/workspace", DIR_MODE)?;
                bind_recursive(plan.workspace.as_c_str(), "/workspace")
            }
            MountStep::CreateTmp => {
                ensure_dir_at("/tmp", TMP_MODE)?;
                fchmodat(
                    None,
                    "/tmp",
                    Mode::from_bits_truncate(TMP_MODE),
                    FchmodatFlags::FollowSymlink,
                )
            }
            MountStep::DetachOldRoot => umount2(OLD_ROOT_PATH, MntFlags::MNT_DETACH),
        }
    }
}

fn bind_recursive<S, T>(source: &S, target: &T) -> nix::Result<()>
where
    S: ?Sized + NixPath,
    T: ?Sized + NixPath,
{
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
}

/// The step that stopped the pipeline and the errno it got.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepFailure {
    pub step: MountStep,
    pub errno: Errno,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rootfs step {} failed: {}", self.step.name(), self.errno)
    }
}

impl From<StepFailure> for DaemonError {
    fn from(failure: StepFailure) -> Self {
        DaemonError::Isolation(failure.to_string())
    }
}

fn path_to_cstring(what: &str, path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        DaemonError::Config(format!(
            "{} path contains NUL byte: {}",
            what,
            path.display()
        ))
    })
}

/// Pre-converted paths for one root switch.
#[derive(Clone, Debug)]
pub struct MountPlan {
    staging: CString,
    rootfs: CString,
    workspace: CString,
}

impl MountPlan {
    /// Run every step in order without allocating.
    ///
    /// `Ok(Some(_))` carries a non-fatal failure (the old root stayed
    /// attached); `Err` is the first fatal one.
    pub fn enter(&self) -> std::result::Result<Option<StepFailure>, StepFailure> {
        let mut degraded = None;
        for step in MountStep::SEQUENCE {
            if let Err(errno) = step.run(self) {
                let failure = StepFailure { step, errno };
                if step.is_fatal() {
                    return Err(failure);
                }
                degraded = Some(failure);
            }
        }
        Ok(degraded)
    }
}

/// Switches the calling process into a template root.
#[derive(Clone, Debug)]
pub struct RootfsMounter {
    staging_dir: PathBuf,
}

impl RootfsMounter {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn plan(&self, rootfs_path: &Path, workspace_path: &Path) -> Result<MountPlan> {
        Ok(MountPlan {
            staging: path_to_cstring("staging", &self.staging_dir)?,
            rootfs: path_to_cstring("rootfs", rootfs_path)?,
            workspace: path_to_cstring("workspace", workspace_path)?,
        })
    }

    /// Enter `rootfs_path` as `/` with `workspace_path` visible at `/workspace`.
    ///
    /// Must only be called inside a private mount namespace. On error the
    /// process is left half-switched and is expected to exit.
    pub fn prepare_and_enter(&self, rootfs_path: &Path, workspace_path: &Path) -> Result<()> {
        match self.plan(rootfs_path, workspace_path)?.enter() {
            Ok(None) => Ok(()),
            Ok(Some(failure)) => {
                log::warn!("{} (continuing)", failure);
                Ok(())
            }
            Err(failure) => {
                log::error!("{}", failure);
                Err(failure.into())
            }
        }
    }
}
