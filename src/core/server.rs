//! Unix control socket: accept loop, request dispatch and optional worker pool.
//!
//! One request per connection. The daemon performs a single read of at most
//! [`REQUEST_BUFFER_SIZE`] bytes; larger requests are truncated and will
//! usually fail to parse. A request that does not parse is dropped with no
//! reply.

use crate::config::daemon::{LISTEN_BACKLOG, REQUEST_BUFFER_SIZE};
use crate::config::types::{DaemonError, Result};
use crate::core::protocol::{ControlCommand, ControlRequest, ControlResponse};
use crate::core::registry::{InstanceRegistry, Launcher};
use crate::kernel::namespace::NamespaceSpawner;
use crate::kernel::signal::SignalBlockGuard;

use crossbeam_channel::bounded;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Maps control requests onto registry operations.
pub struct Dispatcher<'a, L: Launcher = NamespaceSpawner> {
    registry: &'a InstanceRegistry<L>,
}

impl<'a, L: Launcher> Dispatcher<'a, L> {
    pub fn new(registry: &'a InstanceRegistry<L>) -> Self {
        Self { registry }
    }

    pub fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let request_id = Uuid::new_v4();

        match request.into_command() {
            ControlCommand::Start(Ok(params)) => {
                let outcome = self.registry.start(
                    &params.run_id,
                    &params.template,
                    Path::new(&params.workspace_path),
                    &params.entry,
                );
                match outcome {
                    Ok(instance) => {
                        info!(
                            "[{}] start {}: {} sandbox running as pid {}",
                            request_id, instance.run_id, instance.template, instance.pid
                        );
                        ControlResponse::ok()
                    }
                    Err(e) => {
                        warn!("[{}] start {} failed: {}", request_id, params.run_id, e);
                        ControlResponse::failed()
                    }
                }
            }
            ControlCommand::Start(Err(reason)) => {
                warn!("[{}] start rejected: {}", request_id, reason);
                ControlResponse::failed()
            }
            ControlCommand::Stop(Some(run_id)) => match self.registry.stop(&run_id) {
                Ok(instance) => {
                    info!(
                        "[{}] stop {}: SIGTERM sent to pid {}",
                        request_id, run_id, instance.pid
                    );
                    ControlResponse::ok()
                }
                Err(e) => {
                    warn!("[{}] stop {} failed: {}", request_id, run_id, e);
                    ControlResponse::failed()
                }
            },
            ControlCommand::Stop(None) => {
                warn!("[{}] stop rejected: missing field: run_id", request_id);
                ControlResponse::failed()
            }
            ControlCommand::Unknown(action) => {
                warn!("[{}] unknown action {:?}", request_id, action);
                ControlResponse::unknown_action()
            }
        }
    }
}

/// Serve exactly one request on `stream`.
///
/// A peer that closes without sending anything is not an error. A request that
/// fails to parse returns a protocol error and nothing is written back.
pub fn handle_client<S, L>(stream: &mut S, dispatcher: &Dispatcher<'_, L>) -> Result<()>
where
    S: Read + Write,
    L: Launcher,
{
    let mut buffer = [0u8; REQUEST_BUFFER_SIZE];
    let n = stream.read(&mut buffer)?;
    if n == 0 {
        return Ok(());
    }

    let request = ControlRequest::parse(&buffer[..n])?;
    let response = dispatcher.dispatch(request);
    stream.write_all(&response.encode()?)?;
    stream.flush()?;
    Ok(())
}

fn serve<L: Launcher>(mut stream: UnixStream, dispatcher: &Dispatcher<'_, L>) {
    if let Err(e) = handle_client(&mut stream, dispatcher) {
        debug!("connection dropped: {}", e);
    }
}

/// Listening control socket. The socket file is removed on drop.
pub struct ControlServer {
    path: PathBuf,
    listener: OwnedFd,
}

impl ControlServer {
    /// Replace any stale file at `path` and start listening.
    ///
    /// Every failure here is a configuration problem with the socket path
    /// (missing directory, path too long, no permission) and is reported as
    /// [`DaemonError::Config`] naming the path.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let failed = |stage: &str, e: &dyn std::fmt::Display| {
            DaemonError::Config(format!(
                "control socket {}: {} failed: {}",
                path.display(),
                stage,
                e
            ))
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(failed("removing stale file", &e)),
        }

        let listener = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| failed("socket", &e))?;
        let addr = UnixAddr::new(&path).map_err(|e| failed("address", &e))?;
        bind(listener.as_raw_fd(), &addr).map_err(|e| failed("bind", &e))?;
        let backlog = Backlog::new(LISTEN_BACKLOG).map_err(|e| failed("backlog", &e))?;
        listen(&listener, backlog).map_err(|e| failed("listen", &e))?;

        info!("control socket listening on {}", path.display());
        Ok(Self { path, listener })
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    /// Block until a client connects. Interrupted waits surface as `EINTR`.
    pub fn accept_one(&self) -> Result<UnixStream> {
        let raw = accept4(self.listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC)?;
        // SAFETY: accept4 just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(UnixStream::from(fd))
    }

    /// Accept and serve connections until `should_continue` turns false.
    ///
    /// With one worker every connection is served inline on the accepting
    /// thread. With more, accepted streams are queued to a fixed pool of
    /// scoped threads that keep the shutdown signals blocked.
    pub fn run<L, F>(&self, dispatcher: &Dispatcher<'_, L>, workers: usize, should_continue: F)
    where
        L: Launcher,
        F: Fn() -> bool,
    {
        if workers <= 1 {
            while should_continue() {
                if let Some(stream) = self.next_stream() {
                    serve(stream, dispatcher);
                }
            }
            info!("accept loop stopped");
            return;
        }

        let (tx, rx) = bounded::<UnixStream>(workers);
        std::thread::scope(|scope| {
            for worker in 0..workers {
                let rx = rx.clone();
                scope.spawn(move || {
                    let _mask = SignalBlockGuard::block()
                        .map_err(|e| warn!("worker {} cannot mask signals: {}", worker, e))
                        .ok();
                    for stream in rx.iter() {
                        serve(stream, dispatcher);
                    }
                    debug!("worker {} exiting", worker);
                });
            }
            drop(rx);

            while should_continue() {
                if let Some(stream) = self.next_stream() {
                    if tx.send(stream).is_err() {
                        warn!("all workers gone; stopping accept loop");
                        break;
                    }
                }
            }
            drop(tx);
        });
        info!("accept loop stopped; {} workers joined", workers);
    }

    fn next_stream(&self) -> Option<UnixStream> {
        match self.accept_one() {
            Ok(stream) => Some(stream),
            Err(DaemonError::Errno(Errno::EINTR)) => None,
            Err(e) => {
                warn!("accept failed: {}", e);
                None
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SpawnRequest;
    use nix::unistd::Pid;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct CountingLauncher {
        next: AtomicI32,
    }

    impl Launcher for CountingLauncher {
        fn launch(&self, _request: &SpawnRequest) -> Result<Pid> {
            Ok(Pid::from_raw(500 + self.next.fetch_add(1, Ordering::SeqCst)))
        }

        fn terminate(&self, _pid: Pid) -> Result<()> {
            Ok(())
        }
    }

    /// In-memory connection: reads from `input`, collects writes.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn exchange(registry: &InstanceRegistry<CountingLauncher>, raw: &[u8]) -> Vec<u8> {
        let mut conn = Duplex::new(raw);
        let _ = handle_client(&mut conn, &Dispatcher::new(registry));
        conn.output
    }

    #[test]
    fn start_and_stop_over_a_connection() {
        let registry = InstanceRegistry::new(CountingLauncher::default());

        let reply = exchange(
            &registry,
            br#"{"action":"start","run_id":"r1","template":"node","workspace_path":"/ws","entry":"index.js"}"#,
        );
        assert_eq!(reply, br#"{"ok":true}"#);
        assert_eq!(registry.get("r1").unwrap().pid, 500);

        assert_eq!(exchange(&registry, br#"{"action":"stop","run_id":"r1"}"#), br#"{"ok":true}"#);
        assert!(registry.is_empty());
        assert_eq!(exchange(&registry, br#"{"action":"stop","run_id":"r1"}"#), br#"{"ok":false}"#);
    }

    #[test]
    fn incomplete_start_fails_without_spawning() {
        let registry = InstanceRegistry::new(CountingLauncher::default());
        let reply = exchange(&registry, br#"{"action":"start","run_id":"r1"}"#);
        assert_eq!(reply, br#"{"ok":false}"#);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_template_reports_failure() {
        let registry = InstanceRegistry::new(CountingLauncher::default());
        let reply = exchange(
            &registry,
            br#"{"action":"start","run_id":"r1","template":"ruby","workspace_path":"/ws","entry":"a.rb"}"#,
        );
        assert_eq!(reply, br#"{"ok":false}"#);
    }

    #[test]
    fn unknown_action_gets_error_text() {
        let registry = InstanceRegistry::new(CountingLauncher::default());
        assert_eq!(
            exchange(&registry, br#"{"action":"reboot"}"#),
            br#"{"ok":false,"error":"unknown action"}"#
        );
    }

    #[test]
    fn malformed_request_gets_no_reply() {
        let registry = InstanceRegistry::new(CountingLauncher::default());
        let mut conn = Duplex::new(b"{not json");
        let err = handle_client(&mut conn, &Dispatcher::new(&registry)).unwrap_err();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Protocol);
        assert!(conn.output.is_empty());
    }

    #[test]
    fn empty_connection_is_ignored() {
        let registry = InstanceRegistry::new(CountingLauncher::default());
        let mut conn = Duplex::new(b"");
        handle_client(&mut conn, &Dispatcher::new(&registry)).unwrap();
        assert!(conn.output.is_empty());
    }

    #[test]
    fn bind_replaces_stale_file_and_drop_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = ControlServer::bind(&path).unwrap();
        assert_eq!(server.local_path(), path.as_path());
        use std::os::unix::fs::FileTypeExt;
        assert!(std::fs::metadata(&path).unwrap().file_type().is_socket());

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn bind_into_missing_directory_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("ctl.sock");

        let err = ControlServer::bind(&path).err().unwrap();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Config);
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn overlong_socket_path_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s".repeat(200));

        let err = ControlServer::bind(&path).err().unwrap();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Config);
    }
}
