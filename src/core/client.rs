//! Client side of the control socket.

use crate::config::types::Result;
use crate::core::protocol::{ControlRequest, ControlResponse};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Send one request and wait for the daemon to close the connection.
///
/// `None` means the daemon hung up without replying, which is what happens
/// when it could not parse the request.
pub fn send_request(socket: &Path, request: &ControlRequest) -> Result<Option<ControlResponse>> {
    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(&request.encode()?)?;
    stream.shutdown(Shutdown::Write)?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply)?;
    if reply.is_empty() {
        return Ok(None);
    }
    Ok(Some(ControlResponse::parse(&reply)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn reads_reply_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            conn.read_to_end(&mut request).unwrap();
            conn.write_all(br#"{"ok":true}"#).unwrap();
            request
        });

        let reply = send_request(&path, &ControlRequest::stop("r1")).unwrap();
        assert_eq!(reply, Some(ControlResponse::ok()));
        assert_eq!(peer.join().unwrap(), br#"{"action":"stop","run_id":"r1"}"#);
    }

    #[test]
    fn silent_hangup_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let peer = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
        });

        let reply = send_request(&path, &ControlRequest::stop("r1"));
        peer.join().unwrap();
        // Either the hangup raced our write (EPIPE) or we saw an empty reply.
        if let Ok(reply) = reply {
            assert_eq!(reply, None);
        }
    }

    #[test]
    fn missing_socket_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = send_request(&dir.path().join("absent.sock"), &ControlRequest::stop("r1"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::config::types::ErrorKind::Io);
    }
}
