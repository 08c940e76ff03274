//! Unix socket transport.
//!
//! The scheduler listens on a non-blocking socket and uses the
//! single-shot `try_*` functions: a frame that does not transfer whole
//! in one syscall means the peer is dead to us, even when the error
//! would be recoverable with more patience. The agent and the control
//! tool own blocking sockets and use the whole-frame functions; any
//! failure there is fatal for the caller.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use crate::message::{Message, FRAME_LEN};

/// Directory holding the scheduler socket. Permissions on the directory
/// are `0o711` so that any user may traverse it but only the owner may
/// list or create entries.
pub const SOCKET_DIR: &str = "/var/run/gpushare";

/// Socket file name inside [`SOCKET_DIR`].
pub const SOCKET_FILE: &str = "scheduler.sock";

/// Mode for [`SOCKET_DIR`].
pub const SOCKET_DIR_MODE: u32 = 0o711;

/// Mode for the socket file itself. Connecting to a Unix stream socket
/// requires write permission on it, so group and others get `w`.
pub const SOCKET_MODE: u32 = 0o722;

/// The well-known scheduler socket path.
pub fn default_socket_path() -> PathBuf {
    Path::new(SOCKET_DIR).join(SOCKET_FILE)
}

/// Bind a non-blocking listener at `path`.
pub fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Connect to the scheduler socket, retrying interrupted attempts.
pub fn connect(path: &Path) -> io::Result<UnixStream> {
    loop {
        match UnixStream::connect(path) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Send one frame on a non-blocking socket with a single write syscall.
/// A short write is reported as an error; the caller treats the peer as
/// gone.
pub fn try_send(mut stream: &UnixStream, msg: &Message) -> io::Result<()> {
    let buf = msg.encode();
    let n = loop {
        match stream.write(&buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => break other?,
        }
    };
    if n != FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("partial frame write ({n} of {FRAME_LEN} bytes)"),
        ));
    }
    Ok(())
}

/// Receive one frame from a non-blocking socket with a single read
/// syscall. End-of-stream and short reads are errors.
pub fn try_recv(mut stream: &UnixStream) -> io::Result<[u8; FRAME_LEN]> {
    let mut buf = [0u8; FRAME_LEN];
    let n = loop {
        match stream.read(&mut buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => break other?,
        }
    };
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ));
    }
    if n != FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("partial frame read ({n} of {FRAME_LEN} bytes)"),
        ));
    }
    Ok(buf)
}

/// Send one whole frame on a blocking socket.
pub fn write_frame(mut stream: &UnixStream, msg: &Message) -> io::Result<()> {
    stream.write_all(&msg.encode())
}

/// Receive one whole frame from a blocking socket.
pub fn read_frame(mut stream: &UnixStream) -> io::Result<[u8; FRAME_LEN]> {
    let mut buf = [0u8; FRAME_LEN];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn blocking_frames_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut msg = Message::new(MessageType::ReqLock, 7);
        msg.pod_name = "pod".into();
        write_frame(&a, &msg).unwrap();
        let decoded = Message::decode(&read_frame(&b).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn try_recv_reports_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        b.set_nonblocking(true).unwrap();
        let err = try_recv(&b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn listener_accepts_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_FILE);
        let listener = bind_listener(&path).unwrap();
        let _client = connect(&path).unwrap();
        let (peer, _) = listener.accept().unwrap();
        peer.set_nonblocking(true).unwrap();
    }
}
