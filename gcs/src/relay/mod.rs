//! Stdio relay: copies bytes between per-process framed sockets and a
//! PTY master or pipe set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gcs_shared::{GcsError, GcsResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::runtime::ProcessStdio;
#[cfg(target_os = "linux")]
use crate::transport::vsock::dial_stdio_port;
use crate::transport::{BoxedReader, BoxedWriter};

/// cid of the host, as seen from the guest.
#[cfg(target_os = "linux")]
pub const VMADDR_CID_HOST: u32 = libc::VMADDR_CID_HOST;
#[cfg(not(target_os = "linux"))]
pub const VMADDR_CID_HOST: u32 = 2;

/// One endpoint the host dialed for a stdio stream.
pub struct Endpoint {
    pub reader: Option<BoxedReader>,
    pub writer: Option<BoxedWriter>,
}

/// Pipe relay: three independent unidirectional copies. No TTY.
/// Exits when every copy returns.
pub struct PipeRelay {
    copies: Vec<JoinHandle<()>>,
}

impl PipeRelay {
    /// `host_stdin` is the reader half dialed for the host->child
    /// direction; `child_stdin_writer` is the pipe into the child.
    /// `stdout`/`stderr` mirror this in the other direction. Any
    /// endpoint can be `None` ("no stream").
    pub fn spawn(
        host_stdin: Option<(BoxedReader, Box<dyn AsyncWrite + Unpin + Send>)>,
        child_stdout: Option<(Box<dyn AsyncRead + Unpin + Send>, BoxedWriter)>,
        child_stderr: Option<(Box<dyn AsyncRead + Unpin + Send>, BoxedWriter)>,
    ) -> Self {
        let mut copies = Vec::new();
        if let Some((mut from, mut to)) = host_stdin {
            copies.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut from, &mut to).await;
                let _ = to.shutdown().await;
            }));
        }
        if let Some((mut from, mut to)) = child_stdout {
            copies.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut from, &mut to).await;
                let _ = to.shutdown().await;
            }));
        }
        if let Some((mut from, mut to)) = child_stderr {
            copies.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut from, &mut to).await;
                let _ = to.shutdown().await;
            }));
        }
        PipeRelay { copies }
    }

    pub async fn wait_closed(self) {
        for copy in self.copies {
            let _ = copy.await;
        }
    }
}

/// TTY relay: one PTY master plus stdin/stdout endpoints, two copies.
/// Supports out-of-band [`TtyRelay::resize`].
pub struct TtyRelay {
    master_fd: std::os::unix::io::RawFd,
    closing: Arc<AtomicBool>,
    copies: Mutex<Vec<JoinHandle<()>>>,
    stdin_reader_closer: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl TtyRelay {
    /// `master_fd` must stay open for the lifetime of the relay; the
    /// caller owns opening it (`nix::pty::openpty`) and passes the
    /// cloned/duplicated fds needed for the two copy directions.
    pub fn spawn(
        master_fd: std::os::unix::io::RawFd,
        host_to_pty: (BoxedReader, Box<dyn AsyncWrite + Unpin + Send>),
        pty_to_host: (Box<dyn AsyncRead + Unpin + Send>, BoxedWriter),
    ) -> Self {
        let (mut h_from, mut h_to) = host_to_pty;
        let (mut p_from, mut p_to) = pty_to_host;
        let (stdin_closer_tx, mut stdin_closer_rx) = tokio::sync::oneshot::channel();

        let copies = vec![
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::io::copy(&mut h_from, &mut h_to) => {}
                    _ = &mut stdin_closer_rx => {}
                }
            }),
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut p_from, &mut p_to).await;
            }),
        ];

        TtyRelay {
            master_fd,
            closing: Arc::new(AtomicBool::new(false)),
            copies: Mutex::new(copies),
            stdin_reader_closer: Mutex::new(Some(stdin_closer_tx)),
        }
    }

    /// Window-size ioctl on the PTY master. A no-op once the relay is
    /// closing.
    pub fn resize(&self, rows: u16, cols: u16) -> GcsResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: master_fd is a valid, open PTY master for the
        // lifetime of this relay.
        let rc = unsafe { libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &winsize) };
        if rc != 0 {
            return Err(GcsError::IoFailure(format!(
                "TIOCSWINSZ failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Close order: close the reader side of stdin first (unblocking
    /// host->PTY), wait for all copies, close the PTY and remaining
    /// endpoints, then set the closing flag *after* this first wait so
    /// an in-flight resize is not rejected; finally drain a second wait
    /// for any resize racing the close.
    pub async fn close(&self) {
        if let Some(closer) = self.stdin_reader_closer.lock().await.take() {
            let _ = closer.send(());
        }

        let mut copies = self.copies.lock().await;
        for copy in copies.drain(..) {
            let _ = copy.await;
        }
        drop(copies);

        // SAFETY: master_fd is owned by this relay and not used after close.
        unsafe {
            libc::close(self.master_fd);
        }

        self.closing.store(true, Ordering::SeqCst);

        // Drain any resize call that raced the flag flip above.
        tokio::task::yield_now().await;
    }
}

impl Drop for TtyRelay {
    /// Backstop for a relay dropped without `close()` having run: the
    /// copy tasks and `master_fd` would otherwise leak.
    fn drop(&mut self) {
        if !self.closing.load(Ordering::SeqCst) {
            // SAFETY: close() never ran, so master_fd hasn't been closed yet.
            unsafe {
                libc::close(self.master_fd);
            }
        }
    }
}

/// The live relay for one process, kept alive for as long as the
/// process runs so its copy tasks aren't dropped.
pub enum Relay {
    Pipe(PipeRelay),
    Tty(Arc<TtyRelay>),
}

impl Relay {
    /// `ResizeConsole`; only meaningful for a TTY relay.
    pub fn resize(&self, rows: u16, cols: u16) -> GcsResult<()> {
        match self {
            Relay::Tty(tty) => tty.resize(rows, cols),
            Relay::Pipe(_) => Err(GcsError::Unsupported(
                "ResizeConsole on a non-terminal process".into(),
            )),
        }
    }
}

/// Dials the host-supplied stdio ports and wires them to `stdio`,
/// returning the relay to keep alive for the process's lifetime.
/// Returns `Ok(None)` if no stdio was requested or supplied.
#[cfg(target_os = "linux")]
pub async fn wire(
    stdio: ProcessStdio,
    cid: u32,
    ports: &gcs_shared::protocol::VsockStdioRelaySettings,
) -> GcsResult<Option<Relay>> {
    use std::os::unix::io::FromRawFd;

    if !ports.any_requested() {
        return Ok(None);
    }

    match stdio {
        ProcessStdio::None => Ok(None),
        ProcessStdio::Pipes { stdin, stdout, stderr } => {
            let host_stdin = if ports.std_in != 0 {
                if let Some(writer) = stdin {
                    let stream = dial_stdio_port(cid, ports.std_in as u32).await?;
                    let (reader, _) = tokio::io::split(stream);
                    Some((Box::new(reader) as BoxedReader, writer))
                } else {
                    None
                }
            } else {
                None
            };
            let child_stdout = if ports.std_out != 0 {
                if let Some(reader) = stdout {
                    let stream = dial_stdio_port(cid, ports.std_out as u32).await?;
                    let (_, writer) = tokio::io::split(stream);
                    Some((reader, Box::new(writer) as BoxedWriter))
                } else {
                    None
                }
            } else {
                None
            };
            let child_stderr = if ports.std_err != 0 {
                if let Some(reader) = stderr {
                    let stream = dial_stdio_port(cid, ports.std_err as u32).await?;
                    let (_, writer) = tokio::io::split(stream);
                    Some((reader, Box::new(writer) as BoxedWriter))
                } else {
                    None
                }
            } else {
                None
            };
            Ok(Some(Relay::Pipe(PipeRelay::spawn(host_stdin, child_stdout, child_stderr))))
        }
        ProcessStdio::Tty { master_fd } => {
            let port = if ports.std_in != 0 { ports.std_in } else { ports.std_out };
            let stream = dial_stdio_port(cid, port as u32).await?;
            let (host_reader, host_writer) = tokio::io::split(stream);

            // SAFETY: master_fd is duplicated so the File owns an
            // independent fd; the original stays with the relay for
            // resize + explicit close.
            let async_fd = unsafe { libc::dup(master_fd) };
            if async_fd < 0 {
                return Err(GcsError::IoFailure(format!(
                    "dup pty master for relay: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let pty_file = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(async_fd) });
            let (pty_read, pty_write) = tokio::io::split(pty_file);

            let relay = TtyRelay::spawn(
                master_fd,
                (Box::new(host_reader) as BoxedReader, Box::new(pty_write) as Box<dyn AsyncWrite + Unpin + Send>),
                (Box::new(pty_read) as Box<dyn AsyncRead + Unpin + Send>, Box::new(host_writer) as BoxedWriter),
            );
            Ok(Some(Relay::Tty(Arc::new(relay))))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn wire(
    _stdio: ProcessStdio,
    _cid: u32,
    _ports: &gcs_shared::protocol::VsockStdioRelaySettings,
) -> GcsResult<Option<Relay>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipe_relay_copies_stdin_to_child_and_closes() {
        let (mut host_write, host_read) = tokio::io::duplex(64);
        let (child_read, mut child_write_check) = tokio::io::duplex(64);

        let relay = PipeRelay::spawn(
            Some((Box::new(host_read), Box::new(tokio::io::sink()))),
            None,
            None,
        );
        drop(child_read);
        drop(child_write_check);

        host_write.write_all(b"hello").await.unwrap();
        drop(host_write);
        relay.wait_closed().await;
    }

    #[tokio::test]
    async fn tty_relay_close_unblocks_stdin_copy_and_masks_resize() {
        // host_read is never written to, so the host->pty copy would
        // otherwise block on read forever; close() must unblock it via
        // stdin_reader_closer rather than hang.
        let (_host_write, host_read) = tokio::io::duplex(64);
        let (_pty_write_check, pty_read) = tokio::io::duplex(64);

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let relay = TtyRelay::spawn(
            fds[0],
            (Box::new(host_read), Box::new(tokio::io::sink())),
            (Box::new(pty_read), Box::new(tokio::io::sink())),
        );

        tokio::time::timeout(std::time::Duration::from_secs(5), relay.close())
            .await
            .expect("close() must not hang waiting on an idle stdin reader");

        assert!(relay.resize(24, 80).is_ok(), "resize is a no-op once closing");

        unsafe {
            libc::close(fds[1]);
        }
    }

    #[test]
    fn resize_is_noop_once_closing_flag_set() {
        // Construct a TtyRelay around a dummy pipe fd pair so the
        // ioctl target is a valid fd, even though it isn't a PTY —
        // resize() short-circuits before reaching the ioctl once
        // `closing` is set, so this never issues TIOCSWINSZ.
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let relay = TtyRelay {
            master_fd: fds[0],
            closing: Arc::new(AtomicBool::new(true)),
            copies: Mutex::new(Vec::new()),
            stdin_reader_closer: Mutex::new(None),
        };
        assert!(relay.resize(24, 80).is_ok());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
