//! Transport: a single framed duplex byte stream to the host, plus a
//! listener used by the stdio relay to accept per-stream sockets.

pub mod framing;

use std::time::Duration;

use async_trait::async_trait;
use gcs_shared::{GcsError, GcsResult};
use tokio::io::{AsyncRead, AsyncWrite};

const DIAL_RETRIES: u32 = 10;
const DIAL_BACKOFF: Duration = Duration::from_millis(100);

/// A boxed half of a duplex stream, erasing whether it came from vsock
/// or stdio.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Opens the single duplex channel to the host. Connection loss is
/// terminal for the bridge; the only retry happens on the initial
/// dial, to work around a known kernel race on the underlying socket
/// family.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self) -> GcsResult<(BoxedReader, BoxedWriter)>;
}

/// Dial `attempt_once` up to [`DIAL_RETRIES`] times with a linear
/// [`DIAL_BACKOFF`].
pub async fn dial_with_retry<F, Fut>(mut attempt_once: F) -> GcsResult<(BoxedReader, BoxedWriter)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = GcsResult<(BoxedReader, BoxedWriter)>>,
{
    let mut last_err = None;
    for attempt in 0..DIAL_RETRIES {
        match attempt_once().await {
            Ok(streams) => return Ok(streams),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "transport dial failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(DIAL_BACKOFF).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| GcsError::Fatal("transport dial never attempted".into())))
}

/// Uses stdin/stdout as the bridge transport (the `--use-inouterr` mode).
pub struct StdioTransport;

#[async_trait]
impl Transport for StdioTransport {
    async fn dial(&self) -> GcsResult<(BoxedReader, BoxedWriter)> {
        Ok((
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        ))
    }
}

#[cfg(target_os = "linux")]
pub mod vsock {
    use super::*;
    use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

    /// Dials a single peer identified by (cid, port) over AF_VSOCK.
    pub struct VsockTransport {
        pub cid: u32,
        pub port: u32,
    }

    #[async_trait]
    impl Transport for VsockTransport {
        async fn dial(&self) -> GcsResult<(BoxedReader, BoxedWriter)> {
            let addr = VsockAddr::new(self.cid, self.port);
            let stream = dial_with_retry(|| async {
                let stream = VsockStream::connect(addr)
                    .await
                    .map_err(|e| GcsError::IoFailure(format!("vsock connect {addr:?}: {e}")))?;
                let (r, w) = tokio::io::split(stream);
                Ok((Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter))
            })
            .await?;
            Ok(stream)
        }
    }

    /// Listens on a vsock port and yields one new connection per call
    /// (used by the stdio relay to accept per-stream sockets).
    pub struct VsockPortListener {
        listener: VsockListener,
    }

    impl VsockPortListener {
        pub fn bind(port: u32) -> GcsResult<Self> {
            let listener = VsockListener::bind(VsockAddr::new(libc::VMADDR_CID_ANY, port))
                .map_err(|e| GcsError::IoFailure(format!("vsock bind port {port}: {e}")))?;
            Ok(VsockPortListener { listener })
        }

        pub async fn accept_one(&self) -> GcsResult<VsockStream> {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| GcsError::IoFailure(format!("vsock accept: {e}")))?;
            Ok(stream)
        }
    }

    /// Dial a single outbound stream to a host-supplied stdio port
    /// and attach it to the relay.
    pub async fn dial_stdio_port(cid: u32, port: u32) -> GcsResult<VsockStream> {
        let addr = VsockAddr::new(cid, port);
        VsockStream::connect(addr)
            .await
            .map_err(|e| GcsError::IoFailure(format!("vsock dial stdio port {addr:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn dial_with_retry_succeeds_eventually() {
        let attempts = AtomicU32::new(0);
        let result = dial_with_retry(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GcsError::IoFailure("not yet".into()))
                } else {
                    Ok((
                        Box::new(tokio::io::empty()) as BoxedReader,
                        Box::new(tokio::io::sink()) as BoxedWriter,
                    ))
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dial_with_retry_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result = dial_with_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(BoxedReader, BoxedWriter), _>(GcsError::IoFailure("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), DIAL_RETRIES);
    }

    #[tokio::test]
    async fn stdio_transport_dials_without_error() {
        let transport = StdioTransport;
        assert!(transport.dial().await.is_ok());
    }
}
