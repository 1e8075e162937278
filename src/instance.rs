//! Single-instance guard.
//!
//! The first process to take an exclusive lock on `<data dir>/docket.lock`
//! becomes the primary and serves the control channel on a loopback port,
//! published in `<data dir>/docket.port`. Everybody else is a secondary that
//! forwards its request there.

use crate::control::{Request, Responder};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub const LOCK_FILE: &str = "docket.lock";
pub const PORT_FILE: &str = "docket.port";

const IO_TIMEOUT: Duration = Duration::from_secs(5);
/// A secondary may start while the primary is still publishing its port.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum Instance {
    Primary(Primary),
    Secondary(Secondary),
}

impl Instance {
    #[instrument]
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).or_raise(|| ErrorKind::Instance)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(data_dir.join(LOCK_FILE))
            .or_raise(|| ErrorKind::Instance)?;
        let port_file = data_dir.join(PORT_FILE);
        match lock.try_lock_exclusive() {
            Ok(()) => {
                debug!("primary instance");
                Ok(Self::Primary(Primary { _lock: lock, port_file, listening: false }))
            },
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!("another instance holds the lock");
                Ok(Self::Secondary(Secondary { port_file }))
            },
            Err(e) => Err(e).or_raise(|| ErrorKind::Instance),
        }
    }
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct Primary {
    _lock: File,
    port_file: PathBuf,
    listening: bool,
}

impl Primary {
    /// Binds the control channel and publishes its port.
    pub async fn listen(&mut self) -> Result<TcpListener> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.or_raise(|| ErrorKind::Control)?;
        let port = listener.local_addr().or_raise(|| ErrorKind::Control)?.port();
        fs::write(&self.port_file, port.to_string()).or_raise(|| ErrorKind::Instance)?;
        self.listening = true;
        debug!(port, "control channel listening");
        Ok(listener)
    }
}

impl Drop for Primary {
    fn drop(&mut self) {
        if self.listening {
            let _ = fs::remove_file(&self.port_file);
        }
    }
}

#[derive(Debug)]
pub struct Secondary {
    port_file: PathBuf,
}

impl Secondary {
    /// Forwards `request` to the primary and returns its answer.
    #[instrument(skip(self))]
    pub async fn send(&self, request: Request) -> Result<String> {
        let mut stream = self.connect().await?;
        let line = format!("{request}\n");
        timeout(IO_TIMEOUT, stream.write_all(line.as_bytes()))
            .await
            .or_raise(|| ErrorKind::Control)?
            .or_raise(|| ErrorKind::Control)?;
        let mut reply = String::new();
        // Scans can take a while; only the connection itself is time-bound.
        stream.read_to_string(&mut reply).await.or_raise(|| ErrorKind::Control)?;
        Ok(reply)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let port = fs::read_to_string(&self.port_file).ok().and_then(|p| p.trim().parse::<u16>().ok());
            if let Some(port) = port
                && let Ok(Ok(stream)) = timeout(IO_TIMEOUT, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await
            {
                return Ok(stream);
            }
            if attempt >= CONNECT_ATTEMPTS {
                exn::bail!(ErrorKind::Control);
            }
            tokio::time::sleep(CONNECT_BACKOFF).await;
        }
    }
}

/// Answers control requests until `shutdown` fires.
pub async fn serve(listener: TcpListener, responder: impl Responder, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(error = %err, "could not accept control connection");
                    continue;
                },
            },
        };
        let responder = responder.clone();
        tokio::spawn(async move {
            if let Err(err) = answer(stream, &responder).await {
                warn!(error = ?err, "control connection failed");
            }
        });
    }
}

async fn answer(stream: TcpStream, responder: &impl Responder) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let line = timeout(IO_TIMEOUT, lines.next_line())
        .await
        .or_raise(|| ErrorKind::Control)?
        .or_raise(|| ErrorKind::Control)?
        .unwrap_or_default();
    let reply = match line.parse::<Request>() {
        Ok(request) => {
            debug!(%request, "control request");
            responder.respond(request).await
        },
        Err(_) => format!("error: unknown command `{}`\n", line.trim()),
    };
    write.write_all(reply.as_bytes()).await.or_raise(|| ErrorKind::Control)?;
    write.shutdown().await.or_raise(|| ErrorKind::Control)
}
