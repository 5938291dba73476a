//! TFTP server.
//!
//! [`handle_session`] serves exactly one client transfer on a caller-bound
//! socket: it parses the request, opens the file under the served root, runs
//! the option handshake and then the same lock-step loops the client uses.
//! [`TftpServer`] wraps it in an accept loop that dispatches one task per
//! incoming request.

use std::fs::File;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::config::{DEFAULT_CALLBACK_INTERVAL, TransferConfig};
use crate::error::{ErrorCode, TftpError};
use crate::options::{self, Negotiated};
use crate::pipeline::{BlockSink, BlockSource};
use crate::progress::{Counters, Direction, TransferCallback, TransferInfo, Watcher};
use crate::protocol::{MODE_OCTET, Options, Packet};
use crate::transfer::{self, ReceiveState, SessionIo};

/// Serve exactly one client transfer, then return.
///
/// Waits for a request on `socket`, answers from a fresh ephemeral port (the
/// session's transfer ID), and moves the file under `root_dir / filename`.
/// Requests reaching outside `root_dir` are refused with ERROR 2. The
/// optional `callback` observes the running transfer as a [`TransferInfo`]
/// snapshot every `interval`.
pub async fn handle_session(
    socket: UdpSocket,
    root_dir: impl AsRef<Path>,
    config: &TransferConfig,
    callback: Option<TransferCallback>,
    interval: Duration,
) -> Result<(), TftpError> {
    config.validate()?;

    let mut buf = vec![0u8; usize::from(config.block_size) + 4];
    let (len, client) = socket
        .recv_from(&mut buf)
        .await
        .map_err(|e| TftpError::os(e, "failed to receive request"))?;

    let request = match Packet::decode(&buf[..len]) {
        Ok(packet @ (Packet::Rrq { .. } | Packet::Wrq { .. })) => packet,
        Ok(other) => {
            let _ = socket
                .send_to(&Packet::error(ErrorCode::IllegalOperation).to_vec(), client)
                .await;
            return Err(TftpError::protocol_msg(
                ErrorCode::IllegalOperation,
                format!("expected a request, got {}", other.opcode()),
            ));
        }
        Err(e) => {
            let _ = socket
                .send_to(&Packet::error(ErrorCode::IllegalOperation).to_vec(), client)
                .await;
            return Err(e);
        }
    };

    serve_request(request, client, root_dir.as_ref(), config, callback, interval).await
}

/// Run one transfer for an already-parsed RRQ or WRQ.
pub(crate) async fn serve_request(
    request: Packet,
    client: SocketAddr,
    root_dir: &Path,
    config: &TransferConfig,
    callback: Option<TransferCallback>,
    interval: Duration,
) -> Result<(), TftpError> {
    let (direction, filename, mode, proposed) = match request {
        Packet::Rrq { filename, mode, options } => (Direction::Read, filename, mode, options),
        Packet::Wrq { filename, mode, options } => (Direction::Write, filename, mode, options),
        other => {
            return Err(TftpError::Library(format!(
                "serve_request needs a request packet, got {}",
                other.opcode()
            )));
        }
    };
    tracing::info!(%client, %direction, %filename, "handling request");

    // The reply socket's ephemeral port becomes this session's transfer ID.
    let comm = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TftpError::os(e, "failed to bind transfer socket"))?;

    if !mode.eq_ignore_ascii_case(MODE_OCTET) {
        let refusal = TftpError::protocol_msg(
            ErrorCode::IllegalOperation,
            format!("unsupported transfer mode {mode:?}"),
        );
        send_protocol_error(&comm, client, &refusal).await;
        return Err(refusal);
    }

    let path = match resolve_path(root_dir, &filename, direction) {
        Ok(path) => path,
        Err(e) => {
            send_protocol_error(&comm, client, &e).await;
            return Err(e);
        }
    };

    match direction {
        Direction::Read => {
            let (file, size) = match open_readable(&path) {
                Ok(opened) => opened,
                Err(e) => {
                    let refusal = TftpError::protocol(ErrorCode::FileNotFound);
                    send_protocol_error(&comm, client, &refusal).await;
                    tracing::warn!(%client, %filename, "cannot serve file: {e}");
                    return Err(refusal);
                }
            };
            serve_read(comm, client, config, callback, interval, filename, file, size, &proposed).await
        }
        Direction::Write => {
            let file = match File::create(&path) {
                Ok(file) => file,
                Err(e) => {
                    let refusal = TftpError::protocol(ErrorCode::AccessViolation);
                    send_protocol_error(&comm, client, &refusal).await;
                    tracing::warn!(%client, %filename, "cannot create file: {e}");
                    return Err(refusal);
                }
            };
            serve_write(comm, client, config, callback, interval, filename, file, &proposed).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_read(
    comm: UdpSocket,
    client: SocketAddr,
    config: &TransferConfig,
    callback: Option<TransferCallback>,
    interval: Duration,
    filename: String,
    file: File,
    size: u64,
    proposed: &Options,
) -> Result<(), TftpError> {
    let (negotiated, oack) = reconcile(proposed, config, Some(size));
    let mut io = SessionIo::new(comm, client, &negotiated, config);

    if let Some(oack_wire) = oack {
        tracing::debug!(%client, block_size = negotiated.block_size, "sending OACK");
        if let Err(e) = await_oack_confirmation(&mut io, &oack_wire).await {
            transfer::emit_failure(&io, &e, false).await;
            return Err(e);
        }
    }

    let counters = Counters::new(size);
    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = spawn_watcher(
        &counters,
        &cancel,
        callback,
        interval,
        Direction::Read,
        client,
        &filename,
    );

    let mut blocks = if config.use_parallel_io(negotiated.block_size) {
        BlockSource::parallel(file, negotiated.block_size, config.max_queue_bytes, Arc::clone(&cancel))
    } else {
        BlockSource::inline(file, negotiated.block_size)
    };

    let result = transfer::send_blocks(&mut io, &mut blocks, &counters, negotiated.block_size).await;

    match result {
        Ok(()) => {
            blocks.shutdown().await;
            watcher.finish().await;
            tracing::info!(%client, %filename, bytes = size, "served read request");
            Ok(())
        }
        Err(e) => {
            transfer::emit_failure(&io, &e, false).await;
            watcher.abort().await;
            blocks.shutdown().await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_write(
    comm: UdpSocket,
    client: SocketAddr,
    config: &TransferConfig,
    callback: Option<TransferCallback>,
    interval: Duration,
    filename: String,
    file: File,
    proposed: &Options,
) -> Result<(), TftpError> {
    let (negotiated, oack) = reconcile(proposed, config, None);
    let mut io = SessionIo::new(comm, client, &negotiated, config);

    // An OACK doubles as our handshake confirmation; the client answers it
    // with DATA 1 directly. Without options we confirm with a plain ACK 0.
    let confirmation = match oack {
        Some(oack_wire) => {
            tracing::debug!(%client, block_size = negotiated.block_size, "sending OACK");
            oack_wire
        }
        None => Packet::Ack { block: 0 }.to_vec(),
    };
    io.send_raw(&confirmation).await?;

    let total = negotiated.transfer_size.unwrap_or(0);
    let counters = Counters::new(total);
    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = spawn_watcher(
        &counters,
        &cancel,
        callback,
        interval,
        Direction::Write,
        client,
        &filename,
    );

    let mut sink = if config.use_parallel_io(negotiated.block_size) {
        BlockSink::parallel(file, negotiated.block_size, config.max_queue_bytes)
    } else {
        BlockSink::inline(file)
    };

    let state = ReceiveState {
        expected: 1,
        last_confirmation: confirmation,
        received: 0,
    };
    let result =
        transfer::receive_blocks(&mut io, &mut sink, &counters, negotiated.block_size, state).await;

    match result {
        Ok(received) => match sink.finish().await {
            Ok(()) => {
                watcher.finish().await;
                tracing::info!(%client, %filename, bytes = received, "served write request");
                Ok(())
            }
            Err(e) => {
                transfer::emit_failure(&io, &e, true).await;
                watcher.abort().await;
                Err(e)
            }
        },
        Err(e) => {
            transfer::emit_failure(&io, &e, true).await;
            watcher.abort().await;
            sink.shutdown().await;
            Err(e)
        }
    }
}

/// Send an OACK and wait for the client's ACK(0), re-sending on timeout.
/// A premature DATA is out-of-order at this point and is discarded.
async fn await_oack_confirmation(io: &mut SessionIo, oack_wire: &[u8]) -> Result<(), TftpError> {
    io.send_raw(oack_wire).await?;
    loop {
        match io.recv().await? {
            None => {
                io.consume_retry()?;
                io.send_raw(oack_wire).await?;
            }
            Some(Packet::Ack { block: 0 }) => {
                io.reset_retries();
                return Ok(());
            }
            Some(Packet::Ack { block }) => {
                io.send_error_best_effort(ErrorCode::IllegalOperation, "expected ACK 0").await;
                return Err(TftpError::protocol_msg(
                    ErrorCode::IllegalOperation,
                    format!("expected ACK 0 for OACK, got ACK {block}"),
                ));
            }
            Some(Packet::Error { code, message }) => {
                return Err(TftpError::from_peer(code, message));
            }
            Some(other) => {
                tracing::debug!(packet = %other, "out-of-order packet while awaiting ACK 0");
                io.consume_retry()?;
            }
        }
    }
}

/// Run the server-side negotiator, returning the agreed values and the OACK
/// wire bytes when one should be sent. A request without (usable) options
/// skips the OACK entirely and starts classic.
fn reconcile(
    proposed: &Options,
    config: &TransferConfig,
    known_size: Option<u64>,
) -> (Negotiated, Option<Vec<u8>>) {
    if proposed.is_empty() {
        return (
            Negotiated {
                transfer_size: known_size,
                ..Negotiated::classic(config)
            },
            None,
        );
    }

    let reply = options::reconcile(proposed, config, known_size);
    if reply.oack.is_empty() {
        // Nothing we honour; behave as if no options were proposed.
        return (
            Negotiated {
                transfer_size: known_size,
                ..Negotiated::classic(config)
            },
            None,
        );
    }
    let wire = Packet::Oack { options: reply.oack }.to_vec();
    (reply.negotiated, Some(wire))
}

fn spawn_watcher(
    counters: &Arc<Counters>,
    cancel: &Arc<AtomicBool>,
    callback: Option<TransferCallback>,
    interval: Duration,
    direction: Direction,
    client: SocketAddr,
    filename: &str,
) -> Watcher {
    match callback {
        Some(callback) => Watcher::transfer(
            Arc::clone(counters),
            Arc::clone(cancel),
            callback,
            interval,
            TransferInfo {
                direction,
                peer: client,
                filename: filename.to_string(),
                transferred_bytes: 0,
                total_bytes: 0,
            },
        ),
        None => Watcher::disabled(Arc::clone(counters), Arc::clone(cancel)),
    }
}

async fn send_protocol_error(socket: &UdpSocket, client: SocketAddr, err: &TftpError) {
    if let TftpError::Protocol { code, message } = err {
        let packet = Packet::Error {
            code: code.as_u16(),
            message: message.clone(),
        };
        let _ = socket.send_to(&packet.to_vec(), client).await;
    }
}

/// Map a requested filename into the served root, refusing anything that
/// would escape it.
fn resolve_path(root: &Path, filename: &str, direction: Direction) -> Result<PathBuf, TftpError> {
    let relative = Path::new(filename);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(TftpError::protocol_msg(
            ErrorCode::AccessViolation,
            format!("path {filename:?} escapes the served directory"),
        ));
    }

    let joined = root.join(relative);

    // Canonicalize to catch symlinked escapes on existing files.
    if direction == Direction::Read
        && let (Ok(root_canon), Ok(path_canon)) = (root.canonicalize(), joined.canonicalize())
        && !path_canon.starts_with(&root_canon)
    {
        return Err(TftpError::protocol_msg(
            ErrorCode::AccessViolation,
            format!("path {filename:?} escapes the served directory"),
        ));
    }

    Ok(joined)
}

fn open_readable(path: &Path) -> std::io::Result<(File, u64)> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    Ok((file, metadata.len()))
}

/// Configuration for the accept loop.
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    pub transfer: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            // 6969 keeps non-root testing easy; bind :69 (or redirect) in production.
            bind_address: "0.0.0.0:6969".to_string(),
            root_directory: PathBuf::from("./tftp_root"),
            transfer: TransferConfig::default(),
        }
    }
}

/// Multi-session TFTP server: an accept loop over [`serve_request`].
pub struct TftpServer {
    config: TftpServerConfig,
    socket: Option<UdpSocket>,
}

impl TftpServer {
    /// Create a server with the given configuration
    pub fn new(config: TftpServerConfig) -> Self {
        Self { config, socket: None }
    }

    /// Create a server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TftpServerConfig::default())
    }

    /// Create a server with custom bind address and root directory
    pub fn with_root(bind_address: String, root_directory: PathBuf) -> Self {
        Self::new(TftpServerConfig {
            bind_address,
            root_directory,
            ..Default::default()
        })
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Get the local address the server is bound to (if running)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the listen socket and run the accept loop until it fails.
    pub async fn run(&mut self) -> Result<(), TftpError> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .map_err(|e| TftpError::os(e, "failed to bind server socket"))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| TftpError::os(e, "failed to get local address"))?;
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            local_addr,
            self.config.root_directory.display()
        );

        self.socket = Some(socket);
        self.serve().await
    }

    async fn serve(&self) -> Result<(), TftpError> {
        let socket = self.socket.as_ref().expect("server must be bound before serving");
        let mut buf = [0u8; 2048];

        loop {
            let (len, client) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| TftpError::os(e, "failed to receive request"))?;

            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(%client, "malformed packet on listen port: {e}");
                    continue;
                }
            };

            match packet {
                request @ (Packet::Rrq { .. } | Packet::Wrq { .. }) => {
                    let root = self.config.root_directory.clone();
                    let config = self.config.transfer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_request(
                            request,
                            client,
                            &root,
                            &config,
                            None,
                            DEFAULT_CALLBACK_INTERVAL,
                        )
                        .await
                        {
                            tracing::warn!(%client, "transfer failed: {e}");
                        }
                    });
                }
                other => {
                    tracing::debug!(%client, opcode = %other.opcode(), "ignoring packet on listen port");
                    let _ = socket
                        .send_to(&Packet::error(ErrorCode::IllegalOperation).to_vec(), client)
                        .await;
                }
            }
        }
    }
}

/// Run a TFTP server with the given bind address and root directory.
///
/// Convenience wrapper that creates and runs a [`TftpServer`] with stock
/// transfer tuning.
pub async fn run_tftp_server(bind_address: String, root_directory: PathBuf) -> Result<(), TftpError> {
    let mut server = TftpServer::with_root(bind_address, root_directory);
    server.run().await
}
