//! TFTP client.
//!
//! One call, one transfer: [`Client::send`] pushes a stream to the server as
//! `filename`, [`Client::receive`] pulls `filename` into a sink. Both drive
//! the full option handshake and fall back to classic RFC 1350 behaviour
//! against servers that ignore options.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;

use crate::config::TransferConfig;
use crate::error::{ErrorCode, TftpError};
use crate::options::{self, Negotiated};
use crate::pipeline::{BlockSink, BlockSource};
use crate::progress::{Counters, ProgressCallback, Watcher};
use crate::protocol::{DEFAULT_BLOCK_SIZE, MODE_OCTET, Packet};
use crate::transfer::{self, ReceiveState, SessionIo};

/// A TFTP client bound to one [`TransferConfig`].
///
/// The client itself is stateless between calls; every transfer binds a
/// fresh ephemeral socket and pins itself to the server port learned from
/// the first response.
pub struct Client {
    config: TransferConfig,
}

impl Client {
    /// Create a client with custom tuning.
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Create a client with the stock tuning.
    pub fn with_defaults() -> Self {
        Self::new(TransferConfig::default())
    }

    /// The tuning this client transfers with.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Push `source` to the server as `filename`.
    ///
    /// `peer` takes `host` or `host:port` form; port 69 is assumed when
    /// absent. The source must seek so the transfer size can be announced
    /// up front via `tsize`.
    pub async fn send<R>(&self, peer: &str, filename: &str, source: R) -> Result<(), TftpError>
    where
        R: Read + Seek + Send + 'static,
    {
        self.send_inner(peer, filename, source, None).await
    }

    /// Like [`Client::send`], invoking `callback` with live counters every
    /// `interval` on a dedicated task.
    pub async fn send_with_progress<R>(
        &self,
        peer: &str,
        filename: &str,
        source: R,
        callback: ProgressCallback,
        interval: Duration,
    ) -> Result<(), TftpError>
    where
        R: Read + Seek + Send + 'static,
    {
        self.send_inner(peer, filename, source, Some((callback, interval))).await
    }

    /// Pull `filename` from the server into `sink`, returning the number of
    /// payload bytes received.
    pub async fn receive<W>(&self, peer: &str, filename: &str, sink: W) -> Result<u64, TftpError>
    where
        W: Write + Send + 'static,
    {
        self.receive_inner(peer, filename, sink, None).await
    }

    /// Like [`Client::receive`] with a progress callback.
    pub async fn receive_with_progress<W>(
        &self,
        peer: &str,
        filename: &str,
        sink: W,
        callback: ProgressCallback,
        interval: Duration,
    ) -> Result<u64, TftpError>
    where
        W: Write + Send + 'static,
    {
        self.receive_inner(peer, filename, sink, Some((callback, interval))).await
    }

    async fn send_inner<R>(
        &self,
        peer: &str,
        filename: &str,
        mut source: R,
        progress: Option<(ProgressCallback, Duration)>,
    ) -> Result<(), TftpError>
    where
        R: Read + Seek + Send + 'static,
    {
        let config = &self.config;
        config.validate()?;

        let total = stream_len(&mut source)?;
        let target = resolve_peer(peer).await?;
        let socket = bind_ephemeral().await?;

        let request = Packet::Wrq {
            filename: filename.to_string(),
            mode: MODE_OCTET.to_string(),
            options: options::propose(config, total),
        };
        let (response, comm_addr) = first_response(&socket, &request.to_vec(), target, config).await?;

        let negotiated = match response {
            Packet::Oack { options } => match options::apply_oack(&options, config) {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    let rejection = Packet::error(ErrorCode::OptionNegotiationFailed).to_vec();
                    let _ = socket.send_to(&rejection, comm_addr).await;
                    return Err(e);
                }
            },
            Packet::Ack { block: 0 } => Negotiated::classic(config),
            Packet::Error { code, message } => return Err(TftpError::from_peer(code, message)),
            other => {
                return Err(TftpError::protocol_msg(
                    ErrorCode::IllegalOperation,
                    format!("unexpected {other} in response to WRQ"),
                ));
            }
        };
        tracing::debug!(
            peer = %comm_addr,
            block_size = negotiated.block_size,
            "write handshake complete"
        );

        let mut io = SessionIo::new(socket, comm_addr, &negotiated, config);
        let counters = Counters::new(total);
        let cancel = Arc::new(AtomicBool::new(false));
        let watcher = spawn_watcher(&counters, &cancel, progress);

        let mut blocks = if config.use_parallel_io(negotiated.block_size) {
            BlockSource::parallel(source, negotiated.block_size, config.max_queue_bytes, Arc::clone(&cancel))
        } else {
            BlockSource::inline(source, negotiated.block_size)
        };

        let result = transfer::send_blocks(&mut io, &mut blocks, &counters, negotiated.block_size).await;

        match result {
            Ok(()) => {
                blocks.shutdown().await;
                watcher.finish().await;
                tracing::info!(peer = %comm_addr, filename, bytes = total, "upload complete");
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

    async fn receive_inner<W>(
        &self,
        peer: &str,
        filename: &str,
        sink: W,
        progress: Option<(ProgressCallback, Duration)>,
    ) -> Result<u64, TftpError>
    where
        W: Write + Send + 'static,
    {
        let config = &self.config;
        config.validate()?;

        let target = resolve_peer(peer).await?;
        let socket = bind_ephemeral().await?;

        let request = Packet::Rrq {
            filename: filename.to_string(),
            mode: MODE_OCTET.to_string(),
            options: options::propose(config, 0),
        };
        let (response, comm_addr) = first_response(&socket, &request.to_vec(), target, config).await?;

        let mut first_payload = None;
        let negotiated = match response {
            Packet::Oack { options } => match options::apply_oack(&options, config) {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    let rejection = Packet::error(ErrorCode::OptionNegotiationFailed).to_vec();
                    let _ = socket.send_to(&rejection, comm_addr).await;
                    return Err(e);
                }
            },
            // A server without option support starts blasting data right
            // away; its block size is whatever the first packet carries.
            Packet::Data { block: 1, payload } => {
                let block_size = if payload.len() < usize::from(DEFAULT_BLOCK_SIZE) {
                    DEFAULT_BLOCK_SIZE
                } else {
                    payload.len() as u16
                };
                first_payload = Some(payload);
                Negotiated {
                    block_size,
                    timeout: config.timeout,
                    transfer_size: None,
                }
            }
            Packet::Data { block, .. } => {
                return Err(TftpError::protocol_msg(
                    ErrorCode::IllegalOperation,
                    format!("first DATA carried block {block}, expected 1"),
                ));
            }
            Packet::Error { code, message } => return Err(TftpError::from_peer(code, message)),
            other => {
                return Err(TftpError::protocol_msg(
                    ErrorCode::IllegalOperation,
                    format!("unexpected {other} in response to RRQ"),
                ));
            }
        };
        tracing::debug!(
            peer = %comm_addr,
            block_size = negotiated.block_size,
            transfer_size = negotiated.transfer_size,
            "read handshake complete"
        );

        let block_size = negotiated.block_size;
        let mut io = SessionIo::new(socket, comm_addr, &negotiated, config);
        let counters = Counters::new(negotiated.transfer_size.unwrap_or(0));
        let cancel = Arc::new(AtomicBool::new(false));
        let watcher = spawn_watcher(&counters, &cancel, progress);

        let mut blocks = if config.use_parallel_io(block_size) {
            BlockSink::parallel(sink, block_size, config.max_queue_bytes)
        } else {
            BlockSink::inline(sink)
        };

        let result = deliver_handshake(&mut io, &mut blocks, &counters, block_size, first_payload).await;
        let result = match result {
            Ok(Handshake::Done(received)) => Ok(received),
            Ok(Handshake::Continue(state)) => {
                transfer::receive_blocks(&mut io, &mut blocks, &counters, block_size, state).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(received) => match blocks.finish().await {
                Ok(()) => {
                    watcher.finish().await;
                    tracing::info!(peer = %comm_addr, filename, bytes = received, "download complete");
                    Ok(received)
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
                blocks.shutdown().await;
                Err(e)
            }
        }
    }
}

enum Handshake {
    /// The first packet already ended the transfer.
    Done(u64),
    Continue(ReceiveState),
}

/// Confirm the handshake: ACK(0) after an OACK, or deliver-and-ACK a first
/// DATA from a server that skipped negotiation.
async fn deliver_handshake(
    io: &mut SessionIo,
    sink: &mut BlockSink,
    counters: &Counters,
    block_size: u16,
    first_payload: Option<Vec<u8>>,
) -> Result<Handshake, TftpError> {
    match first_payload {
        None => {
            let ack = Packet::Ack { block: 0 }.to_vec();
            io.send_raw(&ack).await?;
            Ok(Handshake::Continue(ReceiveState {
                expected: 1,
                last_confirmation: ack,
                received: 0,
            }))
        }
        Some(payload) => {
            sink.push(&payload).await?;
            counters.add_transferred(payload.len() as u64);
            let ack = Packet::Ack { block: 1 }.to_vec();
            io.send_raw(&ack).await?;
            let received = payload.len() as u64;
            if payload.len() < usize::from(block_size) {
                Ok(Handshake::Done(received))
            } else {
                Ok(Handshake::Continue(ReceiveState {
                    expected: 2,
                    last_confirmation: ack,
                    received,
                }))
            }
        }
    }
}

fn spawn_watcher(
    counters: &Arc<Counters>,
    cancel: &Arc<AtomicBool>,
    progress: Option<(ProgressCallback, Duration)>,
) -> Watcher {
    match progress {
        Some((callback, interval)) => {
            Watcher::progress(Arc::clone(counters), Arc::clone(cancel), callback, interval)
        }
        None => Watcher::disabled(Arc::clone(counters), Arc::clone(cancel)),
    }
}

/// Resolve `host` or `host:port`, defaulting to the well-known port 69.
async fn resolve_peer(peer: &str) -> Result<SocketAddr, TftpError> {
    let target = if peer.contains(':') {
        peer.to_string()
    } else {
        format!("{peer}:69")
    };

    let addrs = lookup_host(&target)
        .await
        .map_err(|e| TftpError::os(e, "failed to resolve peer address"))?;
    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TftpError::Library(format!("no IPv4 address for peer {peer:?}")))
}

async fn bind_ephemeral() -> Result<UdpSocket, TftpError> {
    UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TftpError::os(e, "failed to bind socket"))
}

/// Bytes remaining in the stream from its current position.
fn stream_len<R: Seek>(stream: &mut R) -> Result<u64, TftpError> {
    let current = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(current))?;
    Ok(end - current)
}

/// Send the request and wait for the first server response, retrying the
/// request itself on timeout. The response's source endpoint becomes the
/// session's `comm_addr`.
async fn first_response(
    socket: &UdpSocket,
    request: &[u8],
    target: SocketAddr,
    config: &TransferConfig,
) -> Result<(Packet, SocketAddr), TftpError> {
    let mut buf = vec![0u8; usize::from(config.block_size) + 4];
    let mut attempts = config.max_retries;

    loop {
        socket
            .send_to(request, target)
            .await
            .map_err(|e| TftpError::os(e, "failed to send request"))?;

        match timeout(config.timeout, socket.recv_from(&mut buf)).await {
            Err(_) => {
                attempts -= 1;
                if attempts == 0 {
                    return Err(TftpError::Timeout {
                        attempts: config.max_retries,
                    });
                }
                tracing::debug!(%target, "no response to request, retrying");
            }
            Ok(Err(e)) => return Err(TftpError::os(e, "failed to receive response")),
            Ok(Ok((len, src))) => return Ok((Packet::decode(&buf[..len])?, src)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_stream_len_from_current_position() {
        let mut cursor = Cursor::new(vec![0u8; 1000]);
        assert_eq!(stream_len(&mut cursor).unwrap(), 1000);

        cursor.seek(SeekFrom::Start(400)).unwrap();
        assert_eq!(stream_len(&mut cursor).unwrap(), 600);
        // Position is restored.
        assert_eq!(cursor.stream_position().unwrap(), 400);
    }

    #[tokio::test]
    async fn test_resolve_peer_default_port() {
        let addr = resolve_peer("127.0.0.1").await.unwrap();
        assert_eq!(addr, "127.0.0.1:69".parse().unwrap());

        let addr = resolve_peer("127.0.0.1:6969").await.unwrap();
        assert_eq!(addr, "127.0.0.1:6969".parse().unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_any_io() {
        let client = Client::new(TransferConfig {
            block_size: 2,
            ..Default::default()
        });
        let err = client
            .send("127.0.0.1:1", "x", Cursor::new(vec![1u8]))
            .await
            .unwrap_err();
        assert!(matches!(err, TftpError::Library(_)));
    }
}
