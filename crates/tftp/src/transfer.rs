//! Lock-step DATA/ACK transfer loops.
//!
//! Both directions share one session abstraction: a socket pinned to the
//! peer endpoint learned from the first response (`comm_addr`), a receive
//! timeout, and a retry budget that refills on forward progress. At most one
//! DATA is ever unacknowledged; concurrency lives between disk and network,
//! never between packets.
//!
//! Recoverable events are absorbed here: a timed-out receive triggers a
//! retransmit, duplicates are re-acknowledged without delivery, and packets
//! from a foreign endpoint are answered with ERROR 5 without disturbing the
//! session. Everything else tears the transfer down.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::config::TransferConfig;
use crate::error::{ErrorCode, TftpError};
use crate::options::Negotiated;
use crate::pipeline::{BlockSink, BlockSource};
use crate::progress::Counters;
use crate::protocol::Packet;

/// Socket plus per-session protocol state.
pub(crate) struct SessionIo {
    socket: UdpSocket,
    /// The peer's ephemeral endpoint. Invariant for the whole session.
    peer: SocketAddr,
    recv_timeout: Duration,
    max_retries: u16,
    retries_left: u16,
    recv_buf: Vec<u8>,
}

impl SessionIo {
    /// Pin a session to `peer` with the negotiated timeout in force.
    pub fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        negotiated: &Negotiated,
        config: &TransferConfig,
    ) -> Self {
        Self {
            socket,
            peer,
            recv_timeout: negotiated.timeout,
            max_retries: config.max_retries,
            retries_left: config.max_retries,
            recv_buf: vec![0u8; usize::from(negotiated.block_size).max(512) + 4],
        }
    }

    pub async fn send_raw(&self, wire: &[u8]) -> Result<(), TftpError> {
        self.socket
            .send_to(wire, self.peer)
            .await
            .map_err(|e| TftpError::os(e, "failed to send packet"))?;
        Ok(())
    }

    /// Receive the next packet from the session peer.
    ///
    /// `Ok(None)` is a timeout, left for the caller's retry logic. Packets
    /// from any other endpoint are answered with ERROR 5 and skipped without
    /// ending the wait. A malformed packet from the peer is terminal.
    pub async fn recv(&mut self) -> Result<Option<Packet>, TftpError> {
        let deadline = self.recv_timeout;
        let socket = &self.socket;
        let peer = self.peer;
        let buf = &mut self.recv_buf;

        let received = timeout(deadline, async {
            loop {
                let (len, src) = socket.recv_from(buf).await?;
                if src != peer {
                    tracing::debug!(%src, %peer, "packet from unknown endpoint, sending ERROR 5");
                    let rejection = Packet::error(ErrorCode::UnknownTransferId).to_vec();
                    let _ = socket.send_to(&rejection, src).await;
                    continue;
                }
                return Ok::<usize, std::io::Error>(len);
            }
        })
        .await;

        match received {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(TftpError::os(e, "failed to receive packet")),
            Ok(Ok(len)) => match Packet::decode(&self.recv_buf[..len]) {
                Ok(packet) => Ok(Some(packet)),
                Err(e) => {
                    // Undecodable bytes from the session peer are terminal;
                    // tell it why before giving up.
                    self.send_error_best_effort(ErrorCode::IllegalOperation, "malformed packet").await;
                    Err(e)
                }
            },
        }
    }

    /// Burn one retry; exhausting the budget is terminal.
    pub fn consume_retry(&mut self) -> Result<(), TftpError> {
        self.retries_left = self.retries_left.saturating_sub(1);
        if self.retries_left == 0 {
            Err(TftpError::Timeout {
                attempts: self.max_retries,
            })
        } else {
            Ok(())
        }
    }

    /// Forward progress: the peer answered in order, refill the budget.
    pub fn reset_retries(&mut self) {
        self.retries_left = self.max_retries;
    }

    /// Best-effort ERROR to the peer before abandoning the session.
    pub async fn send_error_best_effort(&self, code: ErrorCode, message: &str) {
        let packet = Packet::Error {
            code: code.as_u16(),
            message: message.to_string(),
        };
        let _ = self.send_raw(&packet.to_vec()).await;
    }
}

/// Best-effort ERROR toward the peer for a terminal local failure.
///
/// Protocol failures are excluded: ones received from the peer need no echo,
/// and locally synthesised rejections already went out at the point of
/// detection. A dead socket is likewise left alone.
pub(crate) async fn emit_failure(io: &SessionIo, err: &TftpError, sink_side: bool) {
    let (code, message) = match err {
        TftpError::Protocol { .. } | TftpError::Os { .. } => return,
        TftpError::Io(e) if sink_side => (ErrorCode::DiskFull, e.to_string()),
        TftpError::Io(e) => (ErrorCode::NotDefined, e.to_string()),
        TftpError::Timeout { .. } => (ErrorCode::NotDefined, "transfer timed out".to_string()),
        TftpError::Library(message) => (ErrorCode::NotDefined, message.clone()),
    };
    io.send_error_best_effort(code, &message).await;
}

/// Drive the sending half of a session: DATA out, ACK in, until the terminal
/// short block is acknowledged.
///
/// Block numbers start at `first_block` (1 for a fresh transfer) and wrap
/// 65535 to 0. The stream's end is in-band: a block shorter than
/// `block_size`, which the chunker emits empty when the total length divides
/// evenly.
pub(crate) async fn send_blocks(
    io: &mut SessionIo,
    source: &mut BlockSource,
    counters: &Counters,
    block_size: u16,
) -> Result<(), TftpError> {
    let mut block: u16 = 1;
    loop {
        let chunk = source.next_block().await?;
        let len = chunk.len();
        send_data_await_ack(io, block, chunk).await?;
        counters.add_transferred(len as u64);
        if len < usize::from(block_size) {
            return Ok(());
        }
        block = block.wrapping_add(1);
    }
}

/// Transmit DATA `block` and wait for its ACK, retransmitting on timeout.
async fn send_data_await_ack(io: &mut SessionIo, block: u16, payload: Vec<u8>) -> Result<(), TftpError> {
    let wire = Packet::Data { block, payload }.to_vec();
    loop {
        io.send_raw(&wire).await?;

        // Wait for a decisive packet; duplicates of the previous ACK are
        // ignored without costing a retry or a retransmit.
        loop {
            match io.recv().await? {
                None => {
                    io.consume_retry()?;
                    tracing::debug!(block, "ACK timed out, retransmitting");
                    break;
                }
                Some(Packet::Ack { block: acked }) if acked == block => {
                    io.reset_retries();
                    return Ok(());
                }
                Some(Packet::Ack { block: acked }) if acked == block.wrapping_sub(1) => {
                    continue;
                }
                Some(Packet::Ack { block: acked }) => {
                    tracing::debug!(block, acked, "unexpected ACK");
                    io.consume_retry()?;
                    break;
                }
                Some(Packet::Error { code, message }) => {
                    return Err(TftpError::from_peer(code, message));
                }
                Some(other) => {
                    tracing::debug!(packet = %other, "unexpected packet while awaiting ACK");
                    io.consume_retry()?;
                    break;
                }
            }
        }
    }
}

/// State carried into [`receive_blocks`] by the handshake.
pub(crate) struct ReceiveState {
    /// Block number the loop waits for next.
    pub expected: u16,
    /// Wire bytes of our last confirmation (ACK or OACK), re-sent on timeout.
    pub last_confirmation: Vec<u8>,
    /// Bytes already delivered by the handshake (a first DATA that stood in
    /// for the OACK).
    pub received: u64,
}

/// Drive the receiving half of a session: DATA in, ACK out, until a short
/// block arrives. Returns the total payload bytes delivered to the sink.
pub(crate) async fn receive_blocks(
    io: &mut SessionIo,
    sink: &mut BlockSink,
    counters: &Counters,
    block_size: u16,
    state: ReceiveState,
) -> Result<u64, TftpError> {
    let ReceiveState {
        mut expected,
        mut last_confirmation,
        mut received,
    } = state;

    loop {
        match io.recv().await? {
            None => {
                io.consume_retry()?;
                tracing::debug!(expected, "DATA timed out, re-sending confirmation");
                io.send_raw(&last_confirmation).await?;
            }
            Some(Packet::Data { block, payload }) if block == expected => {
                if payload.len() > usize::from(block_size) {
                    return Err(TftpError::malformed(format!(
                        "DATA payload of {} bytes exceeds block size {}",
                        payload.len(),
                        block_size
                    )));
                }
                sink.push(&payload).await?;
                received += payload.len() as u64;
                counters.add_transferred(payload.len() as u64);

                let ack = Packet::Ack { block }.to_vec();
                io.send_raw(&ack).await?;
                last_confirmation = ack;
                io.reset_retries();

                if payload.len() < usize::from(block_size) {
                    return Ok(received);
                }
                expected = expected.wrapping_add(1);
            }
            Some(Packet::Data { block, .. }) if block == expected.wrapping_sub(1) => {
                // Retransmit of the block we already delivered; our ACK was
                // probably lost. Re-ACK, never re-deliver.
                io.consume_retry()?;
                io.send_raw(&Packet::Ack { block }.to_vec()).await?;
            }
            Some(Packet::Data { block, .. }) => {
                tracing::debug!(expected, block, "DATA out of order");
                io.consume_retry()?;
            }
            Some(Packet::Oack { .. }) => {
                // Our confirmation of the handshake was lost; repeat it.
                io.consume_retry()?;
                io.send_raw(&last_confirmation).await?;
            }
            Some(Packet::Error { code, message }) => {
                return Err(TftpError::from_peer(code, message));
            }
            Some(other) => {
                tracing::debug!(packet = %other, "unexpected packet while awaiting DATA");
                io.consume_retry()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn test_config() -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(200),
            max_retries: 3,
            ..Default::default()
        }
    }

    fn negotiated(block_size: u16) -> Negotiated {
        Negotiated {
            block_size,
            timeout: Duration::from_millis(200),
            transfer_size: None,
        }
    }

    async fn session_pair() -> (SessionIo, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = b.local_addr().unwrap();
        let io = SessionIo::new(a, peer, &negotiated(512), &test_config());
        (io, b)
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let (mut io, _peer) = session_pair().await;
        assert!(io.consume_retry().is_ok());
        assert!(io.consume_retry().is_ok());
        match io.consume_retry() {
            Err(TftpError::Timeout { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_budget_refills_on_progress() {
        let (mut io, _peer) = session_pair().await;
        io.consume_retry().unwrap();
        io.consume_retry().unwrap();
        io.reset_retries();
        io.consume_retry().unwrap();
        io.consume_retry().unwrap();
        assert!(io.consume_retry().is_err());
    }

    #[tokio::test]
    async fn test_recv_times_out_quietly() {
        let (mut io, _peer) = session_pair().await;
        let got = io.recv().await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_recv_rejects_stranger_and_keeps_session() {
        let (mut io, peer) = session_pair().await;
        let io_addr = io.socket.local_addr().unwrap();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger
            .send_to(&Packet::Ack { block: 0 }.to_vec(), io_addr)
            .await
            .unwrap();
        peer.send_to(&Packet::Ack { block: 7 }.to_vec(), io_addr)
            .await
            .unwrap();

        // The legitimate packet comes through...
        let got = io.recv().await.unwrap();
        assert_eq!(got, Some(Packet::Ack { block: 7 }));

        // ...and the stranger got ERROR 5.
        let mut buf = [0u8; 128];
        let (len, src) = timeout(Duration::from_secs(1), stranger.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src, io_addr);
        match Packet::decode(&buf[..len]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, 5),
            other => panic!("expected ERROR 5, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_send_blocks_retransmits_then_completes() {
        let (mut io, peer) = session_pair().await;
        let io_addr = io.socket.local_addr().unwrap();

        let payload: Vec<u8> = (0..700).map(|i| (i % 256) as u8).collect();
        let expected = payload.clone();

        let peer_task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let mut seen: Vec<Packet> = Vec::new();

            // First DATA arrives; stay silent to force a retransmit.
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            seen.push(Packet::decode(&buf[..len]).unwrap());

            // Retransmit of block 1; now ACK it.
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            seen.push(Packet::decode(&buf[..len]).unwrap());
            peer.send_to(&Packet::Ack { block: 1 }.to_vec(), io_addr).await.unwrap();

            // Block 2 (short, final).
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            seen.push(Packet::decode(&buf[..len]).unwrap());
            peer.send_to(&Packet::Ack { block: 2 }.to_vec(), io_addr).await.unwrap();

            seen
        });

        let counters = Counters::new(700);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut source = BlockSource::parallel(Cursor::new(payload), 512, 64 << 10, cancel);

        send_blocks(&mut io, &mut source, &counters, 512).await.unwrap();
        source.shutdown().await;

        let seen = peer_task.await.unwrap();
        match (&seen[0], &seen[1], &seen[2]) {
            (
                Packet::Data { block: 1, payload: first },
                Packet::Data { block: 1, payload: again },
                Packet::Data { block: 2, payload: rest },
            ) => {
                assert_eq!(first, again);
                assert_eq!(first.len(), 512);
                assert_eq!(rest.len(), 188);
                let mut all = first.clone();
                all.extend_from_slice(rest);
                assert_eq!(all, expected);
            }
            other => panic!("unexpected exchange: {other:?}"),
        }
        assert_eq!(counters.snapshot().transferred_bytes, 700);
    }

    #[tokio::test]
    async fn test_receive_blocks_reacks_duplicate_without_redelivery() {
        let (mut io, peer) = session_pair().await;
        let io_addr = io.socket.local_addr().unwrap();

        let block1 = vec![0xAA; 512];
        let block2 = vec![0xBB; 100];
        let sent = [block1.clone(), block2.clone()].concat();

        let peer_task = tokio::spawn(async move {
            let mut buf = [0u8; 128];

            let data1 = Packet::Data { block: 1, payload: block1 }.to_vec();
            peer.send_to(&data1, io_addr).await.unwrap();
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack { block: 1 });

            // Pretend the ACK was lost: send block 1 again.
            peer.send_to(&data1, io_addr).await.unwrap();
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack { block: 1 });

            let data2 = Packet::Data { block: 2, payload: block2 }.to_vec();
            peer.send_to(&data2, io_addr).await.unwrap();
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack { block: 2 });
        });

        struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);
        impl std::io::Write for Capture {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let counters = Counters::new(0);
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut sink = BlockSink::inline(Capture(Arc::clone(&collected)));
        let state = ReceiveState {
            expected: 1,
            last_confirmation: Packet::Ack { block: 0 }.to_vec(),
            received: 0,
        };
        let total = receive_blocks(&mut io, &mut sink, &counters, 512, state).await.unwrap();
        assert_eq!(total, 612);
        sink.finish().await.unwrap();

        peer_task.await.unwrap();
        assert_eq!(*collected.lock().unwrap(), sent);
    }
}
