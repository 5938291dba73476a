//! Producer/consumer pipeline between disk and network.
//!
//! A transfer moves whole blocks. On the sending side a chunker splits the
//! source stream into blocks of exactly the negotiated size (the final block
//! may be short, possibly empty); on the receiving side a writer lays
//! payloads down in arrival order. In parallel mode the disk half runs on a
//! blocking thread behind a bounded channel, so the network loop never waits
//! on a disk that is merely slow, and memory stays capped at the queue bound
//! plus one block. For small block sizes the handoff overhead dominates and
//! the same operations run inline on the driver.
//!
//! End of stream is carried in-band: the final short block. Queue emptiness
//! means "await more", never "transfer over".

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

use crate::error::TftpError;

/// Read one block of exactly `block_size` bytes, short only at end of stream.
fn read_block(reader: &mut impl Read, block_size: usize) -> io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; block_size];
    let mut filled = 0;
    while filled < block_size {
        match reader.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    chunk.truncate(filled);
    Ok(chunk)
}

fn queue_depth(max_queue_bytes: usize, block_size: usize) -> usize {
    (max_queue_bytes / block_size).max(1)
}

/// Supplies payload blocks to a sending driver.
pub(crate) enum BlockSource {
    Inline {
        reader: Box<dyn Read + Send>,
        block_size: usize,
    },
    Parallel {
        rx: mpsc::Receiver<io::Result<Vec<u8>>>,
        chunker: Option<JoinHandle<()>>,
    },
}

impl BlockSource {
    pub fn inline(reader: impl Read + Send + 'static, block_size: u16) -> Self {
        Self::Inline {
            reader: Box::new(reader),
            block_size: usize::from(block_size),
        }
    }

    /// Spawn the chunker thread. It reads ahead of the network loop, blocking
    /// once `max_queue_bytes` worth of blocks are waiting, and stops on the
    /// first short block, on a read error, or when the driver goes away.
    pub fn parallel(
        mut reader: impl Read + Send + 'static,
        block_size: u16,
        max_queue_bytes: usize,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let block_size = usize::from(block_size);
        let (tx, rx) = mpsc::channel(queue_depth(max_queue_bytes, block_size));

        let chunker = task::spawn_blocking(move || {
            loop {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                match read_block(&mut reader, block_size) {
                    Ok(chunk) => {
                        let len = chunk.len();
                        if tx.blocking_send(Ok(chunk)).is_err() {
                            return;
                        }
                        if len < block_size {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        return;
                    }
                }
            }
        });

        Self::Parallel {
            rx,
            chunker: Some(chunker),
        }
    }

    /// Next block in stream order. Exactly the block size except for the
    /// terminal block.
    pub async fn next_block(&mut self) -> Result<Vec<u8>, TftpError> {
        match self {
            Self::Inline { reader, block_size } => Ok(read_block(reader, *block_size)?),
            Self::Parallel { rx, .. } => match rx.recv().await {
                Some(Ok(chunk)) => Ok(chunk),
                Some(Err(e)) => Err(e.into()),
                None => Err(TftpError::Library("chunker stopped before end of stream".to_string())),
            },
        }
    }

    /// Tear down, joining the chunker thread. Called on every exit path.
    pub async fn shutdown(self) {
        if let Self::Parallel { rx, chunker } = self {
            // Closing the channel unblocks a chunker waiting on a full queue.
            drop(rx);
            if let Some(handle) = chunker {
                let _ = handle.await;
            }
        }
    }
}

/// Accepts payload blocks from a receiving driver and writes them in order.
pub(crate) enum BlockSink {
    Inline {
        writer: Box<dyn Write + Send>,
    },
    Parallel {
        tx: Option<mpsc::Sender<Vec<u8>>>,
        writer: Option<JoinHandle<io::Result<()>>>,
    },
}

impl BlockSink {
    pub fn inline(writer: impl Write + Send + 'static) -> Self {
        Self::Inline {
            writer: Box::new(writer),
        }
    }

    /// Spawn the writer thread. It drains the queue in order and exits once
    /// the channel closes, so every accepted block reaches the sink even
    /// when the driver finishes first.
    pub fn parallel(
        mut writer: impl Write + Send + 'static,
        block_size: u16,
        max_queue_bytes: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(queue_depth(max_queue_bytes, usize::from(block_size)));

        let handle = task::spawn_blocking(move || {
            while let Some(chunk) = rx.blocking_recv() {
                writer.write_all(&chunk)?;
            }
            writer.flush()
        });

        Self::Parallel {
            tx: Some(tx),
            writer: Some(handle),
        }
    }

    /// Hand one in-order payload to the sink. Blocks when the queue is full.
    pub async fn push(&mut self, payload: &[u8]) -> Result<(), TftpError> {
        match self {
            Self::Inline { writer } => {
                writer.write_all(payload)?;
                Ok(())
            }
            Self::Parallel { tx, writer } => {
                let sender = tx
                    .as_ref()
                    .ok_or_else(|| TftpError::Library("sink already finished".to_string()))?;
                if sender.send(payload.to_vec()).await.is_err() {
                    // Writer bailed out; surface its actual I/O error.
                    if let Some(handle) = writer.take()
                        && let Ok(Err(e)) = handle.await
                    {
                        return Err(e.into());
                    }
                    return Err(TftpError::Library("block writer stopped early".to_string()));
                }
                Ok(())
            }
        }
    }

    /// Flush everything and join the writer. Must be called before a receive
    /// is reported successful.
    pub async fn finish(self) -> Result<(), TftpError> {
        match self {
            Self::Inline { mut writer } => {
                writer.flush()?;
                Ok(())
            }
            Self::Parallel { tx, writer } => {
                drop(tx);
                if let Some(handle) = writer {
                    match handle.await {
                        Ok(result) => result.map_err(TftpError::from),
                        Err(e) => Err(TftpError::Library(format!("block writer panicked: {e}"))),
                    }
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Tear down after a failed transfer: let the writer drain what was
    /// queued, ignore its outcome. Partial sinks are left as-is.
    pub async fn shutdown(self) {
        if let Self::Parallel { tx, writer } = self {
            drop(tx);
            if let Some(handle) = writer {
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_read_block_exact_and_short() {
        let mut reader = Cursor::new(pattern(700));
        let first = read_block(&mut reader, 512).unwrap();
        assert_eq!(first.len(), 512);
        let second = read_block(&mut reader, 512).unwrap();
        assert_eq!(second.len(), 188);
        let third = read_block(&mut reader, 512).unwrap();
        assert!(third.is_empty());
    }

    #[test]
    fn test_queue_depth_never_zero() {
        assert_eq!(queue_depth(300 << 20, 4096), 76800);
        assert_eq!(queue_depth(1024, 8192), 1);
    }

    #[tokio::test]
    async fn test_inline_source_yields_blocks_in_order() {
        let data = pattern(1200);
        let mut source = BlockSource::inline(Cursor::new(data.clone()), 512);

        let mut collected = Vec::new();
        loop {
            let block = source.next_block().await.unwrap();
            let len = block.len();
            collected.extend_from_slice(&block);
            if len < 512 {
                break;
            }
        }
        assert_eq!(collected, data);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_parallel_source_terminates_with_short_block() {
        let data = pattern(4096 * 3);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut source = BlockSource::parallel(Cursor::new(data.clone()), 4096, 64 << 10, cancel);

        let mut collected = Vec::new();
        let mut blocks = 0;
        loop {
            let block = source.next_block().await.unwrap();
            blocks += 1;
            let len = block.len();
            collected.extend_from_slice(&block);
            if len < 4096 {
                break;
            }
        }
        // Exactly divisible stream: three full blocks then the empty sentinel.
        assert_eq!(blocks, 4);
        assert_eq!(collected, data);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_parallel_sink_writes_in_order() {
        let data = pattern(4096 * 2 + 300);
        let (done_tx, done_rx) = std::sync::mpsc::channel::<Vec<u8>>();

        struct Captured(Vec<u8>, std::sync::mpsc::Sender<Vec<u8>>);
        impl Write for Captured {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                let _ = self.1.send(self.0.clone());
                Ok(())
            }
        }

        let mut sink = BlockSink::parallel(Captured(Vec::new(), done_tx), 4096, 64 << 10);
        for chunk in data.chunks(4096) {
            sink.push(chunk).await.unwrap();
        }
        sink.finish().await.unwrap();

        assert_eq!(done_rx.try_recv().unwrap(), data);
    }

    #[tokio::test]
    async fn test_sink_surfaces_writer_error() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sink = BlockSink::parallel(Full, 4096, 64 << 10);
        // The first push lands in the queue; the failure surfaces on a later
        // push or at finish, whichever observes the dead writer first.
        let mut failed = sink.push(&[1u8; 4096]).await.is_err();
        for _ in 0..4 {
            if failed {
                break;
            }
            failed = sink.push(&[1u8; 4096]).await.is_err();
        }
        if !failed {
            assert!(sink.finish().await.is_err());
        } else {
            sink.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_chunker() {
        // An endless reader: cancellation is the only way out.
        struct Endless;
        impl Read for Endless {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let mut source = BlockSource::parallel(Endless, 4096, 16 << 10, Arc::clone(&cancel));

        let first = source.next_block().await.unwrap();
        assert_eq!(first.len(), 4096);

        cancel.store(true, Ordering::Relaxed);
        source.shutdown().await;
    }
}
