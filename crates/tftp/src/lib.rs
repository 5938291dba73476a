//! TFTP transfer engine
//!
//! A Trivial File Transfer Protocol (RFC 1350) client and server built for
//! throughput, speaking the option extension family: transfer size
//! (`tsize`, RFC 2349), block size (`blksize`, RFC 2348) and per-packet
//! timeout (`timeout`, RFC 2349).
//!
//! # Features
//!
//! - Binary (octet) transfers of arbitrary streams in both directions
//! - Full RRQ/WRQ → OACK/ACK/DATA option handshake, with graceful fallback
//!   against peers that ignore options
//! - Lock-step retry/duplicate handling that keeps a single DATA in flight
//! - A bounded producer/consumer pipeline decoupling disk from network I/O
//!   for large block sizes, with an inline mode for small ones
//! - Progress and transfer callbacks on their own task
//! - Path traversal protection for served roots
//!
//! # Example
//!
//! ```no_run
//! use tftp::Client;
//!
//! # async fn example() -> Result<(), tftp::TftpError> {
//! let client = Client::with_defaults();
//! let file = std::fs::File::open("disk.img")?;
//! client.send("192.168.1.10:69", "disk.img", file).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
mod options;
mod pipeline;
pub mod progress;
pub mod protocol;
pub mod server;
mod transfer;

pub use client::Client;
pub use config::{DEFAULT_CALLBACK_INTERVAL, TransferConfig};
pub use error::{ErrorCode, TftpError};
pub use progress::{Direction, Progress, ProgressCallback, TransferCallback, TransferInfo};
pub use protocol::{
    DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Opcode, Options, Packet,
};
pub use server::{TftpServer, TftpServerConfig, handle_session, run_tftp_server};
