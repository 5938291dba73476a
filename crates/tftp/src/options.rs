//! Option negotiation (RFC 2347/2348/2349).
//!
//! The client proposes `tsize`, `blksize` and `timeout` on every request; the
//! server answers with the subset it honours. Either side falls back to the
//! RFC 1350 defaults when the peer stays silent.

use std::time::Duration;

use crate::config::TransferConfig;
use crate::error::{ErrorCode, TftpError};
use crate::protocol::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Options};

pub(crate) const OPT_BLKSIZE: &str = "blksize";
pub(crate) const OPT_TSIZE: &str = "tsize";
pub(crate) const OPT_TIMEOUT: &str = "timeout";

/// Values in force for one session once the handshake settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub block_size: u16,
    pub timeout: Duration,
    /// Total transfer size; `None` when the peer never reported one.
    pub transfer_size: Option<u64>,
}

impl Negotiated {
    /// RFC 1350 defaults, used when the peer ignores our options.
    pub fn classic(config: &TransferConfig) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: config.timeout,
            transfer_size: None,
        }
    }
}

/// Build the option list a client attaches to its RRQ or WRQ.
///
/// `tsize` carries the stream length on a write and 0 on a read, asking the
/// server to fill in the real size.
pub(crate) fn propose(config: &TransferConfig, tsize: u64) -> Options {
    let mut options = Options::new();
    options.push(OPT_TSIZE, tsize.to_string());
    options.push(OPT_BLKSIZE, config.block_size.to_string());
    options.push(OPT_TIMEOUT, config.timeout_secs().to_string());
    options
}

/// Reconcile a server OACK against what the client proposed.
///
/// A `blksize` above our own proposal is a protocol violation (the server may
/// only lower it); the caller is expected to answer with ERROR 8 and stop.
/// An OACK silent on `blksize` means the server will use the classic 512.
pub(crate) fn apply_oack(oack: &Options, config: &TransferConfig) -> Result<Negotiated, TftpError> {
    let mut negotiated = Negotiated {
        block_size: DEFAULT_BLOCK_SIZE,
        timeout: config.timeout,
        transfer_size: None,
    };

    if let Some(value) = oack.get(OPT_BLKSIZE) {
        let accepted: u16 = value.parse().map_err(|_| bad_value(OPT_BLKSIZE, value))?;
        if accepted > config.block_size || accepted < MIN_BLOCK_SIZE {
            return Err(TftpError::protocol_msg(
                ErrorCode::OptionNegotiationFailed,
                format!("server offered blksize {} against proposed {}", accepted, config.block_size),
            ));
        }
        negotiated.block_size = accepted;
    }

    if let Some(value) = oack.get(OPT_TIMEOUT) {
        let secs: u64 = value.parse().map_err(|_| bad_value(OPT_TIMEOUT, value))?;
        if !(1..=255).contains(&secs) {
            return Err(bad_value(OPT_TIMEOUT, value));
        }
        negotiated.timeout = Duration::from_secs(secs);
    }

    if let Some(value) = oack.get(OPT_TSIZE) {
        let size: u64 = value.parse().map_err(|_| bad_value(OPT_TSIZE, value))?;
        negotiated.transfer_size = Some(size);
    }

    Ok(negotiated)
}

/// The server's answer to a request that carried options.
#[derive(Debug)]
pub(crate) struct ServerReply {
    /// What goes on the wire in the OACK, mirroring the client's set.
    pub oack: Options,
    pub negotiated: Negotiated,
}

/// Reconcile client-proposed options against local limits, server side.
///
/// Only options the client proposed are echoed; `blksize` is clamped to our
/// cap, `timeout` to the wire range, and `tsize` answers with `known_size`
/// when we have one (a read of a local file) or echoes the client's claim.
/// Unknown options and unparsable values are ignored rather than rejected.
pub(crate) fn reconcile(
    proposed: &Options,
    config: &TransferConfig,
    known_size: Option<u64>,
) -> ServerReply {
    let mut negotiated = Negotiated {
        block_size: DEFAULT_BLOCK_SIZE,
        timeout: config.timeout,
        transfer_size: known_size,
    };
    let mut oack = Options::new();

    if let Some(value) = proposed.get(OPT_BLKSIZE)
        && let Ok(requested) = value.parse::<u16>()
        && requested >= MIN_BLOCK_SIZE
    {
        negotiated.block_size = requested.min(config.block_size).min(MAX_BLOCK_SIZE);
        oack.push(OPT_BLKSIZE, negotiated.block_size.to_string());
    }

    if let Some(value) = proposed.get(OPT_TIMEOUT)
        && let Ok(secs) = value.parse::<u64>()
    {
        let secs = secs.clamp(1, 255);
        negotiated.timeout = Duration::from_secs(secs);
        oack.push(OPT_TIMEOUT, secs.to_string());
    }

    if let Some(value) = proposed.get(OPT_TSIZE) {
        let answer = match known_size {
            Some(size) => size,
            None => {
                let claimed = value.parse::<u64>().unwrap_or(0);
                negotiated.transfer_size = Some(claimed);
                claimed
            }
        };
        oack.push(OPT_TSIZE, answer.to_string());
    }

    ServerReply { oack, negotiated }
}

fn bad_value(option: &str, value: &str) -> TftpError {
    TftpError::protocol_msg(
        ErrorCode::OptionNegotiationFailed,
        format!("bad {option} value {value:?}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransferConfig {
        TransferConfig::default()
    }

    #[test]
    fn test_propose_carries_all_three_options() {
        let options = propose(&config(), 123456);
        assert_eq!(options.get(OPT_TSIZE), Some("123456"));
        assert_eq!(options.get(OPT_BLKSIZE), Some("4096"));
        assert_eq!(options.get(OPT_TIMEOUT), Some("5"));
    }

    #[test]
    fn test_apply_oack_accepts_lowered_blksize() {
        let oack: Options = [(OPT_BLKSIZE, "1024"), (OPT_TSIZE, "9000"), (OPT_TIMEOUT, "3")]
            .into_iter()
            .collect();

        let negotiated = apply_oack(&oack, &config()).unwrap();
        assert_eq!(negotiated.block_size, 1024);
        assert_eq!(negotiated.timeout, Duration::from_secs(3));
        assert_eq!(negotiated.transfer_size, Some(9000));
    }

    #[test]
    fn test_apply_oack_rejects_raised_blksize() {
        let oack: Options = [(OPT_BLKSIZE, "8192")].into_iter().collect();
        let err = apply_oack(&oack, &config()).unwrap_err();
        match err {
            TftpError::Protocol { code, .. } => {
                assert_eq!(code, ErrorCode::OptionNegotiationFailed);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_apply_oack_silent_on_blksize_means_classic() {
        let oack: Options = [(OPT_TSIZE, "42")].into_iter().collect();
        let negotiated = apply_oack(&oack, &config()).unwrap();
        assert_eq!(negotiated.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(negotiated.transfer_size, Some(42));
    }

    #[test]
    fn test_reconcile_echoes_proposed_subset() {
        let proposed: Options = [(OPT_BLKSIZE, "8192"), (OPT_TSIZE, "0")].into_iter().collect();
        let reply = reconcile(&proposed, &config(), Some(5000));

        // blksize clamped to our 4096 cap; tsize answered with the file size;
        // timeout absent because the client never asked.
        assert_eq!(reply.oack.get(OPT_BLKSIZE), Some("4096"));
        assert_eq!(reply.oack.get(OPT_TSIZE), Some("5000"));
        assert_eq!(reply.oack.get(OPT_TIMEOUT), None);
        assert_eq!(reply.negotiated.block_size, 4096);
    }

    #[test]
    fn test_reconcile_write_echoes_client_tsize() {
        let proposed: Options = [(OPT_TSIZE, "777")].into_iter().collect();
        let reply = reconcile(&proposed, &config(), None);
        assert_eq!(reply.oack.get(OPT_TSIZE), Some("777"));
        assert_eq!(reply.negotiated.transfer_size, Some(777));
        assert_eq!(reply.negotiated.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_reconcile_clamps_timeout_and_skips_garbage() {
        let proposed: Options = [(OPT_TIMEOUT, "900"), (OPT_BLKSIZE, "banana")]
            .into_iter()
            .collect();
        let reply = reconcile(&proposed, &config(), None);
        assert_eq!(reply.oack.get(OPT_TIMEOUT), Some("255"));
        assert_eq!(reply.oack.get(OPT_BLKSIZE), None);
        assert_eq!(reply.negotiated.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(reply.negotiated.timeout, Duration::from_secs(255));
    }
}
