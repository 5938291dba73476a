//! TFTP packet codec
//!
//! Wire format for the six packet kinds defined by RFC 1350 and the option
//! extension (RFC 2347). Everything on the wire is big-endian; requests and
//! OACKs carry NUL-terminated string tokens.
//!
//! Packet layouts:
//! - RRQ/WRQ: `| Opcode | Filename | 0 | Mode | 0 | (Key | 0 | Value | 0)* |`
//! - DATA:    `| Opcode | Block# | Payload |`
//! - ACK:     `| Opcode | Block# |`
//! - ERROR:   `| Opcode | ErrorCode | Message | 0 |`
//! - OACK:    `| Opcode | (Key | 0 | Value | 0)* |`

use std::fmt;

use crate::error::TftpError;

/// Default block size when no `blksize` option is negotiated (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size the `blksize` option may carry (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size the `blksize` option may carry (RFC 2348).
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Longest accepted request filename, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// Binary transfer mode. The only mode this engine speaks.
pub const MODE_OCTET: &str = "octet";

/// TFTP Protocol Opcodes
///
/// Each opcode identifies one packet kind and occupies the first two bytes
/// of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request (RRQ) - Opcode 1
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries a 2-byte block number and up to the negotiated block size of
    /// payload. A payload shorter than the block size marks the last packet
    /// of a transfer.
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Special case: ACK with block number 0 acknowledges an OACK packet.
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Conveys the server's accepted option subset (RFC 2347).
    OptionAck = 6,
}

impl Opcode {
    /// Convert a u16 value to an Opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::ReadRequest));
    /// assert_eq!(Opcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An ordered TFTP option list.
///
/// Requests and OACKs carry `(key, value)` pairs whose order is preserved on
/// the wire; some firmware clients consider an OACK malformed when the echoed
/// set does not mirror the request. Lookup is case-insensitive on keys, and a
/// duplicated key takes its last value.
///
/// # Examples
/// ```
/// use tftp::Options;
///
/// let mut opts = Options::new();
/// opts.push("blksize", "1024");
/// opts.push("BLKSIZE", "2048");
/// assert_eq!(opts.get("blksize"), Some("2048"));
/// assert_eq!(opts.get("tsize"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, String)>);

impl Options {
    /// Create an empty option list
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an option, keeping wire order.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Case-insensitive lookup; the last occurrence of a key wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the list carries no options
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of `(key, value)` pairs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the pairs in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Options {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Read request: the client asks to pull `filename` from the server.
    Rrq {
        filename: String,
        mode: String,
        options: Options,
    },
    /// Write request: the client asks to push `filename` to the server.
    Wrq {
        filename: String,
        mode: String,
        options: Options,
    },
    /// One block of payload. An empty payload on a 4-byte packet is the
    /// end-of-transfer sentinel used when the total size is an exact
    /// multiple of the block size.
    Data { block: u16, payload: Vec<u8> },
    /// Acknowledges DATA `block`; block 0 acknowledges an OACK.
    Ack { block: u16 },
    /// Terminates a transfer with a numeric code and a message.
    Error { code: u16, message: String },
    /// The server's accepted option subset.
    Oack { options: Options },
}

impl Packet {
    /// The opcode this packet carries on the wire.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Rrq { .. } => Opcode::ReadRequest,
            Self::Wrq { .. } => Opcode::WriteRequest,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Acknowledgment,
            Self::Error { .. } => Opcode::Error,
            Self::Oack { .. } => Opcode::OptionAck,
        }
    }

    /// Shorthand for an ERROR packet carrying the code's default message.
    pub fn error(code: crate::ErrorCode) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: code.default_message().to_string(),
        }
    }

    /// Encode into a caller-provided buffer, returning the number of bytes
    /// written. Fails with a library error when the buffer is too small.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, TftpError> {
        let needed = self.encoded_len();
        if buf.len() < needed {
            return Err(TftpError::Library(format!(
                "encode buffer too small: {} < {} bytes",
                buf.len(),
                needed
            )));
        }

        let mut offset = 0;
        put_u16(buf, &mut offset, self.opcode().as_u16());

        match self {
            Self::Rrq { filename, mode, options } | Self::Wrq { filename, mode, options } => {
                put_token(buf, &mut offset, filename);
                put_token(buf, &mut offset, mode);
                for (key, value) in options.iter() {
                    put_token(buf, &mut offset, key);
                    put_token(buf, &mut offset, value);
                }
            }
            Self::Data { block, payload } => {
                put_u16(buf, &mut offset, *block);
                buf[offset..offset + payload.len()].copy_from_slice(payload);
                offset += payload.len();
            }
            Self::Ack { block } => {
                put_u16(buf, &mut offset, *block);
            }
            Self::Error { code, message } => {
                put_u16(buf, &mut offset, *code);
                put_token(buf, &mut offset, message);
            }
            Self::Oack { options } => {
                for (key, value) in options.iter() {
                    put_token(buf, &mut offset, key);
                    put_token(buf, &mut offset, value);
                }
            }
        }

        debug_assert_eq!(offset, needed);
        Ok(offset)
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        // encoded_len sized the buffer, so encode_into cannot fail.
        let n = self.encode_into(&mut buf).expect("sized buffer");
        buf.truncate(n);
        buf
    }

    fn encoded_len(&self) -> usize {
        let options_len =
            |options: &Options| options.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>();

        match self {
            Self::Rrq { filename, mode, options } | Self::Wrq { filename, mode, options } => {
                2 + filename.len() + 1 + mode.len() + 1 + options_len(options)
            }
            Self::Data { payload, .. } => 4 + payload.len(),
            Self::Ack { .. } => 4,
            Self::Error { message, .. } => 4 + message.len() + 1,
            Self::Oack { options } => 2 + options_len(options),
        }
    }

    /// Decode a datagram.
    ///
    /// Validates the opcode, that every string token is non-empty, printable
    /// and NUL-terminated, and that request filenames are UTF-8 of 1 to 255
    /// bytes. Anything else fails as malformed.
    pub fn decode(buf: &[u8]) -> Result<Self, TftpError> {
        if buf.len() < 2 {
            return Err(TftpError::malformed("packet shorter than an opcode"));
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(opcode)
            .ok_or_else(|| TftpError::malformed(format!("invalid opcode {opcode}")))?;

        match opcode {
            Opcode::ReadRequest | Opcode::WriteRequest => {
                let mut pos = 2;
                let filename = read_token(buf, &mut pos)?;
                if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
                    return Err(TftpError::malformed("bad filename length"));
                }
                let mode = read_token(buf, &mut pos)?;
                if mode.is_empty() {
                    return Err(TftpError::malformed("empty mode"));
                }
                let options = read_options(buf, &mut pos)?;
                if opcode == Opcode::ReadRequest {
                    Ok(Self::Rrq { filename, mode, options })
                } else {
                    Ok(Self::Wrq { filename, mode, options })
                }
            }
            Opcode::Data => {
                if buf.len() < 4 {
                    return Err(TftpError::malformed("DATA shorter than its header"));
                }
                Ok(Self::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    payload: buf[4..].to_vec(),
                })
            }
            Opcode::Acknowledgment => {
                if buf.len() < 4 {
                    return Err(TftpError::malformed("ACK shorter than 4 bytes"));
                }
                Ok(Self::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            Opcode::Error => {
                if buf.len() < 4 {
                    return Err(TftpError::malformed("ERROR shorter than its header"));
                }
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                // Tolerate a missing trailing NUL; some stacks omit it.
                let tail = &buf[4..];
                let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                let message = String::from_utf8_lossy(&tail[..end]).into_owned();
                Ok(Self::Error { code, message })
            }
            Opcode::OptionAck => {
                let mut pos = 2;
                let options = read_options(buf, &mut pos)?;
                Ok(Self::Oack { options })
            }
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rrq { filename, mode, .. } => write!(f, "RRQ {filename} ({mode})"),
            Self::Wrq { filename, mode, .. } => write!(f, "WRQ {filename} ({mode})"),
            Self::Data { block, payload } => write!(f, "DATA #{block} ({} bytes)", payload.len()),
            Self::Ack { block } => write!(f, "ACK #{block}"),
            Self::Error { code, message } => write!(f, "ERROR {code}: {message}"),
            Self::Oack { options } => {
                write!(f, "OACK")?;
                for (k, v) in options.iter() {
                    write!(f, " {k}={v}")?;
                }
                Ok(())
            }
        }
    }
}

fn put_u16(buf: &mut [u8], offset: &mut usize, value: u16) {
    buf[*offset..*offset + 2].copy_from_slice(&value.to_be_bytes());
    *offset += 2;
}

fn put_token(buf: &mut [u8], offset: &mut usize, token: &str) {
    buf[*offset..*offset + token.len()].copy_from_slice(token.as_bytes());
    *offset += token.len();
    buf[*offset] = 0;
    *offset += 1;
}

/// Read one NUL-terminated printable token starting at `*pos`, advancing
/// `*pos` past the terminator.
fn read_token(buf: &[u8], pos: &mut usize) -> Result<String, TftpError> {
    let tail = &buf[*pos..];
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::malformed("token not NUL-terminated"))?;
    let token = std::str::from_utf8(&tail[..end])
        .map_err(|_| TftpError::malformed("token is not valid UTF-8"))?;
    if token.chars().any(|c| c.is_control()) {
        return Err(TftpError::malformed("token contains control characters"));
    }
    *pos += end + 1;
    Ok(token.to_string())
}

fn read_options(buf: &[u8], pos: &mut usize) -> Result<Options, TftpError> {
    let mut options = Options::new();
    while *pos < buf.len() {
        let key = read_token(buf, pos)?;
        let value = read_token(buf, pos)?;
        if key.is_empty() || value.is_empty() {
            return Err(TftpError::malformed("empty option token"));
        }
        options.push(key, value);
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn roundtrip(packet: &Packet) -> Packet {
        Packet::decode(&packet.to_vec()).unwrap()
    }

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::ReadRequest.as_u16(), 1);
        assert_eq!(Opcode::Data.as_u16(), 3);
        assert_eq!(Opcode::from_u16(6), Some(Opcode::OptionAck));
        assert_eq!(Opcode::from_u16(7), None);
        assert_eq!(Opcode::ReadRequest.name(), "RRQ");
    }

    #[test]
    fn test_request_wire_layout() {
        let mut options = Options::new();
        options.push("blksize", "1024");
        let rrq = Packet::Rrq {
            filename: "boot.img".to_string(),
            mode: MODE_OCTET.to_string(),
            options,
        };

        let bytes = rrq.to_vec();
        assert_eq!(&bytes[..2], &[0, 1]);
        assert_eq!(&bytes[2..], b"boot.img\0octet\0blksize\01024\0");
        assert_eq!(roundtrip(&rrq), rrq);
    }

    #[test]
    fn test_data_wire_layout() {
        let data = Packet::Data {
            block: 258,
            payload: b"Hello".to_vec(),
        };
        let bytes = data.to_vec();
        assert_eq!(bytes, [0, 3, 1, 2, b'H', b'e', b'l', b'l', b'o']);
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn test_empty_data_is_four_bytes() {
        let sentinel = Packet::Data {
            block: 9,
            payload: Vec::new(),
        };
        let bytes = sentinel.to_vec();
        assert_eq!(bytes.len(), 4);
        match Packet::decode(&bytes).unwrap() {
            Packet::Data { block, payload } => {
                assert_eq!(block, 9);
                assert!(payload.is_empty());
            }
            other => panic!("unexpected packet: {other}"),
        }
    }

    #[test]
    fn test_ack_and_error_layout() {
        let ack = Packet::Ack { block: 42 };
        assert_eq!(ack.to_vec(), [0, 4, 0, 42]);

        let error = Packet::error(ErrorCode::FileNotFound);
        let bytes = error.to_vec();
        assert_eq!(&bytes[..4], &[0, 5, 0, 1]);
        assert!(bytes.ends_with(b"File not found\0"));
        assert_eq!(roundtrip(&error), error);
    }

    #[test]
    fn test_error_without_trailing_nul() {
        let bytes = [0u8, 5, 0, 2, b'n', b'o'];
        match Packet::decode(&bytes).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "no");
            }
            other => panic!("unexpected packet: {other}"),
        }
    }

    #[test]
    fn test_oack_roundtrip_preserves_order() {
        let options: Options =
            [("tsize", "1000000"), ("blksize", "8192"), ("timeout", "3")].into_iter().collect();
        let oack = Packet::Oack { options };
        let bytes = oack.to_vec();
        assert_eq!(&bytes[2..], b"tsize\01000000\0blksize\08192\0timeout\03\0");
        assert_eq!(roundtrip(&oack), oack);
    }

    #[test]
    fn test_option_lookup_case_insensitive_last_wins() {
        let mut options = Options::new();
        options.push("TSIZE", "1");
        options.push("tsize", "2");
        assert_eq!(options.get("Tsize"), Some("2"));
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // Too short for an opcode.
        assert!(Packet::decode(&[3]).is_err());
        // Unknown opcode.
        assert!(Packet::decode(&[0, 9, 0, 0]).is_err());
        // Filename not terminated.
        assert!(Packet::decode(b"\x00\x01boot.img").is_err());
        // Option key without a value.
        assert!(Packet::decode(b"\x00\x01f\0octet\0blksize\0").is_err());
        // Empty filename.
        assert!(Packet::decode(b"\x00\x01\0octet\0").is_err());
        // Truncated ACK.
        assert!(Packet::decode(&[0, 4, 0]).is_err());
        // Overlong filename.
        let mut long = vec![0u8, 1];
        long.extend(std::iter::repeat_n(b'a', 300));
        long.extend_from_slice(b"\0octet\0");
        assert!(Packet::decode(&long).is_err());
    }

    #[test]
    fn test_encode_into_reports_short_buffer() {
        let ack = Packet::Ack { block: 1 };
        let mut buf = [0u8; 3];
        assert!(ack.encode_into(&mut buf).is_err());

        let mut buf = [0u8; 16];
        assert_eq!(ack.encode_into(&mut buf).unwrap(), 4);
    }
}
