// Option negotiation per RFC 2347, with the blksize (RFC 2348) and
// timeout/tsize (RFC 2349) options. Recognized option names are matched
// case-insensitively; anything else is dropped by the parser.

use crate::tftp::{SocketError, TftpResult};

pub const BLOCK_SIZE_OPT_NAME: &str = "blksize";
pub const TIMEOUT_OPT_NAME: &str = "timeout";
pub const TRANSFER_SIZE_OPT_NAME: &str = "tsize";

pub const DEFAULT_BLOCK_SIZE: u16 = 512;
pub const MIN_BLOCK_SIZE: u16 = 8;
pub const MAX_BLOCK_SIZE: u16 = 65464;

pub const DEFAULT_TIMEOUT_SECS: u16 = 3;
pub const MIN_TIMEOUT_SECS: u16 = 1;
pub const MAX_TIMEOUT_SECS: u16 = 255;

/// Upper bound on a declared transfer: block numbers are 16-bit and the
/// engine does not roll them over.
pub const MAX_TRANSFER_SIZE: u64 = DEFAULT_BLOCK_SIZE as u64 * 65535;

/// The options a request asked to negotiate, or an OACK echoed back. A
/// `None` field means the option was absent from the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqOptions {
    /// Payload bytes per DATA packet.
    pub block_size: Option<u16>,

    /// Per-packet retransmit timer, in seconds.
    pub timeout: Option<u16>,

    /// Declared transfer size. Zero on an RRQ means "tell me the size".
    pub tsize: Option<u64>,
}

impl ReqOptions {
    pub fn none() -> ReqOptions {
        ReqOptions {
            block_size: None,
            timeout: None,
            tsize: None,
        }
    }

    pub fn is_none(&self) -> bool {
        *self == ReqOptions::none()
    }

    /// The block size in effect for the transfer.
    pub fn effective_block_size(&self) -> usize {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE).into()
    }

    /// The per-packet timeout in effect for the transfer, in seconds.
    pub fn effective_timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS).into()
    }

    /// Parses a sequence of (name, value) pairs into the recognized option
    /// set, validating and clamping values along the way.
    ///
    /// A `blksize` below the protocol minimum and a `timeout` outside 1..=255
    /// are rejected; a `blksize` above the maximum is clamped down to it.
    pub fn from_pairs(pairs: &[(String, String)]) -> TftpResult<ReqOptions> {
        let mut options = ReqOptions::none();
        for (name, value) in pairs {
            match name.to_lowercase().as_str() {
                BLOCK_SIZE_OPT_NAME => {
                    let size: u32 = value
                        .parse()
                        .map_err(|_| SocketError::BadOption("invalid blocksize opt".to_string()))?;
                    if size < MIN_BLOCK_SIZE.into() {
                        return Err(SocketError::BadOption("invalid blocksize opt".to_string()));
                    }
                    options.block_size = Some(size.min(MAX_BLOCK_SIZE.into()) as u16);
                }
                TIMEOUT_OPT_NAME => {
                    let secs: u32 = value.parse().map_err(|_| {
                        SocketError::BadOption("invalid timeout value opt".to_string())
                    })?;
                    if secs < MIN_TIMEOUT_SECS.into() || secs > MAX_TIMEOUT_SECS.into() {
                        return Err(SocketError::BadOption(
                            "invalid timeout value opt".to_string(),
                        ));
                    }
                    options.timeout = Some(secs as u16);
                }
                TRANSFER_SIZE_OPT_NAME => {
                    let size: u64 = value
                        .parse()
                        .map_err(|_| SocketError::BadOption("invalid tsize opt".to_string()))?;
                    options.tsize = Some(size);
                }
                // Unrecognized options are silently ignored.
                _ => {}
            }
        }
        Ok(options)
    }

    /// Emits the present options as (name, value) pairs in the canonical
    /// order blksize, timeout, tsize.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(size) = self.block_size {
            pairs.push((BLOCK_SIZE_OPT_NAME.to_string(), size.to_string()));
        }
        if let Some(secs) = self.timeout {
            pairs.push((TIMEOUT_OPT_NAME.to_string(), secs.to_string()));
        }
        if let Some(size) = self.tsize {
            pairs.push((TRANSFER_SIZE_OPT_NAME.to_string(), size.to_string()));
        }
        pairs
    }
}
