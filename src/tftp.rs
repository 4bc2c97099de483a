use crate::options::{ReqOptions, MAX_BLOCK_SIZE};
use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest datagram we can ever receive: a DATA packet carrying the maximum
/// negotiable block plus the 4-byte opcode/block header.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE as usize + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    /// The datagram is not a structurally valid TFTP packet. Reported to the
    /// peer as ERROR(4).
    PacketParse(String),
    /// A recognized option carried an illegal value. Reported to the peer as
    /// ERROR(0).
    BadOption(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {e}"),
            SocketError::BadOption(e) => write!(f, "Bad option value: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write. The
/// engine treats both as raw byte streams; netascii line-ending translation
/// is not performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// Options the client asked to negotiate. Unrecognized option names
        /// are dropped during parsing.
        options: ReqOptions,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        options: ReqOptions,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An option acknowledgment packet, echoing the effective values the
    /// responder granted.
    OptionsAck(ReqOptions),

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for (i, c) in buf.iter().enumerate() {
        if *c == 0x00 {
            return (s, i);
        }
        s.push(char::from(*c));
    }

    (s, buf.len())
}

/// Splits a run of NUL-terminated strings into (name, value) pairs. Every
/// field must be NUL-terminated and the field count must be even.
fn option_pairs_from_buffer(buf: &[u8]) -> TftpResult<Vec<(String, String)>> {
    let mut fields = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let (field, end) = string_from_buffer(rest);
        if end == rest.len() {
            return Err(SocketError::PacketParse(
                "Option field is not null-terminated".to_string(),
            ));
        }
        fields.push(field);
        rest = &rest[end + 1..];
    }

    if fields.len() % 2 != 0 {
        return Err(SocketError::PacketParse(
            "Options must form an even sequence of name/value fields".to_string(),
        ));
    }

    Ok(fields
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// Utility function for obtaining the TFTP OpCode from a buffer
#[derive(Debug, PartialEq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
    Oack,
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::Oack),
        _ => Err(SocketError::PacketParse(format!(
            "Unknown opcode retrieved: {rawcode}"
        ))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode, ReqOptions)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse(
            "Request does not contain a mode, but it needs to!".to_string(),
        ));
    }
    if path.is_empty() {
        return Err(SocketError::PacketParse(
            "Request contains an empty filename".to_string(),
        ));
    }

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(SocketError::PacketParse(
            "Mode must be terminated with a null byte!".to_string(),
        ));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        _ => {
            return Err(SocketError::PacketParse(format!(
                "Unknown file mode: '{raw_mode}'"
            )))
        }
    };

    let pairs = option_pairs_from_buffer(&rest[mode_end + 1..])?;
    let options = ReqOptions::from_pairs(&pairs)?;

    Ok((path, mode, options))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode, options) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq {
        path,
        mode,
        options,
    })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode, options) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq {
        path,
        mode,
        options,
    })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return Err(SocketError::PacketParse(
            "Data packet is missing its block number".to_string(),
        ));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data {
        block,
        data: Vec::from(&buf[4..]),
    })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return Err(SocketError::PacketParse(
            "Ack packet is missing its block number".to_string(),
        ));
    }
    // Trailing bytes past the block number are ignored.
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_oack(buf: &[u8]) -> TftpResult<Packet> {
    let pairs = option_pairs_from_buffer(&buf[2..])?;
    let options = ReqOptions::from_pairs(&pairs)?;
    Ok(Packet::OptionsAck(options))
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return Err(SocketError::PacketParse(
            "Error packet is missing its error code".to_string(),
        ));
    }
    let raw_err = u16_from_buffer(&buf[2..4]);
    let code = match raw_err {
        0 => ErrorCode::Undefined,
        1 => ErrorCode::FileNotFound,
        2 => ErrorCode::AccessViolation,
        3 => ErrorCode::DiskFull,
        4 => ErrorCode::Illegal,
        5 => ErrorCode::UnknownTid,
        6 => ErrorCode::FileAlreadyExists,
        7 => ErrorCode::NoSuchUser,
        _ => ErrorCode::Undefined,
    };

    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
            OpCode::Oack => parse_oack(buf),
        }
    }

    /// Serializes the packet into the exact bytes that cross the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        fn push_str(buf: &mut Vec<u8>, s: &str) {
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }

        let mut buf = Vec::new();
        match self {
            Packet::ReadReq {
                path,
                mode,
                options,
            } => {
                buf.extend_from_slice(&1u16.to_be_bytes());
                push_str(&mut buf, path);
                push_str(&mut buf, mode.as_str());
                for (name, value) in options.to_pairs() {
                    push_str(&mut buf, &name);
                    push_str(&mut buf, &value);
                }
            }
            Packet::WriteReq {
                path,
                mode,
                options,
            } => {
                buf.extend_from_slice(&2u16.to_be_bytes());
                push_str(&mut buf, path);
                push_str(&mut buf, mode.as_str());
                for (name, value) in options.to_pairs() {
                    push_str(&mut buf, &name);
                    push_str(&mut buf, &value);
                }
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&3u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&4u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&5u16.to_be_bytes());
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                push_str(&mut buf, message);
            }
            Packet::OptionsAck(options) => {
                buf.extend_from_slice(&6u16.to_be_bytes());
                for (name, value) in options.to_pairs() {
                    push_str(&mut buf, &name);
                    push_str(&mut buf, &value);
                }
            }
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    recv_buf: Vec<u8>,
}

impl std::fmt::Debug for TftpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpSocket")
            .field("local_addr", &self.sock.get_ref().local_addr())
            .finish()
    }
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            recv_buf: vec![0; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    pub async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut self.recv_buf)).await??;

        let packet = Packet::parse_from_buf(&self.recv_buf[..total_written])?;
        Ok((packet, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E,
            0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::ReadReq {
                path: "/path/to/data.txt".to_string(),
                mode: FileMode::Octet,
                options: ReqOptions::none(),
            }
        );
    }

    #[test]
    fn test_packet_read_req_preserves_filename_case() {
        let buf = [&[0x00, 0x01][..], b"Boot.BIN\0", b"OcTeT\0"].concat();

        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::ReadReq {
                path: "Boot.BIN".to_string(),
                mode: FileMode::Octet,
                options: ReqOptions::none(),
            }
        );
    }

    #[test]
    fn test_packet_write_req() {
        let buf = vec![
            // opcode
            0x00, 0x02,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E,
            0x74, 0x78, 0x74, 0x00,
            // mode: netascii
            0x6E, 0x65, 0x74, 0x61, 0x73, 0x63, 0x69, 0x69, 0x00,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::WriteReq {
                path: "/path/to/data.txt".to_string(),
                mode: FileMode::NetAscii,
                options: ReqOptions::none(),
            }
        );
    }

    #[test]
    fn test_packet_read_req_with_options() {
        let buf = [
            &[0x00, 0x01][..],
            b"f\0",
            b"octet\0",
            b"blksize\0",
            b"1024\0",
            b"tsize\0",
            b"0\0",
        ]
        .concat();

        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::ReadReq {
                path: "f".to_string(),
                mode: FileMode::Octet,
                options: ReqOptions {
                    block_size: Some(1024),
                    timeout: None,
                    tsize: Some(0),
                },
            }
        );
    }

    #[test]
    fn test_packet_read_req_ignores_unknown_options() {
        let buf = [
            &[0x00, 0x01][..],
            b"f\0",
            b"octet\0",
            b"windowsize\0",
            b"16\0",
            b"TIMEOUT\0",
            b"5\0",
        ]
        .concat();

        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::ReadReq {
                path: "f".to_string(),
                mode: FileMode::Octet,
                options: ReqOptions {
                    block_size: None,
                    timeout: Some(5),
                    tsize: None,
                },
            }
        );
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03, // block number
            0x12, 0x34, // data
            0xDE, 0xAD, 0xBE, 0xEF,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Data {
                block: 0x1234,
                data: vec![0xDE, 0xAD, 0xBE, 0xEF]
            }
        );
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let packet = Packet::parse_from_buf(&[0x00, 0x03, 0x00, 0x05]).unwrap();
        assert_eq!(
            packet,
            Packet::Data {
                block: 5,
                data: vec![]
            }
        );
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_oack() {
        let buf = [
            &[0x00, 0x06][..],
            b"blksize\0",
            b"1024\0",
            b"tsize\0",
            b"131072\0",
        ]
        .concat();
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::OptionsAck(ReqOptions {
                block_size: Some(1024),
                timeout: None,
                tsize: Some(131072),
            })
        );
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05, // Error code
            0x00, 0x04, // Error message: Illegal!
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21,
        ];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Error {
                code: ErrorCode::Illegal,
                message: "Illegal!".to_string()
            }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        // Invalid opcodes
        assert!(Packet::parse_from_buf(&[0x10]).is_err());
        assert!(Packet::parse_from_buf(&[0x10, 0x00]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x09]).is_err());
        // Invalid read path
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Empty filename
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x00, 0x68, 0x69, 0x00]).is_err());
        // Missing mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Invalid mode string
        assert!(
            Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00])
                .is_err()
        );
        // Mail mode is not supported
        assert!(
            Packet::parse_from_buf(&[&[0x00, 0x01][..], b"hi\0", b"mail\0"].concat()).is_err()
        );
        // Odd number of option fields
        assert!(Packet::parse_from_buf(
            &[&[0x00, 0x01][..], b"hi\0", b"octet\0", b"blksize\0"].concat()
        )
        .is_err());
        // Option value missing its terminator
        assert!(Packet::parse_from_buf(
            &[&[0x00, 0x01][..], b"hi\0", b"octet\0", b"blksize\0", b"1024"].concat()
        )
        .is_err());
        // Truncated DATA / ACK / ERROR headers
        assert!(Packet::parse_from_buf(&[0x00, 0x03, 0x01]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x04]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x05, 0x00]).is_err());
    }

    #[test]
    fn test_encode_request_round_trip() {
        let packet = Packet::ReadReq {
            path: "kernel.img".to_string(),
            mode: FileMode::Octet,
            options: ReqOptions {
                block_size: Some(1432),
                timeout: Some(4),
                tsize: Some(0),
            },
        };
        assert_eq!(Packet::parse_from_buf(&packet.to_bytes()).unwrap(), packet);
    }

    #[test]
    fn test_encode_data_and_ack() {
        let data = Packet::Data {
            block: 7,
            data: vec![0xAA, 0xBB],
        };
        assert_eq!(data.to_bytes(), vec![0x00, 0x03, 0x00, 0x07, 0xAA, 0xBB]);

        let ack = Packet::Ack { block: 0x0102 };
        assert_eq!(ack.to_bytes(), vec![0x00, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn test_encode_error() {
        let packet = Packet::Error {
            code: ErrorCode::UnknownTid,
            message: "unknown transfer id".to_string(),
        };
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x00, 0x05]);
        assert_eq!(bytes.last(), Some(&0x00));
        assert_eq!(Packet::parse_from_buf(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_encode_oack_canonical_order() {
        let packet = Packet::OptionsAck(ReqOptions {
            block_size: Some(1024),
            timeout: Some(2),
            tsize: Some(99),
        });
        let expected = [
            &[0x00, 0x06][..],
            b"blksize\0",
            b"1024\0",
            b"timeout\0",
            b"2\0",
            b"tsize\0",
            b"99\0",
        ]
        .concat();
        assert_eq!(packet.to_bytes(), expected);
    }
}
