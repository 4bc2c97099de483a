// Single-shot GET and PUT transactions. The client binds its own ephemeral
// socket, sends the initial request to the server's well-known port, and
// from the first reply onward talks exclusively to whatever source address
// the server answered from: that address carries the server's transfer id
// for this exchange, and datagrams from anybody else are answered with
// ERROR(5) without disturbing the transfer.

use crate::options::{ReqOptions, DEFAULT_BLOCK_SIZE};
use crate::tftp::{ErrorCode, FileMode, Packet, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-packet response timeout.
    pub timeout: Duration,

    /// How many consecutive timeouts to tolerate before giving up.
    pub retries: u32,

    /// Options to request from the server. The server may grant them via
    /// OACK, or ignore them and answer the plain RFC 1350 way.
    pub options: ReqOptions,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(3),
            retries: 3,
            options: ReqOptions::none(),
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    Socket(SocketError),
    /// The server answered with an ERROR packet.
    Remote { code: ErrorCode, message: String },
    /// The server misbehaved in a way an ERROR packet doesn't cover.
    Protocol(String),
    /// The retry budget ran out without an answer.
    Timeout,
    File(io::Error),
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::Socket(e) => write!(f, "Socket error: {e}"),
            ClientError::Remote { code, message } => {
                write!(f, "Server error: {:?}: {message}", code)
            }
            ClientError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            ClientError::Timeout => write!(f, "Timed out waiting for the server"),
            ClientError::File(e) => write!(f, "File IO error: {e}"),
        }
    }
}

impl From<SocketError> for ClientError {
    fn from(e: SocketError) -> Self {
        ClientError::Socket(e)
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::File(e)
    }
}

type ClientResult<T> = Result<T, ClientError>;

/// A TFTP client performing one transfer at a time against a single server.
pub struct Client {
    sock: TftpSocket,
    remote_addr: SocketAddr,
    config: ClientConfig,
}

impl Client {
    pub fn new(remote_addr: SocketAddr, config: ClientConfig) -> ClientResult<Client> {
        let sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
        Ok(Client {
            sock,
            remote_addr,
            config,
        })
    }

    /// Reads `file_name` from the server into `writer`. Returns the number
    /// of bytes transferred.
    pub async fn get<W>(&mut self, file_name: &str, writer: &mut W) -> ClientResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let request = Packet::ReadReq {
            path: file_name.to_string(),
            mode: FileMode::Octet,
            options: self.config.options,
        };
        log::info!("begin RRQ <fileName={file_name}, to={}>", self.remote_addr);
        self.sock.send(&request, self.remote_addr).await?;

        // Until the server answers we only know its well-known address; the
        // first reply locks the exchange to the server's TID.
        let mut peer: Option<SocketAddr> = None;
        // The requested block size only takes effect if the server grants it
        // in an OACK; a server that answers with plain DATA is talking RFC
        // 1350 and means 512.
        let requested_block_size = self.config.options.effective_block_size();
        let mut block_size = DEFAULT_BLOCK_SIZE as usize;
        let mut timeout = self.config.timeout;
        let mut expected_block: u16 = 1;
        let mut written: u64 = 0;
        let mut last_sent = request;
        let mut retries = 0u32;

        loop {
            let (packet, src) = match self.sock.recv_with_timeout(timeout).await {
                Ok(recvd) => recvd,
                Err(SocketError::Timeout(_)) => {
                    retries += 1;
                    if retries > self.config.retries {
                        return Err(ClientError::Timeout);
                    }
                    log::debug!("timed out, retransmitting <retry={retries}>");
                    self.sock.send(&last_sent, peer.unwrap_or(self.remote_addr)).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(locked) = peer {
                if src != locked {
                    self.send_error(src, ErrorCode::UnknownTid, "unknown transfer id")
                        .await;
                    continue;
                }
            } else {
                peer = Some(src);
            }
            retries = 0;

            match packet {
                Packet::OptionsAck(granted) => {
                    if self.config.options.is_none() || expected_block != 1 || written != 0 {
                        self.send_error(src, ErrorCode::Illegal, "unexpected OACK").await;
                        return Err(ClientError::Protocol(
                            "Server sent an OACK we did not negotiate for".to_string(),
                        ));
                    }
                    if granted.effective_block_size() > requested_block_size {
                        self.send_error(src, ErrorCode::Undefined, "invalid blocksize opt")
                            .await;
                        return Err(ClientError::Protocol(format!(
                            "Server granted block size {} above the requested {}",
                            granted.effective_block_size(),
                            requested_block_size
                        )));
                    }
                    block_size = granted.effective_block_size();
                    if granted.timeout.is_some() {
                        timeout = Duration::from_secs(granted.effective_timeout_secs());
                    }
                    log::debug!("recv OACK <blksize={block_size}>");

                    last_sent = Packet::Ack { block: 0 };
                    self.sock.send(&last_sent, src).await?;
                }
                Packet::Data { block, data } => {
                    if block == expected_block {
                        writer.write_all(&data).await?;
                        written += data.len() as u64;
                        log::debug!("recv DQ <blockID={block}, {}bytes>", data.len());

                        last_sent = Packet::Ack { block };
                        self.sock.send(&last_sent, src).await?;

                        if data.len() < block_size {
                            self.linger_for_final_data(src, &last_sent, timeout).await;
                            writer.flush().await?;
                            log::info!("end RRQ <{written}bytes>");
                            return Ok(written);
                        }
                        if expected_block == u16::MAX {
                            return Err(ClientError::Protocol(
                                "Transfer exceeds the maximum block count".to_string(),
                            ));
                        }
                        expected_block += 1;
                    } else if block < expected_block {
                        // A stale retransmit; never re-ack it, or we'd start
                        // the Sorcerer's Apprentice feedback loop. Our own
                        // timeout path re-sends the last ack if needed.
                        log::debug!("ignoring duplicate DQ <blockID={block}>");
                    } else {
                        self.send_error(src, ErrorCode::Illegal, "data received out of order")
                            .await;
                        return Err(ClientError::Protocol(format!(
                            "Expected block {expected_block}, got {block}"
                        )));
                    }
                }
                Packet::Error { code, message } => {
                    return Err(ClientError::Remote { code, message });
                }
                _ => {
                    self.send_error(src, ErrorCode::Illegal, "illegal operation").await;
                    return Err(ClientError::Protocol(
                        "Expected a Data packet".to_string(),
                    ));
                }
            }
        }
    }

    /// Writes `reader` to `file_name` on the server. Returns the number of
    /// bytes transferred.
    pub async fn put<R>(&mut self, file_name: &str, reader: &mut R) -> ClientResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let request = Packet::WriteReq {
            path: file_name.to_string(),
            mode: FileMode::Octet,
            options: self.config.options,
        };
        log::info!("begin WRQ <fileName={file_name}, to={}>", self.remote_addr);
        self.sock.send(&request, self.remote_addr).await?;

        let mut timeout = self.config.timeout;
        let requested_block_size = self.config.options.effective_block_size();
        // Stays at the default unless the server grants more in an OACK.
        let mut block_size = DEFAULT_BLOCK_SIZE as usize;

        // Negotiation: a plain server answers ACK(0); an option-aware one
        // sends an OACK when we asked for options.
        let peer = {
            let mut retries = 0u32;
            loop {
                match self.sock.recv_with_timeout(timeout).await {
                    Ok((Packet::Ack { block: 0 }, src)) => break src,
                    Ok((Packet::OptionsAck(granted), src)) => {
                        if self.config.options.is_none() {
                            self.send_error(src, ErrorCode::Illegal, "unexpected OACK").await;
                            return Err(ClientError::Protocol(
                                "Server sent an OACK we did not negotiate for".to_string(),
                            ));
                        }
                        if granted.effective_block_size() > requested_block_size {
                            self.send_error(src, ErrorCode::Undefined, "invalid blocksize opt")
                                .await;
                            return Err(ClientError::Protocol(format!(
                                "Server granted block size {} above the requested {}",
                                granted.effective_block_size(),
                                requested_block_size
                            )));
                        }
                        block_size = granted.effective_block_size();
                        if granted.timeout.is_some() {
                            timeout = Duration::from_secs(granted.effective_timeout_secs());
                        }
                        break src;
                    }
                    Ok((Packet::Error { code, message }, _)) => {
                        return Err(ClientError::Remote { code, message });
                    }
                    Ok((_, src)) => {
                        self.send_error(src, ErrorCode::Illegal, "illegal operation").await;
                        return Err(ClientError::Protocol(
                            "Expected an Ack or an OACK".to_string(),
                        ));
                    }
                    Err(SocketError::Timeout(_)) => {
                        retries += 1;
                        if retries > self.config.retries {
                            return Err(ClientError::Timeout);
                        }
                        self.sock.send(&request, self.remote_addr).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        log::debug!("negotiation complete <peer={peer}, blksize={block_size}>");

        let mut block: u16 = 1;
        let mut sent: u64 = 0;
        loop {
            let data = read_block(reader, block_size).await?;
            let is_final = data.len() < block_size;
            let data_len = data.len() as u64;
            let packet = Packet::Data { block, data };
            self.sock.send(&packet, peer).await?;
            log::debug!("send DQ <blockID={block}, {data_len}bytes>");

            self.await_ack(peer, &packet, block, timeout).await?;
            sent += data_len;

            if is_final {
                log::info!("end WRQ <{sent}bytes>");
                return Ok(sent);
            }
            if block == u16::MAX {
                return Err(ClientError::Protocol(
                    "Transfer exceeds the maximum block count".to_string(),
                ));
            }
            block += 1;
        }
    }

    /// Waits for the ack of the in-flight DATA packet, retransmitting it on
    /// timeout within the retry budget.
    async fn await_ack(
        &mut self,
        peer: SocketAddr,
        in_flight: &Packet,
        block: u16,
        timeout: Duration,
    ) -> ClientResult<()> {
        let mut retries = 0u32;
        loop {
            match self.sock.recv_with_timeout(timeout).await {
                Ok((packet, src)) => {
                    if src != peer {
                        self.send_error(src, ErrorCode::UnknownTid, "unknown transfer id")
                            .await;
                        continue;
                    }
                    match packet {
                        Packet::Ack { block: acked } if acked == block => return Ok(()),
                        Packet::Ack { block: acked } if acked < block => {
                            // Stale ack from an earlier round trip.
                            log::debug!("ignoring stale ack <blockID={acked}>");
                        }
                        Packet::OptionsAck(_) if block == 1 => {
                            // The server never saw our first DATA and is
                            // repeating its OACK; the retransmit path will
                            // answer it.
                            log::debug!("ignoring repeated OACK");
                        }
                        Packet::Error { code, message } => {
                            return Err(ClientError::Remote { code, message });
                        }
                        _ => {
                            self.send_error(src, ErrorCode::Illegal, "illegal operation").await;
                            return Err(ClientError::Protocol(
                                "Expected an Ack packet".to_string(),
                            ));
                        }
                    }
                }
                Err(SocketError::Timeout(_)) => {
                    retries += 1;
                    if retries > self.config.retries {
                        return Err(ClientError::Timeout);
                    }
                    log::debug!("timed out, retransmitting DQ <blockID={block}>");
                    self.sock.send(in_flight, peer).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// After the final ack of a GET, the server may retransmit the last DATA
    /// if our ack was lost. Listen for one timeout period and answer such a
    /// duplicate at most once.
    async fn linger_for_final_data(
        &mut self,
        peer: SocketAddr,
        final_ack: &Packet,
        timeout: Duration,
    ) {
        let final_block = match final_ack {
            Packet::Ack { block } => *block,
            _ => return,
        };
        let started_waiting = Instant::now();
        while started_waiting.elapsed() < timeout {
            match self.sock.recv_with_timeout(Duration::from_millis(500)).await {
                Ok((Packet::Data { block, .. }, src)) if src == peer && block == final_block => {
                    let _ = self.sock.send(final_ack, peer).await;
                    return;
                }
                Ok(_) | Err(SocketError::Timeout(_)) => continue,
                Err(_) => return,
            }
        }
    }

    async fn send_error(&mut self, dst: SocketAddr, code: ErrorCode, message: &str) {
        // Sent as a courtesy; failures don't matter.
        let _ = self
            .sock
            .send(
                &Packet::Error {
                    code,
                    message: message.to_string(),
                },
                dst,
            )
            .await;
    }
}

/// Fills a block from the reader, tolerating short reads; a block shorter
/// than `block_size` (possibly empty) means the source is exhausted.
async fn read_block<R>(reader: &mut R, block_size: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;
    loop {
        match reader.read(&mut buf[cursor..]).await {
            Ok(0) => {
                buf.truncate(cursor);
                return Ok(buf);
            }
            Ok(n) => {
                cursor += n;
                if cursor == buf.len() {
                    return Ok(buf);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
