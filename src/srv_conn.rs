// This module contains the server-side connection handler.
//
// A connection handler is created when the dispatcher sees a ReadReq or a
// WriteReq from a previously-unknown peer. It binds its own ephemeral UDP
// socket; the port of that socket is the session's transfer id (TID) and
// every packet after the initial request flows through it. The handler works
// in roughly the following stages:
//
// 1. Check whether the request can be serviced by interacting with the file
//    handler (existence checks, stream opening, option validation).
// 2. Enter a phase of work and wait cycles: send a packet, then wait for the
//    peer to answer it within the negotiated per-packet timeout,
//    retransmitting on expiry up to the retry budget.
// 3. Eventually the transfer enters a terminal phase: the final-ACK exchange
//    with its duplicate-listening window, an error packet in either
//    direction, or an exhausted retry budget.
//
// The read side sends data packets and waits for acks; the write side sends
// acks and waits for data packets. Both are driven by the shared
// PacketProcessor state machine, so this module only deals with sockets,
// timers, and peer identity.

use crate::handler::FileHandler;
use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// How many consecutive timeout periods a session will retransmit the
/// in-flight packet before giving up on the peer.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Shared between a session and the dispatcher's reaper: when the peer was
/// last heard from, the negotiated idle timeout, and whether the session has
/// already run to completion.
pub struct SessionActivity {
    last_seen: Mutex<std::time::Instant>,
    timeout: Mutex<Duration>,
    done: AtomicBool,
}

impl SessionActivity {
    pub fn new(timeout: Duration) -> SessionActivity {
        SessionActivity {
            last_seen: Mutex::new(std::time::Instant::now()),
            timeout: Mutex::new(timeout),
            done: AtomicBool::new(false),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = std::time::Instant::now();
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Whether the peer has been silent for longer than its negotiated
    /// timeout allows.
    pub fn is_expired(&self) -> bool {
        let idle = self.last_seen.lock().unwrap().elapsed();
        idle > *self.timeout.lock().unwrap()
    }
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive packets; its local port is
    /// the session's TID.
    sock: tftp::TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The packet processor.
    processor: PacketProcessor,

    /// The negotiated per-packet timeout.
    timeout: Duration,

    /// Liveness record shared with the dispatcher's reaper.
    activity: Arc<SessionActivity>,
}

/// Attempts to bind to a random UDP socket until one succeeds.
fn bind_random_socket() -> tftp::TftpSocket {
    let mut rng = rand::thread_rng();
    let mut sock = tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into());
    while sock.is_err() {
        log::warn!("Couldn't bind socket: {:#?}", sock);
        sock = tftp::TftpSocket::bind(
            (Ipv4Addr::UNSPECIFIED, rand::thread_rng().gen_range(1024..65535)).into(),
        );
    }
    sock.unwrap()
}

async fn send_error_packet(
    sock: &mut tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

impl ServerRequestHandler {
    pub async fn new(
        handler: &dyn FileHandler,
        initial_request: &tftp::Packet,
        src: SocketAddr,
        activity: Arc<SessionActivity>,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let mut sock = bind_random_socket();
        match initial_request {
            tftp::Packet::ReadReq {
                path,
                mode: _,
                options,
            } => {
                match handler.is_file_exist(src, path).await {
                    Ok(false) => {
                        send_error_packet(
                            &mut sock,
                            src,
                            tftp::ErrorCode::FileNotFound,
                            format!("file not found: {path}"),
                        )
                        .await;
                        return Err(ServerConnectionError::BadRequest(format!(
                            "Peer requested missing file {path}"
                        )));
                    }
                    Ok(true) => {}
                    Err(e) => {
                        send_error_packet(&mut sock, src, e.kind().into(), format!("{:#?}", e))
                            .await;
                        return Err(e.into());
                    }
                }

                let stream = match handler.read_file(src, path).await {
                    Ok(s) => s,
                    Err(e) => {
                        send_error_packet(&mut sock, src, e.kind().into(), format!("{:#?}", e))
                            .await;
                        return Err(e.into());
                    }
                };
                let processor = match PacketProcessor::new_for_reading(stream, *options) {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(
                            &mut sock,
                            src,
                            tftp::ErrorCode::Undefined,
                            e.to_string(),
                        )
                        .await;
                        return Err(ServerConnectionError::BadRequest(e.to_string()));
                    }
                };

                let timeout = Duration::from_secs(options.effective_timeout_secs());
                activity.set_timeout(timeout);
                Ok(ServerRequestHandler {
                    sock,
                    dst: src,
                    processor,
                    timeout,
                    activity,
                })
            }
            tftp::Packet::WriteReq {
                path,
                mode: _,
                options,
            } => {
                match handler.is_file_exist(src, path).await {
                    Ok(true) => {
                        send_error_packet(
                            &mut sock,
                            src,
                            tftp::ErrorCode::FileAlreadyExists,
                            format!("file already exists: {path}"),
                        )
                        .await;
                        return Err(ServerConnectionError::BadRequest(format!(
                            "Peer attempted to overwrite {path}"
                        )));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        send_error_packet(&mut sock, src, e.kind().into(), format!("{:#?}", e))
                            .await;
                        return Err(e.into());
                    }
                }

                let stream = match handler.write_file(src, path).await {
                    Ok(s) => s,
                    Err(e) => {
                        send_error_packet(&mut sock, src, e.kind().into(), format!("{:#?}", e))
                            .await;
                        return Err(e.into());
                    }
                };
                let processor = match PacketProcessor::new_for_writing(stream, *options) {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(
                            &mut sock,
                            src,
                            tftp::ErrorCode::Undefined,
                            e.to_string(),
                        )
                        .await;
                        return Err(ServerConnectionError::BadRequest(e.to_string()));
                    }
                };

                let timeout = Duration::from_secs(options.effective_timeout_secs());
                activity.set_timeout(timeout);
                Ok(ServerRequestHandler {
                    sock,
                    dst: src,
                    processor,
                    timeout,
                    activity,
                })
            }
            _ => Err(ServerConnectionError::BadRequest(
                "Only read and write requests are valid initial requests.".to_string(),
            )),
        }
    }

    /// The session's transfer id: the local port of its ephemeral socket.
    pub fn tid(&self) -> Option<u16> {
        self.sock.local_addr().ok().map(|a| a.port())
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(&mut self, max_retries: u32) {
        let mut out_packet = match self.processor.first_packet().await {
            ResultAction::CloseConnection(_) | ResultAction::RetryRecv => {
                log::error!("Packet processor said we should close the connection or retry receipt before the first message was sent. This should never happen!");
                send_error_packet(
                    &mut self.sock,
                    self.dst,
                    tftp::ErrorCode::Undefined,
                    "Internal error, please retry".to_string(),
                )
                .await;
                self.activity.mark_done();
                return;
            }
            ResultAction::SendPacketAndAwait(p) => p,
            ResultAction::TerminateWithPacket(p) => {
                log::warn!("Terminating request to {:#?} and sending packet {:#?}", self.dst, p);
                let _ = self.sock.send(&p, self.dst).await;
                self.activity.mark_done();
                return;
            }
            ResultAction::FinishWithPacket(p) => {
                let _ = self.sock.send(&p, self.dst).await;
                self.linger_for_duplicate(&p).await;
                self.activity.mark_done();
                return;
            }
        };

        let mut retries = 0u32;

        // This loop is used for message sending as well as retries, depending on whether
        // |out_packet| has been overwritten.
        'send: loop {
            if let Err(e) = self.sock.send(&out_packet, self.dst).await {
                log::warn!("Unable to send packet: {e}");
                break 'send;
            }

            let started_waiting = Instant::now();
            while started_waiting.elapsed() < self.timeout {
                match self.sock.recv_with_timeout(Duration::from_millis(500)).await {
                    Ok((packet, src)) => {
                        log::debug!("Got packet from {:#?}: {:#?}", src, packet);
                        // First, check whether the data came from the peer this
                        // session is locked to. Anybody else is a different
                        // transfer knocking on the wrong port.
                        if src != self.dst {
                            send_error_packet(
                                &mut self.sock,
                                src,
                                tftp::ErrorCode::UnknownTid,
                                "unknown transfer id".to_string(),
                            )
                            .await;
                            // Continue waiting for a good packet from the expected peer.
                            continue;
                        }

                        self.activity.touch();

                        // Next, figure out how to respond.
                        match self.processor.process_packet(&packet).await {
                            ResultAction::SendPacketAndAwait(p) => {
                                out_packet = p;
                                retries = 0;
                                continue 'send;
                            }
                            ResultAction::CloseConnection(maybe_warn) => {
                                if let Some(msg) = maybe_warn {
                                    log::warn!("{}", msg);
                                }
                                log::info!("Closing connection with {:#?}", src);
                                // No more packets to send, our work here is done!
                                break 'send;
                            }
                            ResultAction::RetryRecv => {
                                continue;
                            }
                            ResultAction::TerminateWithPacket(p) => {
                                let _ = self.sock.send(&p, src).await;
                                log::info!("Closing connection with {:#?}", src);
                                break 'send;
                            }
                            ResultAction::FinishWithPacket(p) => {
                                let _ = self.sock.send(&p, src).await;
                                self.linger_for_duplicate(&p).await;
                                log::info!("Transfer with {:#?} complete", src);
                                break 'send;
                            }
                        }
                    }
                    // Nothing yet; keep waiting out the timeout period.
                    Err(tftp::SocketError::Timeout(_)) => {
                        continue;
                    }
                    // If we couldn't parse the incoming packet, send an error and kill the
                    // connection.
                    Err(tftp::SocketError::PacketParse(msg)) => {
                        send_error_packet(
                            &mut self.sock,
                            self.dst,
                            tftp::ErrorCode::Illegal,
                            format!("Error parsing incoming packet: {msg}"),
                        )
                        .await;
                        break 'send;
                    }
                    Err(tftp::SocketError::BadOption(msg)) => {
                        send_error_packet(&mut self.sock, self.dst, tftp::ErrorCode::Undefined, msg)
                            .await;
                        break 'send;
                    }
                    // If we had an I/O error involving the socket, send an error and kill the
                    // connection.
                    Err(tftp::SocketError::IO(e)) => {
                        send_error_packet(
                            &mut self.sock,
                            self.dst,
                            tftp::ErrorCode::Undefined,
                            format!("I/O error: {:#?}", e),
                        )
                        .await;
                        break 'send;
                    }
                }
            }

            // The peer stayed silent for a whole timeout period; retransmit
            // the in-flight packet until the budget runs out.
            retries += 1;
            if retries > max_retries {
                log::warn!(
                    "Giving up on {:#?} after {} retransmissions",
                    self.dst,
                    max_retries
                );
                break 'send;
            }
            log::debug!("Timed out waiting for {:#?}, retransmitting", self.dst);
        }

        self.activity.mark_done();
    }

    /// The final-ACK window: the peer may never have seen our last ACK, in
    /// which case it will retransmit the final DATA. Listen for one timeout
    /// period and answer such a duplicate at most once.
    async fn linger_for_duplicate(&mut self, final_ack: &tftp::Packet) {
        let final_block = match final_ack {
            tftp::Packet::Ack { block } => *block,
            _ => return,
        };

        let started_waiting = Instant::now();
        while started_waiting.elapsed() < self.timeout {
            match self.sock.recv_with_timeout(Duration::from_millis(500)).await {
                Ok((tftp::Packet::Data { block, .. }, src))
                    if src == self.dst && block == final_block =>
                {
                    let _ = self.sock.send(final_ack, self.dst).await;
                    return;
                }
                Ok(_) | Err(tftp::SocketError::Timeout(_)) => continue,
                Err(_) => return,
            }
        }
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Internal(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {:#?}", msg),
            Self::File(e) => write!(f, "File IO error: {:#?}", e),
            Self::Internal(msg) => write!(f, "Internal error: {:#?}", msg),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}
