// The server dispatcher. It owns the well-known UDP port and runs three
// cooperating activities:
//
//  - the receiver reads datagrams into pooled buffers and pushes them onto a
//    bounded queue; when the queue is full, newly arriving datagrams are
//    dropped so backpressure lands in the OS socket buffer rather than in
//    unbounded process memory;
//  - the worker drains the queue, decodes each datagram, and either spawns a
//    new per-peer session (RRQ/WRQ from an unknown address) or answers
//    pre-session failures with an ERROR packet;
//  - the reaper sweeps the peer registry every 100 ms, evicting sessions
//    that finished or whose peers have been idle longer than their
//    negotiated timeout.
//
// Sessions themselves run on their own ephemeral sockets (see srv_conn), so
// after the initial request all transfer traffic bypasses this module.

use crate::buffer_pool::BufferPool;
use crate::handler::FileHandler;
use crate::options::DEFAULT_TIMEOUT_SECS;
use crate::srv_conn::{ServerRequestHandler, SessionActivity, DEFAULT_MAX_RETRIES};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpResult};
use async_io::Async;
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;

/// How often the reaper sweeps the peer registry.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a single receive on the well-known socket may block before
    /// the receiver loops (and notices a pending shutdown).
    pub read_timeout: Duration,

    /// Depth of the receiver-to-worker queue.
    pub queue_depth: usize,

    /// Size of each pooled receive buffer. Initial requests are small;
    /// session sockets size their own buffers for the negotiated block.
    pub buf_size: usize,

    /// How many buffers the pool retains.
    pub pool_size: usize,

    /// Retransmission budget handed to each session.
    pub max_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            read_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64),
            queue_depth: 1024,
            buf_size: 2048,
            pool_size: 32,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

struct PeerEntry {
    activity: Arc<SessionActivity>,
    task: JoinHandle<()>,
}

type PeerMap = HashMap<SocketAddr, PeerEntry>;

/// A TFTP server bound to its well-known port.
pub struct Server {
    sock: Arc<Async<UdpSocket>>,
    handler: Arc<dyn FileHandler>,
    config: ServerConfig,
    peers: Arc<Mutex<PeerMap>>,
    pool: Arc<BufferPool>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    pub fn new(
        addr: SocketAddr,
        handler: Arc<dyn FileHandler>,
        config: ServerConfig,
    ) -> TftpResult<Server> {
        let sock = Async::<UdpSocket>::bind(addr)?;
        let pool = Arc::new(BufferPool::new(config.buf_size, config.pool_size));
        let (shutdown, _) = broadcast::channel(1);
        Ok(Server {
            sock: Arc::new(sock),
            handler,
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            pool,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Signals all server activities to exit. In-flight sessions are aborted.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
        let entries: Vec<PeerEntry> = {
            let mut peers = self.peers.lock().unwrap();
            peers.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.task.abort();
        }
    }

    /// Runs the receiver loop, spawning the worker and reaper alongside it.
    /// Returns when `close` is called or the well-known socket fails.
    pub async fn run(&self) -> TftpResult<()> {
        let (queue_tx, queue_rx) = mpsc::channel::<(BytesMut, SocketAddr)>(self.config.queue_depth);

        let worker = tokio::spawn(Self::work(
            queue_rx,
            self.shutdown.subscribe(),
            self.sock.clone(),
            self.handler.clone(),
            self.peers.clone(),
            self.pool.clone(),
            self.config.max_retries,
        ));
        let reaper = tokio::spawn(Self::remove_idle_peers(
            self.peers.clone(),
            self.shutdown.subscribe(),
        ));

        let result = self.recv_loop(queue_tx).await;

        // Make sure the helpers exit even when the receiver died on its own.
        let _ = self.shutdown.send(());
        let _ = worker.await;
        let _ = reaper.await;
        result
    }

    async fn recv_loop(&self, queue_tx: mpsc::Sender<(BytesMut, SocketAddr)>) -> TftpResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let mut buf = self.pool.get_from_pool();
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                recvd = time::timeout(self.config.read_timeout, self.sock.recv_from(&mut buf)) => {
                    match recvd {
                        // Quiet wire; recycle the buffer and go around again.
                        Err(_elapsed) => self.pool.return_to_pool(buf),
                        Ok(Ok((n, raddr))) => {
                            buf.truncate(n);
                            if let Err(e) = queue_tx.try_send((buf, raddr)) {
                                log::warn!("dispatch queue full, dropping datagram from {raddr}");
                                let (buf, _) = e.into_inner();
                                self.pool.return_to_pool(buf);
                            }
                        }
                        Ok(Err(e)) => {
                            log::error!("receive on the well-known socket failed: {e}");
                            return Err(SocketError::IO(e));
                        }
                    }
                }
            }
        }
    }

    async fn work(
        mut queue_rx: mpsc::Receiver<(BytesMut, SocketAddr)>,
        mut shutdown: broadcast::Receiver<()>,
        sock: Arc<Async<UdpSocket>>,
        handler: Arc<dyn FileHandler>,
        peers: Arc<Mutex<PeerMap>>,
        pool: Arc<BufferPool>,
        max_retries: u32,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                item = queue_rx.recv() => {
                    let Some((buf, raddr)) = item else { return };
                    Self::dispatch(&buf, raddr, &sock, &handler, &peers, max_retries).await;
                    pool.return_to_pool(buf);
                }
            }
        }
    }

    async fn dispatch(
        buf: &[u8],
        raddr: SocketAddr,
        sock: &Async<UdpSocket>,
        handler: &Arc<dyn FileHandler>,
        peers: &Arc<Mutex<PeerMap>>,
        max_retries: u32,
    ) {
        let packet = match Packet::parse_from_buf(buf) {
            Ok(p) => p,
            Err(SocketError::BadOption(msg)) => {
                send_error(sock, raddr, ErrorCode::Undefined, &msg).await;
                return;
            }
            Err(e) => {
                send_error(sock, raddr, ErrorCode::Illegal, &e.to_string()).await;
                return;
            }
        };

        match packet {
            Packet::ReadReq { .. } | Packet::WriteReq { .. } => {
                {
                    let peers = peers.lock().unwrap();
                    if let Some(entry) = peers.get(&raddr) {
                        if !entry.activity.is_done() {
                            // A retransmitted request from a peer whose session is
                            // already up; the session owns the exchange on its TID.
                            log::debug!("duplicate request from {raddr}, ignoring");
                            return;
                        }
                    }
                }

                let activity = Arc::new(SessionActivity::new(Duration::from_secs(
                    DEFAULT_TIMEOUT_SECS as u64,
                )));
                let mut conn =
                    match ServerRequestHandler::new(handler.as_ref(), &packet, raddr, activity.clone())
                        .await
                    {
                        Ok(conn) => conn,
                        Err(e) => {
                            // The handler already answered the peer with an
                            // appropriate ERROR packet.
                            log::warn!("refused request from {raddr}: {e}");
                            return;
                        }
                    };
                log::info!("new transfer with {raddr} <tid={:?}>", conn.tid());

                let task = tokio::spawn(async move {
                    conn.handle(max_retries).await;
                });
                peers
                    .lock()
                    .unwrap()
                    .insert(raddr, PeerEntry { activity, task });
            }
            _ => {
                let known = peers.lock().unwrap().contains_key(&raddr);
                if !known {
                    // Transfer traffic belongs on a session's ephemeral port,
                    // not here.
                    send_error(sock, raddr, ErrorCode::Illegal, "illegal operation").await;
                }
            }
        }
    }

    async fn remove_idle_peers(peers: Arc<Mutex<PeerMap>>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    // Collect the victims under the lock, close them after
                    // releasing it.
                    let victims: Vec<(SocketAddr, PeerEntry)> = {
                        let mut peers = peers.lock().unwrap();
                        let expired: Vec<SocketAddr> = peers
                            .iter()
                            .filter(|(_, e)| e.activity.is_done() || e.activity.is_expired())
                            .map(|(addr, _)| *addr)
                            .collect();
                        expired
                            .into_iter()
                            .filter_map(|addr| peers.remove(&addr).map(|e| (addr, e)))
                            .collect()
                    };

                    for (addr, entry) in victims {
                        if entry.activity.is_done() {
                            log::debug!("transfer with {addr} finished, removing");
                        } else {
                            log::info!("timeout, remote: {addr}");
                            entry.task.abort();
                        }
                    }
                }
            }
        }
    }
}

async fn send_error(sock: &Async<UdpSocket>, dst: SocketAddr, code: ErrorCode, message: &str) {
    let packet = Packet::Error {
        code,
        message: message.to_string(),
    };
    let _ = sock.send_to(&packet.to_bytes(), dst).await;
}
