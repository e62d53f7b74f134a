//! # Datagram Plane
//!
//! One UDP socket, three long-running tasks:
//!
//! - the **receive loop** reads packets, decodes them, schedules a "welcome"
//!   for the source peer, and classifies each datagram by its direction bit
//! - the **request handler** answers inbound requests by kind
//! - the **response handler** matches inbound responses against the cookie
//!   table and delivers them to whoever is waiting
//!
//! The probe RPC registers a cookie, fires a request, and blocks on its reply
//! sink; the cookie sweep closing that sink is the only timeout. Every
//! internal failure maps to `false`, which reads the same as an unresponsive
//! peer, and that is precisely what the eviction path wants to know.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::cookies::{CookieTable, CookieTableConfig};
use crate::datagram::{Datagram, Kind, MAX_DATAGRAM_SIZE, MIN_DATAGRAM_SIZE};
use crate::identity::Peer;
use crate::routing::{Prober, RoutingTable};

/// Inbound requests queued for the request handler.
pub const REQUEST_QUEUE_LEN: usize = 16;

/// Inbound responses queued for the response handler.
pub const RESPONSE_QUEUE_LEN: usize = 16;

/// Port a peer listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 54321;

struct ServerInner {
    socket: UdpSocket,
    routing: RoutingTable,
    cookies: CookieTable,
    self_peer: Peer,
    shutdown: watch::Sender<bool>,
}

/// Handle to a running (or startable) peer. Cheap to clone; all clones share
/// the same socket and tables.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind the UDP socket and attach the routing table. Call
    /// [`Server::start`] to begin serving.
    pub async fn bind(addr: SocketAddr, routing: RoutingTable) -> Result<Server> {
        Self::bind_with_config(addr, routing, CookieTableConfig::default()).await
    }

    /// [`Server::bind`] with explicit correlation timeouts. Tests shrink them
    /// so probe timeouts are observable.
    pub async fn bind_with_config(
        addr: SocketAddr,
        routing: RoutingTable,
        config: CookieTableConfig,
    ) -> Result<Server> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP socket on {addr}"))?;
        let self_peer = routing.self_peer().await;
        let (shutdown, _) = watch::channel(false);
        Ok(Server {
            inner: Arc::new(ServerInner {
                socket,
                routing,
                cookies: CookieTable::with_config(config),
                self_peer,
                shutdown,
            }),
        })
    }

    /// Launch the receive loop and both handlers.
    pub fn start(&self) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_LEN);
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_LEN);
        tokio::spawn(receive_loop(self.clone(), request_tx, response_tx));
        tokio::spawn(request_loop(self.clone(), request_rx));
        tokio::spawn(response_loop(self.clone(), response_rx));
    }

    /// Ask the receive loop to exit and stop the cookie sweep. Handler tasks
    /// drain and finish once the receive loop drops their queues.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.cookies.shutdown();
    }

    /// The local peer descriptor.
    pub fn self_peer(&self) -> Peer {
        self.inner.self_peer
    }

    /// The bucket tree this server feeds.
    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    /// Address the UDP socket actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.socket.local_addr().context("reading bound address")
    }

    /// Send a liveness probe and wait for the answer.
    ///
    /// `true` means a response carrying our cookie came back before the sweep
    /// gave up on it. There are no retries.
    pub async fn probe(&self, peer: &Peer) -> bool {
        let cookie = match crate::identity::Cookie::random() {
            Ok(cookie) => cookie,
            Err(err) => {
                warn!(%err, "probe aborted, no cookie");
                return false;
            }
        };
        let request = Datagram::request(Kind::Probe, cookie, self.inner.self_peer, Vec::new());
        let wire = match request.encode() {
            Ok(wire) => wire,
            Err(err) => {
                warn!(%err, "probe aborted, unencodable datagram");
                return false;
            }
        };

        let (sink, mut reply) = mpsc::channel(1);
        if self.inner.cookies.register(cookie, sink).await.is_err() {
            debug!("probe aborted, cookie collision");
            return false;
        }
        if let Err(err) = self.inner.socket.send_to(&wire, peer.addr).await {
            debug!(%err, peer = %peer.id, "probe send failed");
            return false;
        }
        trace!(peer = %peer.id, "probe sent, waiting");
        reply.recv().await.is_some()
    }

    /// Put a datagram's source peer into the routing table.
    async fn welcome(&self, source: Peer) {
        self.inner.routing.add(source.id, source.addr, self).await;
    }

    /// Answer one probe request: same cookie, response direction, empty
    /// payload, sent to the address the request arrived from.
    async fn answer_probe(&self, request: Datagram) {
        let reply = Datagram::response(Kind::Probe, request.cookie, self.inner.self_peer, Vec::new());
        let wire = match reply.encode() {
            Ok(wire) => wire,
            Err(err) => {
                warn!(%err, "probe reply dropped, unencodable");
                return;
            }
        };
        match self.inner.socket.send_to(&wire, request.source.addr).await {
            Ok(_) => trace!(peer = %request.source.id, "probe reply sent"),
            Err(err) => debug!(%err, peer = %request.source.id, "probe reply send failed"),
        }
    }
}

#[async_trait]
impl Prober for Server {
    async fn probe(&self, peer: &Peer) -> bool {
        Server::probe(self, peer).await
    }
}

/// Read one packet per iteration until shutdown. Read errors and short
/// packets are dropped without ceremony.
async fn receive_loop(
    server: Server,
    request_tx: mpsc::Sender<Datagram>,
    response_tx: mpsc::Sender<Datagram>,
) {
    let mut shutdown = server.inner.shutdown.subscribe();
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.changed() => break,
            received = server.inner.socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "datagram receive failed");
                    continue;
                }
            },
        };
        if len < MIN_DATAGRAM_SIZE {
            trace!(len, %src, "dropping short datagram");
            continue;
        }
        let datagram = match Datagram::decode(&buf[..len], src) {
            Ok(datagram) => datagram,
            Err(err) => {
                trace!(%err, %src, "dropping undecodable datagram");
                continue;
            }
        };

        // Welcome every sender except one answering our own probe: that peer
        // is already being handled by the caller awaiting the response.
        if datagram.kind != Kind::Probe || datagram.is_request {
            let server = server.clone();
            let source = datagram.source;
            tokio::spawn(async move { server.welcome(source).await });
        }

        let queue = if datagram.is_request { &request_tx } else { &response_tx };
        if queue.send(datagram).await.is_err() {
            break;
        }
    }
    debug!("receive loop stopped");
}

/// Dispatch inbound requests by kind.
async fn request_loop(server: Server, mut requests: mpsc::Receiver<Datagram>) {
    while let Some(request) = requests.recv().await {
        match request.kind {
            Kind::Probe => {
                let server = server.clone();
                tokio::spawn(async move { server.answer_probe(request).await });
            }
            Kind::Unknown(kind) => {
                debug!(kind, source = %request.source.id, "ignoring request of unknown kind");
            }
        }
    }
}

/// Route inbound responses to whoever registered their cookie. Unmatched or
/// duplicate responses are dropped.
async fn response_loop(server: Server, mut responses: mpsc::Receiver<Datagram>) {
    while let Some(response) = responses.recv().await {
        let Some(sink) = server.inner.cookies.lookup(&response.cookie).await else {
            trace!(source = %response.source.id, "dropping unmatched response");
            continue;
        };
        if sink.try_send(response).is_err() {
            trace!("reply sink full or gone, dropping response");
        }
    }
}
