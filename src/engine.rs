use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::inflight::InflightTable;
use crate::pool::{SocketId, UpstreamPool};
use crate::proto_utils::{self, MAX_DNS_MESSAGE_SIZE};

/// Pause after an unaccountable error so a socket that is broken but
/// keeps reporting ready cannot spin the loop.
const SNOOZE: Duration = Duration::from_secs(1);

enum Event {
    GcDue,
    ClientReadable(io::Result<()>),
    UpstreamMessage(io::Result<(SocketId, usize)>),
}

/// The proxy itself: takes DNS queries from clients on the listening
/// socket, forwards them to the upstream server through the pool and
/// returns the validated responses to the appropriate client.
///
/// Everything runs on one task; each readiness event is handled to
/// completion before the next one is taken.
pub struct Engine {
    server: UdpSocket,
    upstream: SocketAddr,
    inflight: InflightTable,
    pool: UpstreamPool,
    rng: StdRng,
    debug_checks: bool,
    client_buf: Box<[u8]>,
    upstream_buf: Box<[u8]>,
}

impl Engine {
    /// Validate the configured addresses, bind the listening socket
    /// and set up the internal state.  Must run inside the runtime.
    pub fn bind(cfg: &ProxyConfig) -> anyhow::Result<Self> {
        let (listen, upstream) = cfg.resolve()?;

        let server = create_server_socket(listen).with_context(|| format!("bind {listen}"))?;
        info!(listen = %listen, "listening for DNS queries");

        let seed = match cfg.rng_seed {
            0 => {
                // Seed with the microseconds part of the current time.
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                u64::from(now.subsec_micros())
            }
            seed => seed,
        };
        debug!(seed, "random seed");

        Ok(Self {
            server,
            upstream,
            inflight: InflightTable::new(
                cfg.max_requests as usize,
                Duration::from_secs(cfg.request_timeout),
                Duration::from_secs(cfg.min_gc_time),
                cfg.debug,
            ),
            pool: UpstreamPool::new(cfg.max_ports as usize, cfg.max_port_lifetime, upstream),
            rng: StdRng::seed_from_u64(seed),
            debug_checks: cfg.debug,
            client_buf: vec![0u8; MAX_DNS_MESSAGE_SIZE].into_boxed_slice(),
            upstream_buf: vec![0u8; MAX_DNS_MESSAGE_SIZE].into_boxed_slice(),
        })
    }

    /// The address the listening socket is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Run the event loop.  It never returns.
    pub async fn run(&mut self) {
        info!("ready to accept requests");
        loop {
            // Take one readiness event at a time; the competing
            // futures are dropped before the event is handled.
            let event = tokio::select! {
                _ = self.inflight.gc_tick() => Event::GcDue,
                ready = self.server.readable() => Event::ClientReadable(ready),
                received = self.pool.recv_any(&mut self.upstream_buf) => {
                    Event::UpstreamMessage(received)
                }
            };

            let ok = match event {
                Event::GcDue => {
                    debug!("deleting expired requests");
                    let pool = &mut self.pool;
                    self.inflight.collect_expired(Instant::now(), |request| {
                        pool.release(request.upstream_socket)
                    });
                    true
                }
                Event::ClientReadable(Ok(())) => self.forward_query().await,
                Event::ClientReadable(Err(err)) => {
                    error!(error = %err, "waiting on the listening socket failed");
                    false
                }
                Event::UpstreamMessage(Ok((socket_id, len))) => {
                    self.return_response(socket_id, len).await
                }
                Event::UpstreamMessage(Err(err)) => {
                    error!(error = %err, "receive from upstream failed");
                    false
                }
            };

            if !ok {
                // We have experienced an unaccountable error; sleep a
                // bit to prevent busy-looping.
                sleep(SNOOZE).await;
            }
        }
    }

    /// Take one query from the listening socket, replace its ID with a
    /// random one and forward it through the pool.  Malformed and
    /// unforwardable datagrams are logged and dropped; `false` is
    /// returned only when the receive itself failed, which can
    /// indicate some uncontrollable transient condition.
    async fn forward_query(&mut self) -> bool {
        // Allocate the proxied ID before touching the socket; without
        // one the datagram is popped from the kernel queue unread.
        let proxied_query_id = match self.inflight.allocate_id(&mut self.rng) {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "dropping query");
                self.discard_message();
                return true;
            }
        };

        let (len, client) = match self.server.try_recv_from(&mut self.client_buf) {
            Ok(received) => received,
            // Spurious readiness; nothing to do.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
            Err(err) => {
                error!(error = %err, "receive from client failed");
                return false;
            }
        };
        debug!(client = %client, bytes = len, "message received");

        let msg = &mut self.client_buf[..len];
        let summary = match proto_utils::parse_message(msg, self.debug_checks) {
            Ok(summary) => summary,
            Err(err) => {
                error!(client = %client, error = %err, "dropping query");
                return true;
            }
        };
        if summary.is_response {
            error!(client = %client, query_id = summary.query_id, "message is not a query");
            return true;
        }

        let Some(socket_id) = self.pool.acquire(&mut self.rng) else {
            // The pool has logged why; the query is dropped.
            return true;
        };

        proto_utils::set_query_id(msg, proxied_query_id);
        if let Err(err) = self.pool.send(socket_id, msg).await {
            error!(upstream = %self.upstream, error = %err, "send to upstream failed");
            return true;
        }
        if let Some(local) = self.pool.local_addr(socket_id) {
            debug!(
                query_id = summary.query_id,
                via = %local,
                proxied_query_id,
                "query forwarded"
            );
        }

        let question = Bytes::copy_from_slice(summary.question(msg));
        self.pool.mark_forwarded(socket_id);
        self.inflight
            .record(proxied_query_id, socket_id, client, question, summary.query_id);
        true
    }

    /// Validate the datagram received on pool socket `socket_id` as
    /// the response to an outstanding query, restore the client's ID
    /// and return it.  Anything that fails validation is dropped.
    async fn return_response(&mut self, socket_id: SocketId, len: usize) -> bool {
        // The pool socket is connected, so the sender address needs no
        // checking: the kernel only delivers from the upstream server.
        debug!(upstream = %self.upstream, bytes = len, "message received");

        let msg = &mut self.upstream_buf[..len];
        let summary = match proto_utils::parse_message(msg, self.debug_checks) {
            Ok(summary) => summary,
            Err(err) => {
                error!(upstream = %self.upstream, error = %err, "dropping response");
                return true;
            }
        };
        let proxied_query_id = summary.query_id;
        if !summary.is_response {
            error!(
                upstream = %self.upstream,
                query_id = proxied_query_id,
                "message is not a response"
            );
            return true;
        }

        let Some(request) = self.inflight.lookup(proxied_query_id) else {
            debug!(query_id = proxied_query_id, "request not found");
            return true;
        };
        if request.upstream_socket != socket_id {
            // The message arrived through a different port than the
            // query left through, which can be a sign of spoofing.
            debug!(query_id = proxied_query_id, "response on wrong port");
            return true;
        }
        if request.question.as_ref() != summary.question(msg) {
            // The response has to contain the exact same question as
            // the query.
            debug!(query_id = proxied_query_id, "response to wrong question");
            return true;
        }

        let client = request.client;
        let original_query_id = request.original_query_id;

        proto_utils::set_query_id(msg, original_query_id);
        if let Err(err) = self.server.send_to(msg, client).await {
            error!(client = %client, error = %err, "send to client failed");
        } else {
            debug!(
                query_id = original_query_id,
                client = %client,
                proxied_query_id,
                "response returned"
            );
        }

        self.pool.release(socket_id);
        self.inflight.complete(proxied_query_id);
        true
    }

    // Pop the next datagram without reading it, used when we know we
    // cannot process it.  One byte is enough; the kernel discards the
    // rest.
    fn discard_message(&mut self) {
        let mut buf = [0u8; 1];
        match self.server.try_recv_from(&mut buf) {
            Ok((_, sender)) => debug!(client = %sender, "discarding message"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!(error = %err, "discarding message failed"),
        }
    }
}

fn create_server_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    // Large buffers so a queue of queries survives a busy loop
    // iteration; best effort.
    if let Err(err) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!(error = %err, "failed to set recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!(error = %err, "failed to set send buffer size");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind")?;
    Ok(UdpSocket::from_std(socket.into())?)
}
