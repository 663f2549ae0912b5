use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tracing::{debug, error};

/// Identifies a pool socket for the lifetime of the process.
pub type SocketId = u32;

/// Usage accounting of an available upstream socket.
struct SocketUsage {
    /// Forwarded queries still awaiting a response.  A reference
    /// count.
    outstanding: u32,
    /// Total queries ever forwarded through the socket.  At
    /// `max_port_lifetime` the socket is moved to `retiring`.
    lifetime: u32,
}

struct AvailableSocket {
    socket: UdpSocket,
    usage: SocketUsage,
}

struct RetiringSocket {
    socket: UdpSocket,
    /// Once the last outstanding response arrives or times out the
    /// socket is closed.
    outstanding: u32,
}

/// The set of UDP sockets connected to the upstream DNS server, each
/// bound by the kernel to an ephemeral local port.  Forwarding through
/// varying source ports is what makes blind response spoofing hard.
pub struct UpstreamPool {
    max_ports: usize,
    max_port_lifetime: u32,
    upstream: SocketAddr,
    next_id: SocketId,

    /// Sockets eligible for new forwards.
    available: FxHashMap<SocketId, AvailableSocket>,
    /// Sockets past their lifetime budget, kept open only to deliver
    /// the responses still in flight.
    retiring: FxHashMap<SocketId, RetiringSocket>,
}

impl UpstreamPool {
    pub fn new(max_ports: usize, max_port_lifetime: u32, upstream: SocketAddr) -> Self {
        Self {
            max_ports,
            max_port_lifetime,
            upstream,
            next_id: 0,
            available: FxHashMap::default(),
            retiring: FxHashMap::default(),
        }
    }

    /// Return a random available socket, opening a new one first if
    /// `max_ports` allows it.  `None` if the pool is exhausted; the
    /// reason has been logged.
    pub fn acquire(&mut self, rng: &mut StdRng) -> Option<SocketId> {
        let headroom =
            self.max_ports == 0 || self.available.len() + self.retiring.len() < self.max_ports;
        if !headroom && self.available.is_empty() {
            error!("maximum number of bound ports reached");
            return None;
        }

        if headroom {
            match self.new_upstream_socket() {
                Ok(socket) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.available.insert(
                        id,
                        AvailableSocket {
                            socket,
                            usage: SocketUsage {
                                outstanding: 0,
                                lifetime: 0,
                            },
                        },
                    );
                    return Some(id);
                }
                Err(err) => {
                    error!(upstream = %self.upstream, error = %err, "opening upstream socket failed")
                }
            }
        }

        // Either we didn't want a new port or we couldn't open one;
        // fall back to a random available socket.
        if self.available.is_empty() {
            return None;
        }
        let n = rng.random_range(0..self.available.len());
        self.available.keys().nth(n).copied()
    }

    // connect() also binds the socket; we rely on the kernel choosing
    // a random local port.
    fn new_upstream_socket(&self) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.connect(&self.upstream.into())?;
        UdpSocket::from_std(socket.into())
    }

    /// Called after a query has actually been sent through `id`.
    pub fn mark_forwarded(&mut self, id: SocketId) {
        let Some(entry) = self.available.get_mut(&id) else {
            debug_assert!(false, "forwarded through unknown socket {id}");
            return;
        };
        entry.usage.outstanding += 1;
        entry.usage.lifetime += 1;

        if self.max_port_lifetime != 0 && entry.usage.lifetime >= self.max_port_lifetime {
            if let Some(entry) = self.available.remove(&id) {
                self.retiring.insert(
                    id,
                    RetiringSocket {
                        socket: entry.socket,
                        outstanding: entry.usage.outstanding,
                    },
                );
            }
        }
    }

    /// Called when a response arrived through `id` or a query
    /// forwarded through it timed out.  Closes a drained retiring
    /// socket, which also deregisters it from the poller.
    pub fn release(&mut self, id: SocketId) {
        if let Some(entry) = self.available.get_mut(&id) {
            debug_assert!(entry.usage.outstanding > 0);
            entry.usage.outstanding = entry.usage.outstanding.saturating_sub(1);
            return;
        }

        let Some(entry) = self.retiring.get_mut(&id) else {
            debug_assert!(false, "releasing unknown socket {id}");
            return;
        };
        debug_assert!(entry.outstanding > 0);
        entry.outstanding = entry.outstanding.saturating_sub(1);

        if entry.outstanding == 0 {
            if let Some(entry) = self.retiring.remove(&id) {
                if let Ok(local) = entry.socket.local_addr() {
                    debug!(local = %local, "socket end of life, closing");
                }
            }
        }
    }

    /// Send `payload` to the upstream server through `id`.
    pub async fn send(&self, id: SocketId, payload: &[u8]) -> io::Result<usize> {
        let Some(socket) = self.socket(id) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown upstream socket {id}"),
            ));
        };
        socket.send(payload).await
    }

    /// Local address of a pool socket, for logging.
    pub fn local_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.socket(id).and_then(|socket| socket.local_addr().ok())
    }

    fn socket(&self, id: SocketId) -> Option<&UdpSocket> {
        self.available
            .get(&id)
            .map(|entry| &entry.socket)
            .or_else(|| self.retiring.get(&id).map(|entry| &entry.socket))
    }

    /// Wait for one datagram on any pool socket.  Retiring sockets
    /// still deliver their in-flight responses.  Pends forever while
    /// the pool is empty.  Cancel safe: a datagram is only consumed
    /// when the future resolves with it.
    pub async fn recv_any(&self, buf: &mut [u8]) -> io::Result<(SocketId, usize)> {
        std::future::poll_fn(|cx| self.poll_recv_any(cx, buf)).await
    }

    fn poll_recv_any(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(SocketId, usize)>> {
        let available = self.available.iter().map(|(&id, entry)| (id, &entry.socket));
        let retiring = self.retiring.iter().map(|(&id, entry)| (id, &entry.socket));
        for (id, socket) in available.chain(retiring) {
            let mut read_buf = ReadBuf::new(&mut *buf);
            match socket.poll_recv(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let len = read_buf.filled().len();
                    return Poll::Ready(Ok((id, len)));
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => continue,
            }
        }
        Poll::Pending
    }

    #[cfg(test)]
    fn available_len(&self) -> usize {
        self.available.len()
    }

    #[cfg(test)]
    fn retiring_len(&self) -> usize {
        self.retiring.len()
    }
}
