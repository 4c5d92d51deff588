//! Receive-queue contract and the stock UDP/multicast backend.
//!
//! The session core only ever sees [`RxQueue::burst`]; where the packets
//! come from (a kernel socket, a poll-mode driver shim, a test feeder) is
//! the backend's business. Flows carry the 5-tuple steering information and
//! the optional header-split hookup.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};

use crate::clock::Clock;
use crate::error::Error;
use crate::frame::PayloadRegion;

/// Largest UDP payload the receive path expects.
pub const MAX_UDP_PAYLOAD: usize = 1500;

/// One received packet. `data` starts at the RTP header.
#[derive(Clone)]
pub struct Mbuf {
    pub data: Bytes,
    /// Receive timestamp, same clock as everything else in the session.
    pub rx_time_ns: u64,
    /// Header-split receive: byte offset in the pre-mapped payload region
    /// where the NIC wrote this packet's payload.
    pub split_off: Option<usize>,
    /// A second buffer segment. The frame handlers refuse these.
    pub extra_seg: Option<Bytes>,
}

impl Mbuf {
    pub fn new(data: Bytes, rx_time_ns: u64) -> Self {
        Self { data, rx_time_ns, split_off: None, extra_seg: None }
    }

    pub fn len(&self) -> usize {
        self.data.len() + self.extra_seg.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks the destination for the next header-split payload. Implemented by
/// the session's header-split state; called by the backend for every packet
/// it lands in the region.
pub trait PayloadSlotAlloc: Send + Sync {
    /// Region byte offset for the next payload, or `None` while the region
    /// is being warmed up.
    fn next_payload_slot(&self) -> usize;
}

/// Header-split hookup handed to the backend inside the flow.
#[derive(Clone)]
pub struct HdrSplitFlow {
    pub region: Arc<PayloadRegion>,
    pub alloc: Arc<dyn PayloadSlotAlloc>,
}

/// Flow steering for one queue.
#[derive(Clone, Default)]
pub struct RxFlow {
    /// Expected source of the stream; multicast group when multicast.
    pub src_ip: Option<Ipv4Addr>,
    /// Destination / group address packets are sent to.
    pub dst_ip: Option<Ipv4Addr>,
    pub dst_port: u16,
    pub hdr_split: Option<HdrSplitFlow>,
    /// Steer through the shared CNI queue instead of a dedicated one.
    pub use_cni_queue: bool,
}

pub trait RxQueue: Send {
    /// Pull up to `max` packets. Returns the number appended to `out`.
    fn burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize;

    fn queue_id(&self) -> u16 {
        0
    }
}

/// Provides and reclaims receive queues for sessions.
pub trait QueueBackend: Send + Sync {
    fn get(&self, port: usize, flow: &RxFlow) -> Result<Box<dyn RxQueue>, Error>;

    fn put(&self, queue: Box<dyn RxQueue>) {
        drop(queue);
    }

    fn join_multicast(&self, _port: usize, _group: Ipv4Addr) -> Result<(), Error> {
        Ok(())
    }

    fn leave_multicast(&self, _port: usize, _group: Ipv4Addr) {}
}

/// Stock backend: one non-blocking UDP socket per queue.
pub struct UdpQueueBackend {
    /// Local interface per port slot (primary, redundant).
    interfaces: Vec<Ipv4Addr>,
    clock: Arc<dyn Clock>,
    /// Sockets held only for their multicast membership.
    memberships: parking_lot::Mutex<Vec<(usize, Ipv4Addr, UdpSocket)>>,
}

impl UdpQueueBackend {
    pub fn new(interfaces: Vec<Ipv4Addr>, clock: Arc<dyn Clock>) -> Self {
        Self { interfaces, clock, memberships: parking_lot::Mutex::new(Vec::new()) }
    }

    fn interface(&self, port: usize) -> Ipv4Addr {
        self.interfaces.get(port).copied().unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

impl QueueBackend for UdpQueueBackend {
    fn get(&self, port: usize, flow: &RxFlow) -> Result<Box<dyn RxQueue>, Error> {
        if flow.hdr_split.is_some() {
            return Err(Error::Queue("udp backend cannot split headers".into()));
        }
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, flow.dst_port);
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();
        info!("rx queue: udp port {} bound on {}", flow.dst_port, self.interface(port));
        Ok(Box::new(UdpRxQueue {
            socket,
            clock: self.clock.clone(),
            buf: [0u8; MAX_UDP_PAYLOAD + 64],
        }))
    }

    fn join_multicast(&self, port: usize, group: Ipv4Addr) -> Result<(), Error> {
        // Membership lives on its own socket so it survives queue churn on
        // the same UDP port.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.join_multicast_v4(&group, &self.interface(port))?;
        self.memberships.lock().push((port, group, socket));
        debug!("rx queue: joined {} on port {}", group, port);
        Ok(())
    }

    fn leave_multicast(&self, port: usize, group: Ipv4Addr) {
        self.memberships.lock().retain(|(p, g, _)| !(*p == port && *g == group));
    }
}

struct UdpRxQueue {
    socket: UdpSocket,
    clock: Arc<dyn Clock>,
    buf: [u8; MAX_UDP_PAYLOAD + 64],
}

impl RxQueue for UdpRxQueue {
    fn burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut got = 0;
        while got < max {
            match self.socket.recv(&mut self.buf) {
                Ok(len) => {
                    out.push(Mbuf::new(
                        Bytes::copy_from_slice(&self.buf[..len]),
                        self.clock.now_ns(),
                    ));
                    got += 1;
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(_) => break,
            }
        }
        got
    }
}
