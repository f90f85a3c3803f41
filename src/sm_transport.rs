//! Reliable datagram transport for session-management traffic.
//!
//! One UDP socket per Nexus, bound to the management port. Peers are
//! connection-oriented on top of the socket: a SYN/SYN_ACK handshake opens
//! a peer, DATA frames carry one SM payload each under a per-peer sequence
//! number with cumulative ACKs, and unacked frames are retransmitted every
//! service pass past the RTO. Delivery to a given peer is in order;
//! out-of-order arrivals are dropped and covered by retransmission.
//!
//! `service` is the single event pump: it blocks for up to the caller's
//! timeout and reports handshake completions, in-order payloads, and peer
//! teardowns (including outbound connects that never completed).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use slab::Slab;

const FRAME_SYN: u8 = 1;
const FRAME_SYN_ACK: u8 = 2;
const FRAME_DATA: u8 = 3;
const FRAME_ACK: u8 = 4;
const FRAME_FIN: u8 = 5;

/// Frame header: one type byte plus a 32-bit sequence number.
const FRAME_HDR_SIZE: usize = 5;

/// Retransmission interval for unacked frames and pending SYNs.
const RETX_INTERVAL: Duration = Duration::from_millis(50);

/// Give up on outbound connects that see no SYN_ACK within this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Cap on one service-pass blocking slice, so retransmission timers keep
/// firing while the pump waits for traffic.
const TICK: Duration = Duration::from_millis(10);

/// Largest accepted datagram.
const MAX_DATAGRAM: usize = 1400;

/// Handle identifying a control-transport peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmPeerId(usize);

/// Event yielded by `service`.
#[derive(Debug)]
pub enum SmEvent {
    /// Handshake completed; the peer can carry data.
    Connect(SmPeerId),
    /// An in-order payload arrived from the peer.
    Receive(SmPeerId, Vec<u8>),
    /// The peer closed, or an outbound connect timed out.
    Disconnect(SmPeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    SynSent,
    Established,
}

struct Unacked {
    seq: u32,
    frame: Vec<u8>,
    last_tx: Instant,
}

struct Peer {
    addr: SocketAddr,
    state: PeerState,
    opened_at: Instant,
    last_syn_tx: Instant,
    next_tx_seq: u32,
    next_rx_seq: u32,
    unacked: VecDeque<Unacked>,
}

/// The reliable-datagram host bound to a management UDP port.
pub struct SmTransport {
    socket: UdpSocket,
    peers: Slab<Peer>,
    by_addr: HashMap<SocketAddr, usize>,
    local_port: u16,
}

impl SmTransport {
    /// Bind the management socket. A bind failure is a Nexus construction
    /// failure.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        let local_port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            peers: Slab::new(),
            by_addr: HashMap::new(),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Number of open peers, both directions.
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_addr(&self, peer: SmPeerId) -> Option<SocketAddr> {
        self.peers.get(peer.0).map(|p| p.addr)
    }

    /// Whether the peer's handshake has completed. `connect` can return a
    /// peer that is already up when an inbound connection from the same
    /// address exists; its Connect event has already been delivered.
    pub fn is_established(&self, peer: SmPeerId) -> bool {
        self.peers
            .get(peer.0)
            .is_some_and(|p| p.state == PeerState::Established)
    }

    /// Initiate an outbound connect. The handshake completes (or times
    /// out) asynchronously through `service` events.
    pub fn connect(&mut self, addr: SocketAddr) -> SmPeerId {
        if let Some(&idx) = self.by_addr.get(&addr) {
            return SmPeerId(idx);
        }
        let now = Instant::now();
        let idx = self.peers.insert(Peer {
            addr,
            state: PeerState::SynSent,
            opened_at: now,
            last_syn_tx: now,
            next_tx_seq: 0,
            next_rx_seq: 0,
            unacked: VecDeque::new(),
        });
        self.by_addr.insert(addr, idx);
        self.send_ctrl(addr, FRAME_SYN, 0);
        SmPeerId(idx)
    }

    /// Queue a payload for reliable, in-order delivery. Best effort if the
    /// peer is unknown (it may have raced a disconnect).
    pub fn send(&mut self, peer: SmPeerId, payload: &[u8]) {
        debug_assert!(payload.len() + FRAME_HDR_SIZE <= MAX_DATAGRAM);
        let Some(p) = self.peers.get_mut(peer.0) else {
            tracing::debug!(?peer, "send on unknown SM peer, dropping");
            return;
        };

        let seq = p.next_tx_seq;
        p.next_tx_seq = p.next_tx_seq.wrapping_add(1);

        let mut frame = Vec::with_capacity(FRAME_HDR_SIZE + payload.len());
        frame.push(FRAME_DATA);
        frame.extend_from_slice(&seq.to_ne_bytes());
        frame.extend_from_slice(payload);

        let _ = self.socket.send_to(&frame, p.addr);
        p.unacked.push_back(Unacked {
            seq,
            frame,
            last_tx: Instant::now(),
        });
    }

    /// Close a peer. The FIN is fire-and-forget; the local state goes away
    /// immediately.
    pub fn disconnect(&mut self, peer: SmPeerId) {
        if let Some(p) = self.peers.try_remove(peer.0) {
            self.by_addr.remove(&p.addr);
            self.send_ctrl(p.addr, FRAME_FIN, 0);
        }
    }

    /// Pump the transport for up to `timeout`, appending events. Returns
    /// early once events are available, after draining whatever else is
    /// already queued on the socket.
    pub fn service(&mut self, timeout: Duration, events: &mut Vec<SmEvent>) {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            self.pump_timers(events);
            if !events.is_empty() {
                self.drain_ready(&mut buf, events);
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let wait = (deadline - now).min(TICK);
            // A zero timeout means blocking mode for UdpSocket; clamp up.
            let wait = wait.max(Duration::from_millis(1));
            let _ = self.socket.set_read_timeout(Some(wait));

            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let frame = buf[..n].to_vec();
                    self.handle_frame(&frame, from, events);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    tracing::warn!(error = %e, "SM socket receive error");
                }
            }
        }
    }

    /// Drain datagrams already queued on the socket without blocking.
    fn drain_ready(&mut self, buf: &mut [u8], events: &mut Vec<SmEvent>) {
        if self.socket.set_nonblocking(true).is_err() {
            return;
        }
        while let Ok((n, from)) = self.socket.recv_from(buf) {
            let frame = buf[..n].to_vec();
            self.handle_frame(&frame, from, events);
        }
        let _ = self.socket.set_nonblocking(false);
    }

    fn handle_frame(&mut self, frame: &[u8], from: SocketAddr, events: &mut Vec<SmEvent>) {
        if frame.len() < FRAME_HDR_SIZE {
            return;
        }
        let ftype = frame[0];
        let seq = u32::from_ne_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let payload = &frame[FRAME_HDR_SIZE..];

        let idx = match self.by_addr.get(&from) {
            Some(&idx) => idx,
            None => {
                // Only a SYN opens an inbound peer; anything else from an
                // unknown address is stale.
                if ftype == FRAME_SYN {
                    let now = Instant::now();
                    let idx = self.peers.insert(Peer {
                        addr: from,
                        state: PeerState::Established,
                        opened_at: now,
                        last_syn_tx: now,
                        next_tx_seq: 0,
                        next_rx_seq: 0,
                        unacked: VecDeque::new(),
                    });
                    self.by_addr.insert(from, idx);
                    self.send_ctrl(from, FRAME_SYN_ACK, 0);
                    events.push(SmEvent::Connect(SmPeerId(idx)));
                }
                return;
            }
        };

        match ftype {
            FRAME_SYN => {
                // Duplicate SYN (lost SYN_ACK), or simultaneous connect.
                let established = {
                    let p = &mut self.peers[idx];
                    let was_syn_sent = p.state == PeerState::SynSent;
                    p.state = PeerState::Established;
                    was_syn_sent
                };
                self.send_ctrl(from, FRAME_SYN_ACK, 0);
                if established {
                    events.push(SmEvent::Connect(SmPeerId(idx)));
                }
            }
            FRAME_SYN_ACK => {
                let p = &mut self.peers[idx];
                if p.state == PeerState::SynSent {
                    p.state = PeerState::Established;
                    events.push(SmEvent::Connect(SmPeerId(idx)));
                }
            }
            FRAME_DATA => {
                let p = &mut self.peers[idx];
                if p.state != PeerState::Established {
                    return;
                }
                if seq == p.next_rx_seq {
                    p.next_rx_seq = p.next_rx_seq.wrapping_add(1);
                    let ack = p.next_rx_seq;
                    let data = payload.to_vec();
                    self.send_ctrl(from, FRAME_ACK, ack);
                    events.push(SmEvent::Receive(SmPeerId(idx), data));
                } else if seq.wrapping_sub(p.next_rx_seq) > u32::MAX / 2 {
                    // Duplicate of an already-delivered frame; our ACK was
                    // lost. Re-ack cumulatively.
                    let ack = p.next_rx_seq;
                    self.send_ctrl(from, FRAME_ACK, ack);
                }
                // A gap means an earlier frame is still in flight; drop and
                // let retransmission close it.
            }
            FRAME_ACK => {
                let p = &mut self.peers[idx];
                while let Some(front) = p.unacked.front() {
                    if front.seq.wrapping_sub(seq) > u32::MAX / 2 {
                        p.unacked.pop_front();
                    } else {
                        break;
                    }
                }
            }
            FRAME_FIN => {
                let p = self.peers.remove(idx);
                self.by_addr.remove(&p.addr);
                events.push(SmEvent::Disconnect(SmPeerId(idx)));
            }
            _ => {}
        }
    }

    /// Retransmit overdue frames and expire stale connects.
    fn pump_timers(&mut self, events: &mut Vec<SmEvent>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut resend: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut syn_retx = Vec::new();

        for (idx, p) in self.peers.iter_mut() {
            match p.state {
                PeerState::SynSent => {
                    if now.duration_since(p.opened_at) > CONNECT_TIMEOUT {
                        expired.push(idx);
                    } else if now.duration_since(p.last_syn_tx) > RETX_INTERVAL {
                        p.last_syn_tx = now;
                        syn_retx.push(p.addr);
                    }
                }
                PeerState::Established => {
                    for ua in p.unacked.iter_mut() {
                        if now.duration_since(ua.last_tx) > RETX_INTERVAL {
                            ua.last_tx = now;
                            resend.push((p.addr, ua.frame.clone()));
                        }
                    }
                }
            }
        }

        for addr in syn_retx {
            self.send_ctrl(addr, FRAME_SYN, 0);
        }
        for (addr, frame) in resend {
            let _ = self.socket.send_to(&frame, addr);
        }
        for idx in expired {
            let p = self.peers.remove(idx);
            self.by_addr.remove(&p.addr);
            tracing::warn!(addr = %p.addr, "SM connect timed out");
            events.push(SmEvent::Disconnect(SmPeerId(idx)));
        }
    }

    fn send_ctrl(&self, addr: SocketAddr, ftype: u8, seq: u32) {
        let mut frame = [0u8; FRAME_HDR_SIZE];
        frame[0] = ftype;
        frame[1..5].copy_from_slice(&seq.to_ne_bytes());
        let _ = self.socket.send_to(&frame, addr);
    }
}
