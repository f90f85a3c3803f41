//! Data-plane transport interface.
//!
//! The fast path carries MsgBuffers over whatever fabric the process was
//! built for; the substrate only fixes the capability set. Implementations
//! are chosen at endpoint-construction time through this trait, and write
//! wire headers at the locations the MsgBuffer layout defines.

use crate::buffer::Buffer;
use crate::msg_buffer::MsgBuffer;

/// One packet of a MsgBuffer queued for transmission.
pub struct TxEntry<'a> {
    pub msgbuf: &'a MsgBuffer,
    /// Packet index within the message (0 uses `pkthdr_0`).
    pub pkt_idx: usize,
}

/// Capability set consumed from the data-plane transport.
pub trait Transport {
    /// Largest wire packet, header included.
    const MTU: usize;

    /// Allocate a registered buffer of at least `size` bytes. Returns the
    /// invalid Buffer on failure.
    fn alloc_buffer(&mut self, size: usize) -> Buffer;

    /// Return a buffer to the transport's allocator.
    fn free_buffer(&mut self, buffer: Buffer);

    /// Transmit a batch of packets. Returns the number queued.
    fn tx_burst(&mut self, batch: &mut [TxEntry<'_>]) -> usize;

    /// Receive a batch of packets, each wrapped as a single-packet
    /// MsgBuffer borrowing transport-owned memory.
    fn rx_burst(&mut self) -> Vec<MsgBuffer>;
}
