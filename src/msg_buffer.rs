//! Message buffers: payload plus per-packet wire headers in one
//! allocation.
//!
//! A `MsgBuffer` arranges a backing buffer as
//!
//! ```text
//! [ pkthdr_0 | payload[0..max_data_size) | pad | pkthdr_1 | ... ]
//! ```
//!
//! so the zeroth header and the payload form one contiguous range the
//! transport can DMA as a single scatter-gather entry. Headers for later
//! packets live in a word-aligned trailing array whose offsets depend only
//! on `max_data_size`; resizing the message never moves a header.

use std::fmt;

use crate::buffer::Buffer;
use crate::pkthdr::{PKT_HDR_MAGIC, PKT_HDR_SIZE, PktHdr};

/// Round `n` up to the platform word size.
#[inline]
fn round_up_word(n: usize) -> usize {
    const WORD: usize = std::mem::size_of::<usize>();
    (n + WORD - 1) & !(WORD - 1)
}

/// Backing-buffer capacity required for `(max_data_size, max_num_pkts)`.
#[inline]
pub fn required_class_size(max_data_size: usize, max_num_pkts: usize) -> usize {
    debug_assert!(max_num_pkts >= 1);
    PKT_HDR_SIZE + round_up_word(max_data_size) + (max_num_pkts - 1) * PKT_HDR_SIZE
}

/// A message buffer with headers at the beginning and end.
pub struct MsgBuffer {
    /// Pointer to the first *data* byte. The backing buffer's base does
    /// not point here; `pkthdr_0` sits immediately before. Null marks the
    /// invalid MsgBuffer.
    buf: *mut u8,
    /// The (optional) backing buffer. Invalid for RX-borrowed packets.
    buffer: Buffer,
    /// Max data bytes in the MsgBuffer.
    max_data_size: usize,
    /// Current data bytes in the MsgBuffer.
    data_size: usize,
    /// Max number of packets in this MsgBuffer.
    max_num_pkts: usize,
    /// Current number of packets in this MsgBuffer.
    num_pkts: usize,
    /// Packets queued for tx_burst while the buffer is on the TX path, or
    /// packets received from rx_burst on the RX path. Never both at once.
    pkts_progress: usize,
}

unsafe impl Send for MsgBuffer {}

impl MsgBuffer {
    /// Construct a MsgBuffer over a valid allocator-owned Buffer. The
    /// zeroth packet header is stored at the buffer's base, which must
    /// have space for `max_data_size` bytes and `max_num_pkts` headers.
    /// The magic is stamped here, once, and preserved by every `resize`.
    pub fn from_buffer(buffer: Buffer, max_data_size: usize, max_num_pkts: usize) -> Self {
        assert!(buffer.is_valid());
        assert!(max_num_pkts >= 1);
        assert!(required_class_size(max_data_size, max_num_pkts) <= buffer.class_size());

        let buf = unsafe { buffer.as_ptr().add(PKT_HDR_SIZE) };
        let msgbuf = Self {
            buf,
            buffer,
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
            pkts_progress: 0,
        };
        unsafe {
            (*msgbuf.pkthdr_0()).magic = PKT_HDR_MAGIC;
        }
        msgbuf
    }

    /// Construct a single-packet MsgBuffer borrowing a received packet.
    /// The backing buffer is the invalid sentinel; dropping the MsgBuffer
    /// frees nothing.
    ///
    /// # Safety
    /// `pkt` must point to at least `PKT_HDR_SIZE + max_data_size` bytes
    /// that outlive the MsgBuffer.
    pub unsafe fn from_rx_packet(pkt: *mut u8, max_data_size: usize) -> Self {
        debug_assert!(!pkt.is_null());
        Self {
            buf: unsafe { pkt.add(PKT_HDR_SIZE) },
            buffer: Buffer::invalid(),
            max_data_size,
            data_size: max_data_size,
            max_num_pkts: 1,
            num_pkts: 1,
            pkts_progress: 0,
        }
    }

    /// The invalid MsgBuffer, i.e. `buf` is null.
    pub fn invalid() -> Self {
        Self {
            buf: std::ptr::null_mut(),
            buffer: Buffer::invalid(),
            max_data_size: 0,
            data_size: 0,
            max_num_pkts: 1,
            num_pkts: 1,
            pkts_progress: 0,
        }
    }

    /// Pointer to the pre-appended packet header.
    #[inline]
    pub fn pkthdr_0(&self) -> *mut PktHdr {
        unsafe { self.buf.sub(PKT_HDR_SIZE) as *mut PktHdr }
    }

    /// Pointer to the nth (n >= 1) packet header. The offset uses
    /// `max_data_size`, not `data_size`, so it survives resizing.
    #[inline]
    pub fn pkthdr_n(&self, n: usize) -> *mut PktHdr {
        assert!(n >= 1);
        unsafe {
            self.buf
                .add(round_up_word(self.max_data_size) + (n - 1) * PKT_HDR_SIZE)
                as *mut PktHdr
        }
    }

    /// Check if this MsgBuffer is valid: non-null data pointer and the
    /// construction-time magic in the zeroth header.
    pub fn is_valid(&self) -> bool {
        if self.buf.is_null() {
            return false;
        }
        unsafe { (*self.pkthdr_0()).is_valid() }
    }

    /// Resize to any size within the maximum allocation. Headers do not
    /// move; only the logical sizes change.
    #[inline]
    pub fn resize(&mut self, new_data_size: usize, new_num_pkts: usize) {
        assert!(new_data_size <= self.max_data_size);
        assert!(new_num_pkts <= self.max_num_pkts);
        self.data_size = new_data_size;
        self.num_pkts = new_num_pkts;
    }

    /// Current data size.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Maximum data size fixed at construction.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Current number of packets.
    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    /// Maximum number of packets fixed at construction.
    #[inline]
    pub fn max_num_pkts(&self) -> usize {
        self.max_num_pkts
    }

    /// Packets queued so far (TX interpretation of the progress counter).
    #[inline]
    pub fn pkts_queued(&self) -> usize {
        self.pkts_progress
    }

    #[inline]
    pub fn set_pkts_queued(&mut self, n: usize) {
        self.pkts_progress = n;
    }

    /// Packets received so far (RX interpretation of the progress counter).
    #[inline]
    pub fn pkts_rcvd(&self) -> usize {
        self.pkts_progress
    }

    #[inline]
    pub fn set_pkts_rcvd(&mut self, n: usize) {
        self.pkts_progress = n;
    }

    /// Pointer to the first data byte.
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        self.buf
    }

    /// Current data as a slice.
    #[inline]
    pub fn data(&self) -> &[u8] {
        debug_assert!(!self.buf.is_null());
        unsafe { std::slice::from_raw_parts(self.buf, self.data_size) }
    }

    /// Current data as a mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.buf.is_null());
        unsafe { std::slice::from_raw_parts_mut(self.buf, self.data_size) }
    }

    /// The backing buffer handle.
    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl fmt::Display for MsgBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.buf.is_null() {
            return write!(f, "[Invalid]");
        }
        write!(
            f,
            "[buf {:p}, buffer {}, data {}({}), pkts {}({}), pkts queued/rcvd {}]",
            self.buf,
            self.buffer,
            self.data_size,
            self.max_data_size,
            self.num_pkts,
            self.max_num_pkts,
            self.pkts_progress
        )
    }
}
