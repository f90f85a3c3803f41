//! # nexrpc - session management substrate for a datacenter RPC runtime
//!
//! This crate implements the control-plane core that a high-throughput,
//! low-latency RPC runtime builds on: the per-process [`Nexus`]
//! coordinator and the zero-copy [`MsgBuffer`] abstraction the data plane
//! DMAs from.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                            Nexus                                │
//! │  ┌────────────┐  ┌─────────────────┐  ┌─────────────────────┐   │
//! │  │ SM thread  │  │ bg worker pool  │  │ req-handler table    │   │
//! │  │ (UDP ctrl) │  │ (MtList queues) │  │ + hook registry      │   │
//! │  └────────────┘  └─────────────────┘  └─────────────────────┘   │
//! └────────────────────────────────────────────────────────────────┘
//!        │  SM packets               │ BgWorkItems
//!        ▼                           ▼
//!  peer Nexuses              RPC endpoint threads (via Hooks)
//! ```
//!
//! - Endpoint threads push [`SmWorkItem`]s onto the Nexus SM TX list; the
//!   SM thread transmits them over the reliable control transport and
//!   demultiplexes inbound SM packets into per-endpoint [`Hook`]
//!   mailboxes.
//! - Background workers run registered request handlers off the fast
//!   path, dispatching by the 8-bit request type.
//! - [`MsgBuffer`]s overlay payload data with pre- and post-appended
//!   packet headers so the transport sends without copying; they flow
//!   through the data plane, not the Nexus.
//!
//! The data-plane transport itself (RDMA driver, retransmission,
//! congestion control) is consumed through the [`Transport`] trait and is
//! out of scope here.

pub mod buffer;
pub mod config;
pub mod error;
pub mod msg_buffer;
pub mod mt_list;
pub mod nexus;
pub mod pkthdr;
pub mod sm_transport;
pub mod sm_types;
pub mod timing;
pub mod tls_registry;
pub mod transport;

// Re-export main types
pub use buffer::{Buffer, SlabAllocator};
pub use error::{Error, Result};
pub use msg_buffer::{MsgBuffer, required_class_size};
pub use mt_list::MtList;
pub use nexus::{
    AppContext, BgEndpoint, BgWorkItem, BgWorkItemKind, Continuation, Hook, Nexus, ReqFunc, SSlot,
    SmWorkItem,
};
pub use pkthdr::{PKT_HDR_MAGIC, PKT_HDR_SIZE, PktHdr, PktType};
pub use sm_transport::{SmEvent, SmPeerId, SmTransport};
pub use sm_types::{SM_PKT_SIZE, SmEndpoint, SmErrType, SmPkt, SmPktKind};
pub use tls_registry::TlsRegistry;
pub use transport::{Transport, TxEntry};
