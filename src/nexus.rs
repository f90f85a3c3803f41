//! The Nexus: process-wide coordinator for session management and
//! background request processing.
//!
//! One Nexus per process (by convention). It owns the session-management
//! thread that speaks the reliable control transport to peer Nexuses, a
//! pool of background workers for long-running request handlers, the
//! request-handler table, and the registry of per-endpoint hooks. RPC
//! endpoint threads interact with all of this exclusively through MtList
//! mailboxes; the only lock on any endpoint-visible path is the coarse
//! registry lock, taken for registration and SM dispatch, never on the
//! data path.

use std::any::Any;
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::config::{
    BG_POLL_INTERVAL, MAX_BG_THREADS, MAX_REQ_TYPES, MAX_RPC_ID, SM_POLL_INTERVAL, SM_THREAD_CORE,
};
use crate::error::{Error, Result};
use crate::msg_buffer::MsgBuffer;
use crate::mt_list::MtList;
use crate::sm_transport::{SmEvent, SmPeerId, SmTransport};
use crate::sm_types::{SmErrType, SmPkt};
use crate::timing;
use crate::tls_registry::TlsRegistry;

/// Opaque application context threaded through request handlers.
pub type AppContext = Arc<dyn Any + Send + Sync>;

/// Response continuation registered on a session slot, run by a
/// background worker when the response work item is dispatched.
pub type Continuation = Box<dyn FnOnce(&mut SSlot, &AppContext) + Send>;

type ReqHandlerFn = Arc<dyn Fn(&mut SSlot, &AppContext) + Send + Sync>;

/// An application-defined request handler. An empty `ReqFunc` is rejected
/// at registration time.
#[derive(Clone, Default)]
pub struct ReqFunc {
    handler: Option<ReqHandlerFn>,
}

impl ReqFunc {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut SSlot, &AppContext) + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(f)),
        }
    }
}

/// Per-in-flight-request state handed to background workers. The rest of
/// the per-request machinery (retransmission, credits) lives with the
/// session fast path and never enters the Nexus.
pub struct SSlot {
    /// Request type, indexes the handler table.
    pub req_type: u8,
    /// Session this request belongs to.
    pub session_num: u16,
    /// The request's message buffer.
    pub req_msgbuf: MsgBuffer,
    /// Error recorded by dispatch (e.g. no handler for the type).
    pub err_type: SmErrType,
    /// Continuation run when the response work item is dispatched.
    pub cont: Option<Continuation>,
}

impl SSlot {
    pub fn new(req_type: u8, session_num: u16) -> Self {
        Self {
            req_type,
            session_num,
            req_msgbuf: MsgBuffer::invalid(),
            err_type: SmErrType::NoError,
            cont: None,
        }
    }
}

/// Implemented by RPC endpoints that submit background work items.
pub trait BgEndpoint: Send + Sync {
    fn rpc_id(&self) -> u8;
}

/// Kind of work submitted to a background thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgWorkItemKind {
    Req,
    Resp,
}

/// A work item submitted to a background thread.
pub struct BgWorkItem {
    pub kind: BgWorkItemKind,
    /// The endpoint that submitted this work item.
    pub endpoint: Arc<dyn BgEndpoint>,
    /// Context to pass to the handler.
    pub context: AppContext,
    pub sslot: Box<SSlot>,
}

impl BgWorkItem {
    pub fn is_req(&self) -> bool {
        self.kind == BgWorkItemKind::Req
    }
}

/// A work item exchanged between an RPC endpoint thread and the SM thread.
pub struct SmWorkItem {
    /// The local endpoint this item belongs to.
    pub rpc_id: u8,
    pub sm_pkt: SmPkt,
    /// Control-transport peer to reply on. None for client-originated
    /// submissions; the SM thread resolves the peer by hostname.
    pub peer: Option<SmPeerId>,
}

/// The per-endpoint mailbox and reference pack. The endpoint allocates
/// the hook and owns it; `register_hook` installs the Nexus-side queue
/// references. Until registration returns, the endpoint must not enqueue
/// work through it.
pub struct Hook {
    pub rpc_id: u8,
    /// Background-worker request lists, installed by the Nexus.
    bg_req_lists: Vec<MtList<BgWorkItem>>,
    /// The SM thread's TX list, installed by the Nexus. Endpoint threads
    /// submit SM packets here.
    sm_tx_list: Option<MtList<SmWorkItem>>,
    /// The endpoint's SM RX mailbox. Packets received by the SM thread
    /// for this endpoint are queued here.
    pub sm_rx_list: MtList<SmWorkItem>,
}

impl Hook {
    pub fn new(rpc_id: u8) -> Self {
        Self {
            rpc_id,
            bg_req_lists: Vec::new(),
            sm_tx_list: None,
            sm_rx_list: MtList::new(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.sm_tx_list.is_some()
    }

    /// Request list of background worker `idx`. Panics if the hook is not
    /// registered.
    pub fn bg_req_list(&self, idx: usize) -> &MtList<BgWorkItem> {
        assert!(self.is_registered(), "hook not registered with a Nexus");
        &self.bg_req_lists[idx]
    }

    /// The Nexus SM TX list. Panics if the hook is not registered.
    pub fn sm_tx_list(&self) -> &MtList<SmWorkItem> {
        self.sm_tx_list
            .as_ref()
            .expect("hook not registered with a Nexus")
    }
}

/// The ground truth for registered request handlers. Workers share this
/// by Arc and therefore observe handlers registered after they launch;
/// per-slot OnceLock makes double-registration structurally impossible.
struct ReqFuncTable {
    slots: [OnceLock<ReqHandlerFn>; MAX_REQ_TYPES],
}

impl ReqFuncTable {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    #[inline]
    fn get(&self, req_type: u8) -> Option<&ReqHandlerFn> {
        self.slots[req_type as usize].get()
    }
}

/// What the Nexus keeps per registered hook: a handle to the endpoint's
/// SM RX mailbox. The Hook itself stays with the endpoint.
struct HookEntry {
    sm_rx_list: MtList<SmWorkItem>,
}

/// Registration state, guarded by the one coarse Nexus lock.
struct Registry {
    /// Handler registration is disallowed once any endpoint has
    /// registered a hook; the flag never resets.
    req_func_registration_allowed: bool,
    hooks: Vec<Option<HookEntry>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            req_func_registration_allowed: true,
            hooks: (0..=MAX_RPC_ID as usize).map(|_| None).collect(),
        }
    }
}

/// Per-peer metadata for client-mode control-transport peers. A peer
/// with no metadata is server-mode (inbound).
struct SmPeerData {
    rem_uri: String,
    connected: bool,
    /// Work items awaiting handshake completion.
    wi_tx_queue: Vec<SmWorkItem>,
}

/// Session-management thread context.
struct SmThreadCtx {
    kill_switch: Arc<AtomicBool>,
    registry: Arc<Mutex<Registry>>,
    sm_tx_list: MtList<SmWorkItem>,
    transport: SmTransport,
    /// Client-session mappings: destination URI to peer, and peer to
    /// client metadata.
    name_map: HashMap<String, SmPeerId>,
    peer_data: HashMap<SmPeerId, SmPeerData>,
}

/// Background thread context.
struct BgThreadCtx {
    kill_switch: Arc<AtomicBool>,
    req_func_table: Arc<ReqFuncTable>,
    tls_registry: TlsRegistry,
    bg_thread_index: usize,
    bg_req_list: MtList<BgWorkItem>,
}

/// The one-per-process Nexus object.
pub struct Nexus {
    /// TSC frequency in GHz, measured once at construction.
    pub freq_ghz: f64,
    /// The local hostname, as peers should reach this process.
    pub hostname: String,
    /// The management UDP port all Nexuses in the cluster listen on.
    pub sm_udp_port: u16,
    /// Number of background request-processing threads.
    pub num_bg_threads: usize,
    /// Thread-local registry shared with workers and endpoint threads.
    pub tls_registry: TlsRegistry,

    req_func_table: Arc<ReqFuncTable>,
    registry: Arc<Mutex<Registry>>,
    sm_tx_list: MtList<SmWorkItem>,
    bg_req_lists: Vec<MtList<BgWorkItem>>,
    kill_switch: Arc<AtomicBool>,
    sm_thread: Option<JoinHandle<()>>,
    bg_threads: Vec<JoinHandle<()>>,
}

impl Nexus {
    /// Create the Nexus: calibrate the TSC, launch `num_bg_threads`
    /// background workers, bind the management port, and start the SM
    /// thread. Fails if the port cannot be bound, a thread cannot be
    /// spawned, or `num_bg_threads` exceeds [`MAX_BG_THREADS`].
    pub fn new(hostname: &str, sm_udp_port: u16, num_bg_threads: usize) -> Result<Self> {
        if num_bg_threads > MAX_BG_THREADS {
            return Err(Error::TooManyBgThreads {
                requested: num_bg_threads,
                max: MAX_BG_THREADS,
            });
        }

        let freq_ghz = timing::measure_rdtsc_freq();
        let tls_registry = TlsRegistry::new();
        let kill_switch = Arc::new(AtomicBool::new(false));
        let req_func_table = Arc::new(ReqFuncTable::new());
        let registry = Arc::new(Mutex::new(Registry::new()));
        let sm_tx_list: MtList<SmWorkItem> = MtList::new();

        // Workers launch before any handler registration is possible;
        // they share the table, so later registrations are visible.
        let mut bg_threads = Vec::with_capacity(num_bg_threads);
        let mut bg_req_lists = Vec::with_capacity(num_bg_threads);
        for i in 0..num_bg_threads {
            let ctx = BgThreadCtx {
                kill_switch: Arc::clone(&kill_switch),
                req_func_table: Arc::clone(&req_func_table),
                tls_registry: tls_registry.clone(),
                bg_thread_index: i,
                bg_req_list: MtList::new(),
            };
            bg_req_lists.push(ctx.bg_req_list.clone());
            let spawned = std::thread::Builder::new()
                .name(format!("nexrpc-bg-{}", i))
                .spawn(move || bg_thread_func(ctx));
            match spawned {
                Ok(handle) => bg_threads.push(handle),
                Err(e) => {
                    join_threads(&kill_switch, bg_threads);
                    return Err(Error::Io(e));
                }
            }
        }

        let transport = match SmTransport::bind(sm_udp_port) {
            Ok(t) => t,
            Err(e) => {
                join_threads(&kill_switch, bg_threads);
                return Err(Error::Io(e));
            }
        };

        let sm_ctx = SmThreadCtx {
            kill_switch: Arc::clone(&kill_switch),
            registry: Arc::clone(&registry),
            sm_tx_list: sm_tx_list.clone(),
            transport,
            name_map: HashMap::new(),
            peer_data: HashMap::new(),
        };
        let sm_thread = match std::thread::Builder::new()
            .name("nexrpc-sm".to_string())
            .spawn(move || sm_thread_func(sm_ctx))
        {
            Ok(handle) => handle,
            Err(e) => {
                join_threads(&kill_switch, bg_threads);
                return Err(Error::Io(e));
            }
        };

        tracing::debug!(
            hostname,
            sm_udp_port,
            num_bg_threads,
            freq_ghz,
            "nexus created"
        );

        Ok(Self {
            freq_ghz,
            hostname: hostname.to_string(),
            sm_udp_port,
            num_bg_threads,
            tls_registry,
            req_func_table,
            registry,
            sm_tx_list,
            bg_req_lists,
            kill_switch,
            sm_thread: Some(sm_thread),
            bg_threads,
        })
    }

    /// Register an application-defined request handler. This must be done
    /// before any endpoint registers a hook with the Nexus; a successful
    /// registration keeps the window open.
    pub fn register_req_func(&self, req_type: u8, req_func: ReqFunc) -> Result<()> {
        let Some(handler) = req_func.handler else {
            return Err(Error::InvalidReqFunc(req_type));
        };

        // Hold the lock across the slot install so the window cannot
        // close mid-registration.
        let reg = self.registry.lock().unwrap();
        if !reg.req_func_registration_allowed {
            return Err(Error::ReqFuncRegistrationClosed(req_type));
        }
        self.req_func_table.slots[req_type as usize]
            .set(handler)
            .map_err(|_| Error::ReqFuncAlreadyRegistered(req_type))
    }

    /// Register a previously unregistered hook. Installs the background
    /// request lists and the SM TX list into the hook, and permanently
    /// closes the handler-registration window.
    pub fn register_hook(&self, hook: &mut Hook) -> Result<()> {
        let mut reg = self.registry.lock().unwrap();
        let slot = hook.rpc_id as usize;
        if reg.hooks[slot].is_some() {
            return Err(Error::HookAlreadyRegistered(hook.rpc_id));
        }

        hook.bg_req_lists = self.bg_req_lists.clone();
        hook.sm_tx_list = Some(self.sm_tx_list.clone());

        reg.req_func_registration_allowed = false;
        reg.hooks[slot] = Some(HookEntry {
            sm_rx_list: hook.sm_rx_list.clone(),
        });
        Ok(())
    }

    /// Unregister a previously registered hook. The installed references
    /// are removed from the hook; the endpoint must not use them again.
    pub fn unregister_hook(&self, hook: &mut Hook) {
        let mut reg = self.registry.lock().unwrap();
        reg.hooks[hook.rpc_id as usize] = None;
        hook.bg_req_lists.clear();
        hook.sm_tx_list = None;
    }

    /// Check if a hook for `rpc_id` is registered. The caller must not
    /// hold the Nexus lock.
    pub fn rpc_id_exists(&self, rpc_id: u8) -> bool {
        self.registry.lock().unwrap().hooks[rpc_id as usize].is_some()
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            let reg = self.registry.lock().unwrap();
            debug_assert!(
                reg.hooks.iter().all(|h| h.is_none()),
                "destroying a Nexus with registered hooks"
            );
        }

        self.kill_switch.store(true, Ordering::Release);
        for handle in self.bg_threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.sm_thread.take() {
            let _ = handle.join();
        }
        self.tls_registry.reset();
        tracing::debug!(hostname = %self.hostname, "nexus destroyed");
    }
}

/// Flip the kill switch and join already-spawned workers; used on
/// construction failure paths.
fn join_threads(kill_switch: &AtomicBool, bg_threads: Vec<JoinHandle<()>>) {
    kill_switch.store(true, Ordering::Release);
    for handle in bg_threads {
        let _ = handle.join();
    }
}

// =============================================================================
// Session-management thread
// =============================================================================

fn sm_thread_func(mut ctx: SmThreadCtx) {
    if let Some(cores) = core_affinity::get_core_ids() {
        if let Some(core) = cores.into_iter().find(|c| c.id == SM_THREAD_CORE) {
            core_affinity::set_for_current(core);
        }
    }

    let mut events = Vec::new();
    while !ctx.kill_switch.load(Ordering::Acquire) {
        sm_thread_tx(&mut ctx);
        sm_thread_rx(&mut ctx, &mut events);
    }

    // Drain whatever endpoints enqueued before observing the kill switch;
    // nothing is transmitted past this point.
    let undelivered = ctx.sm_tx_list.drain().len()
        + ctx
            .peer_data
            .values()
            .map(|d| d.wi_tx_queue.len())
            .sum::<usize>();
    if undelivered > 0 {
        tracing::debug!(undelivered, "SM thread exiting with undelivered work items");
    }
}

/// Transmit SM packets enqueued by endpoint threads.
fn sm_thread_tx(ctx: &mut SmThreadCtx) {
    for wi in ctx.sm_tx_list.drain() {
        match wi.peer {
            // Server-side item: reply on the peer the request arrived on.
            Some(peer) => ctx.transport.send(peer, &wi.sm_pkt.to_bytes()),
            None => sm_thread_tx_client(ctx, wi),
        }
    }
}

/// Transmit a client-originated work item, opening a control-transport
/// peer to the destination Nexus if none exists yet.
fn sm_thread_tx_client(ctx: &mut SmThreadCtx, wi: SmWorkItem) {
    let uri = wi.sm_pkt.server.uri();

    if let Some(&peer) = ctx.name_map.get(&uri) {
        let data = ctx
            .peer_data
            .get_mut(&peer)
            .expect("client-mode peer without metadata");
        if data.connected {
            ctx.transport.send(peer, &wi.sm_pkt.to_bytes());
        } else {
            data.wi_tx_queue.push(wi);
        }
        return;
    }

    // First work item for this destination: resolve and connect. DNS
    // failures must not block the loop; the item goes straight back to
    // the submitter with an error.
    let addr = match uri.to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                tracing::warn!(%uri, "SM destination resolved to no addresses");
                sm_signal_err(ctx, wi, SmErrType::RoutingResolutionFailure);
                return;
            }
        },
        Err(e) => {
            tracing::warn!(%uri, error = %e, "cannot resolve SM destination");
            sm_signal_err(ctx, wi, SmErrType::RoutingResolutionFailure);
            return;
        }
    };

    let peer = ctx.transport.connect(addr);
    let mut data = SmPeerData {
        rem_uri: uri.clone(),
        connected: ctx.transport.is_established(peer),
        wi_tx_queue: Vec::new(),
    };
    if data.connected {
        ctx.transport.send(peer, &wi.sm_pkt.to_bytes());
    } else {
        data.wi_tx_queue.push(wi);
    }
    ctx.name_map.insert(uri, peer);
    ctx.peer_data.insert(peer, data);
}

/// Return a failed work item to the submitting endpoint's RX mailbox with
/// the given error. Dropped if the endpoint has unregistered.
fn sm_signal_err(ctx: &SmThreadCtx, mut wi: SmWorkItem, err_type: SmErrType) {
    wi.sm_pkt.err_type = err_type;
    let reg = ctx.registry.lock().unwrap();
    match &reg.hooks[wi.rpc_id as usize] {
        Some(entry) => entry.sm_rx_list.push(wi),
        None => {
            tracing::debug!(rpc_id = wi.rpc_id, "dropping SM error for unregistered endpoint")
        }
    }
}

/// Service control-transport events with a bounded wait, and demultiplex
/// received packets to endpoint mailboxes.
fn sm_thread_rx(ctx: &mut SmThreadCtx, events: &mut Vec<SmEvent>) {
    events.clear();
    ctx.transport.service(SM_POLL_INTERVAL, events);

    for event in events.drain(..) {
        match event {
            SmEvent::Connect(peer) => sm_thread_handle_connect(ctx, peer),
            SmEvent::Receive(peer, bytes) => sm_thread_handle_receive(ctx, peer, &bytes),
            SmEvent::Disconnect(peer) => sm_thread_handle_disconnect(ctx, peer),
        }
    }
}

fn sm_thread_handle_connect(ctx: &mut SmThreadCtx, peer: SmPeerId) {
    // Server-mode peers have no metadata and need no action until their
    // first packet arrives.
    let Some(data) = ctx.peer_data.get_mut(&peer) else {
        return;
    };
    data.connected = true;
    tracing::debug!(uri = %data.rem_uri, "SM peer connected");

    let queued = std::mem::take(&mut data.wi_tx_queue);
    for wi in queued {
        ctx.transport.send(peer, &wi.sm_pkt.to_bytes());
    }
}

fn sm_thread_handle_receive(ctx: &mut SmThreadCtx, peer: SmPeerId, bytes: &[u8]) {
    let sm_pkt = match SmPkt::from_bytes(bytes) {
        Ok(pkt) => pkt,
        Err(e) => {
            tracing::warn!(error = %e, "malformed SM packet, dropping");
            return;
        }
    };

    let rpc_id = sm_pkt.dest_rpc_id();
    let reg = ctx.registry.lock().unwrap();
    match &reg.hooks[rpc_id as usize] {
        Some(entry) => entry.sm_rx_list.push(SmWorkItem {
            rpc_id,
            sm_pkt,
            peer: Some(peer),
        }),
        // The endpoint may be shutting down; this is not an error.
        None => tracing::debug!(rpc_id, "dropping SM packet for unregistered endpoint"),
    }
}

fn sm_thread_handle_disconnect(ctx: &mut SmThreadCtx, peer: SmPeerId) {
    // Server-mode peers carry no bookkeeping.
    let Some(data) = ctx.peer_data.remove(&peer) else {
        return;
    };
    ctx.name_map.remove(&data.rem_uri);
    tracing::debug!(uri = %data.rem_uri, connected = data.connected, "SM peer disconnected");

    if !data.connected {
        // The connect never completed; fail the queued work items back to
        // their submitters.
        for wi in data.wi_tx_queue {
            sm_signal_err(ctx, wi, SmErrType::ConnectFailed);
        }
    }
}

// =============================================================================
// Background threads
// =============================================================================

fn bg_thread_func(ctx: BgThreadCtx) {
    let etid = ctx.tls_registry.init_tls();
    tracing::trace!(bg_thread_index = ctx.bg_thread_index, etid, "background worker up");

    loop {
        if ctx.kill_switch.load(Ordering::Acquire) {
            break;
        }
        let Some(wi) = ctx.bg_req_list.pop_timeout(BG_POLL_INTERVAL) else {
            continue;
        };
        bg_dispatch(&ctx, wi);
    }
}

/// Dispatch one work item. No lock is held across the handler call.
fn bg_dispatch(ctx: &BgThreadCtx, mut wi: BgWorkItem) {
    match wi.kind {
        BgWorkItemKind::Req => match ctx.req_func_table.get(wi.sslot.req_type) {
            Some(handler) => handler(&mut wi.sslot, &wi.context),
            None => {
                tracing::error!(
                    req_type = wi.sslot.req_type,
                    rpc_id = wi.endpoint.rpc_id(),
                    "no handler registered for request type"
                );
                // Surface as an error response; the session stays up.
                wi.sslot.err_type = SmErrType::ReqFuncAbsent;
                if let Some(cont) = wi.sslot.cont.take() {
                    cont(&mut wi.sslot, &wi.context);
                }
            }
        },
        BgWorkItemKind::Resp => {
            if let Some(cont) = wi.sslot.cont.take() {
                cont(&mut wi.sslot, &wi.context);
            }
        }
    }
}
