//! Cross-Nexus integration tests.
//!
//! These run two Nexuses on the loopback interface and exercise the full
//! session-management path: endpoint to SM thread, control transport
//! across processes-in-miniature, SM thread to the destination endpoint's
//! mailbox.
//!
//! Run with:
//! ```bash
//! cargo test --test nexus_tests -- --nocapture
//! ```

mod common;

use std::time::{Duration, Instant};

use common::{poll_until, recv_sm_work_item};
use nexrpc::{Hook, Nexus, SmEndpoint, SmErrType, SmPkt, SmPktKind, SmWorkItem};

// =============================================================================
// Loopback session management
// =============================================================================

#[test]
fn test_loopback_connect_request() {
    let nexus_a = Nexus::new("localhost", 31850, 0).unwrap();
    let nexus_b = Nexus::new("localhost", 31851, 0).unwrap();

    let mut hook_a = Hook::new(7);
    let mut hook_b = Hook::new(9);
    nexus_a.register_hook(&mut hook_a).unwrap();
    nexus_b.register_hook(&mut hook_b).unwrap();

    // Endpoint 7 on A asks for a session to endpoint 9 on B.
    let client = SmEndpoint::new("localhost", 31850, 7).unwrap();
    let server = SmEndpoint::new("localhost", 31851, 9).unwrap();
    let mut sm_pkt = SmPkt::new(SmPktKind::ConnectReq, client, server);
    sm_pkt.client_session_num = 0;

    hook_a.sm_tx_list().push(SmWorkItem {
        rpc_id: 7,
        sm_pkt,
        peer: None,
    });

    let wi = recv_sm_work_item(&hook_b.sm_rx_list, Duration::from_millis(500))
        .expect("connect request did not reach endpoint 9 within 500 ms");
    assert_eq!(wi.rpc_id, 9);
    assert_eq!(wi.sm_pkt.kind(), SmPktKind::ConnectReq);
    assert_eq!(wi.sm_pkt.err_type, SmErrType::NoError);
    assert_eq!(wi.sm_pkt.client.rpc_id, 7);
    assert_eq!(wi.sm_pkt.server.rpc_id, 9);
    assert_eq!({ wi.sm_pkt.client_session_num }, 0);
    assert!(wi.peer.is_some(), "server-side item must carry the control peer");

    nexus_a.unregister_hook(&mut hook_a);
    nexus_b.unregister_hook(&mut hook_b);
}

#[test]
fn test_loopback_connect_response_roundtrip() {
    let nexus_a = Nexus::new("localhost", 31852, 0).unwrap();
    let nexus_b = Nexus::new("localhost", 31853, 0).unwrap();

    let mut hook_a = Hook::new(1);
    let mut hook_b = Hook::new(2);
    nexus_a.register_hook(&mut hook_a).unwrap();
    nexus_b.register_hook(&mut hook_b).unwrap();

    let client = SmEndpoint::new("localhost", 31852, 1).unwrap();
    let server = SmEndpoint::new("localhost", 31853, 2).unwrap();
    hook_a.sm_tx_list().push(SmWorkItem {
        rpc_id: 1,
        sm_pkt: SmPkt::new(SmPktKind::ConnectReq, client, server),
        peer: None,
    });

    // The server endpoint answers on the peer the request arrived on.
    let req = recv_sm_work_item(&hook_b.sm_rx_list, Duration::from_secs(2))
        .expect("no connect request at server");
    let mut resp_pkt = req.sm_pkt;
    resp_pkt.set_kind(SmPktKind::ConnectResp);
    resp_pkt.server_session_num = 33;
    hook_b.sm_tx_list().push(SmWorkItem {
        rpc_id: 2,
        sm_pkt: resp_pkt,
        peer: req.peer,
    });

    let resp = recv_sm_work_item(&hook_a.sm_rx_list, Duration::from_secs(2))
        .expect("no connect response at client");
    assert_eq!(resp.rpc_id, 1);
    assert_eq!(resp.sm_pkt.kind(), SmPktKind::ConnectResp);
    assert_eq!({ resp.sm_pkt.server_session_num }, 33);

    nexus_a.unregister_hook(&mut hook_a);
    nexus_b.unregister_hook(&mut hook_b);
}

#[test]
fn test_packet_for_unregistered_endpoint_dropped() {
    let nexus_a = Nexus::new("localhost", 31854, 0).unwrap();
    let nexus_b = Nexus::new("localhost", 31855, 0).unwrap();

    let mut hook_a = Hook::new(4);
    nexus_a.register_hook(&mut hook_a).unwrap();
    // No hook for endpoint 42 on B.

    let client = SmEndpoint::new("localhost", 31854, 4).unwrap();
    let server = SmEndpoint::new("localhost", 31855, 42).unwrap();
    hook_a.sm_tx_list().push(SmWorkItem {
        rpc_id: 4,
        sm_pkt: SmPkt::new(SmPktKind::ConnectReq, client, server),
        peer: None,
    });

    // The packet is dropped at B; nothing bounces back to A either.
    std::thread::sleep(Duration::from_millis(400));
    assert!(hook_a.sm_rx_list.is_empty());
    assert!(!nexus_b.rpc_id_exists(42));

    nexus_a.unregister_hook(&mut hook_a);
}

#[test]
fn test_unresolvable_hostname_signalled_to_submitter() {
    let nexus = Nexus::new("localhost", 31856, 0).unwrap();

    let mut hook = Hook::new(6);
    nexus.register_hook(&mut hook).unwrap();

    let client = SmEndpoint::new("localhost", 31856, 6).unwrap();
    let server = SmEndpoint::new("no-such-host.invalid", 31857, 1).unwrap();
    hook.sm_tx_list().push(SmWorkItem {
        rpc_id: 6,
        sm_pkt: SmPkt::new(SmPktKind::ConnectReq, client, server),
        peer: None,
    });

    let wi = recv_sm_work_item(&hook.sm_rx_list, Duration::from_secs(5))
        .expect("resolution failure not signalled");
    assert_eq!(wi.sm_pkt.err_type, SmErrType::RoutingResolutionFailure);
    assert_eq!(wi.sm_pkt.kind(), SmPktKind::ConnectReq);

    nexus.unregister_hook(&mut hook);
}

// =============================================================================
// Teardown
// =============================================================================

#[test]
fn test_teardown_with_inflight_sm_traffic() {
    let nexus_a = Nexus::new("localhost", 31858, 2).unwrap();
    let nexus_b = Nexus::new("localhost", 31859, 2).unwrap();

    let mut hook_a = Hook::new(1);
    nexus_a.register_hook(&mut hook_a).unwrap();

    let client = SmEndpoint::new("localhost", 31858, 1).unwrap();
    let server = SmEndpoint::new("localhost", 31859, 3).unwrap();
    for _ in 0..16 {
        hook_a.sm_tx_list().push(SmWorkItem {
            rpc_id: 1,
            sm_pkt: SmPkt::new(SmPktKind::ConnectReq, client, server),
            peer: None,
        });
    }

    nexus_a.unregister_hook(&mut hook_a);
    let start = Instant::now();
    drop(nexus_a);
    drop(nexus_b);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "teardown did not complete in bounded time"
    );
}

#[test]
fn test_sequential_nexus_lifecycles_on_one_port() {
    // Destroying a Nexus releases the management port and the TSC/TLS
    // state; a fresh Nexus can take its place.
    let first = Nexus::new("localhost", 31860, 1).unwrap();
    let first_freq = first.freq_ghz;
    drop(first);

    assert!(poll_until(Duration::from_secs(2), || {
        Nexus::new("localhost", 31860, 1).is_ok()
    }));
    let second = Nexus::new("localhost", 31861, 1).unwrap();
    assert!(second.freq_ghz > 0.1 && first_freq > 0.1);
}
