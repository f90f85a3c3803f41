//! Session-management packet types.
//!
//! SM packets are the control messages exchanged between Nexuses to open
//! and close sessions. They travel over the reliable control transport in
//! native byte order; this is an intra-cluster protocol and claims no
//! portability across architectures.

use std::fmt;

use crate::config::{INVALID_SESSION_NUM, MAX_HOSTNAME_LEN};
use crate::error::{Error, Result};

/// Serialized size of an SM packet.
pub const SM_PKT_SIZE: usize = std::mem::size_of::<SmPkt>();

/// Kind of a session-management packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktKind {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
    /// Server-initiated teardown of all sessions with a crashed client.
    Reset = 4,
}

impl SmPktKind {
    /// True for packets flowing client-to-server.
    #[inline]
    pub fn is_req(self) -> bool {
        matches!(self, SmPktKind::ConnectReq | SmPktKind::DisconnectReq)
    }

    /// The response kind paired with a request kind.
    pub fn response_kind(self) -> Option<SmPktKind> {
        match self {
            SmPktKind::ConnectReq => Some(SmPktKind::ConnectResp),
            SmPktKind::DisconnectReq => Some(SmPktKind::DisconnectResp),
            _ => None,
        }
    }
}

impl TryFrom<u8> for SmPktKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmPktKind::ConnectReq),
            1 => Ok(SmPktKind::ConnectResp),
            2 => Ok(SmPktKind::DisconnectReq),
            3 => Ok(SmPktKind::DisconnectResp),
            4 => Ok(SmPktKind::Reset),
            _ => Err(Error::InvalidSmPktKind(value)),
        }
    }
}

/// Error status carried in SM packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErrType {
    NoError = 0,
    /// The control transport could not reach the remote Nexus.
    ConnectFailed = 1,
    /// The destination hostname did not resolve.
    RoutingResolutionFailure = 2,
    /// No endpoint with the requested RPC ID at the server.
    InvalidRemoteRpcId = 3,
    /// No handler registered for the request type.
    ReqFuncAbsent = 4,
}

impl SmErrType {
    #[inline]
    pub fn is_error(self) -> bool {
        self != SmErrType::NoError
    }
}

impl TryFrom<u8> for SmErrType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmErrType::NoError),
            1 => Ok(SmErrType::ConnectFailed),
            2 => Ok(SmErrType::RoutingResolutionFailure),
            3 => Ok(SmErrType::InvalidRemoteRpcId),
            4 => Ok(SmErrType::ReqFuncAbsent),
            _ => Err(Error::InvalidSmErrType(value)),
        }
    }
}

/// Fixed-width metadata identifying one end of a session: the Nexus
/// management address plus the endpoint ID within that process.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct SmEndpoint {
    hostname: [u8; MAX_HOSTNAME_LEN],
    pub sm_udp_port: u16,
    pub rpc_id: u8,
}

impl SmEndpoint {
    /// Build endpoint metadata. Fails if the hostname does not fit the
    /// fixed field (it is stored NUL-padded).
    pub fn new(hostname: &str, sm_udp_port: u16, rpc_id: u8) -> Result<Self> {
        let bytes = hostname.as_bytes();
        if bytes.len() >= MAX_HOSTNAME_LEN {
            return Err(Error::HostnameTooLong(bytes.len()));
        }
        let mut field = [0u8; MAX_HOSTNAME_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            hostname: field,
            sm_udp_port,
            rpc_id,
        })
    }

    /// The hostname, stripped of NUL padding.
    pub fn hostname(&self) -> &str {
        let field = &self.hostname;
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        std::str::from_utf8(&field[..len]).unwrap_or("")
    }

    /// `host:port` form used to key client-session state.
    pub fn uri(&self) -> String {
        format!("{}:{}", self.hostname(), { self.sm_udp_port })
    }
}

impl fmt::Debug for SmEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SmEndpoint {{ {}:{}, rpc_id {} }}",
            self.hostname(),
            { self.sm_udp_port },
            self.rpc_id
        )
    }
}

/// A session-management packet: kind, error status, metadata for both
/// session ends, and the session numbers assigned by each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct SmPkt {
    kind: SmPktKind,
    pub err_type: SmErrType,
    pub client: SmEndpoint,
    pub server: SmEndpoint,
    pub client_session_num: u16,
    pub server_session_num: u16,
}

impl SmPkt {
    /// Create a packet with no error and unassigned session numbers.
    pub fn new(kind: SmPktKind, client: SmEndpoint, server: SmEndpoint) -> Self {
        Self {
            kind,
            err_type: SmErrType::NoError,
            client,
            server,
            client_session_num: INVALID_SESSION_NUM,
            server_session_num: INVALID_SESSION_NUM,
        }
    }

    #[inline]
    pub fn kind(&self) -> SmPktKind {
        self.kind
    }

    /// Rewrite the kind, e.g. to turn a received request into its
    /// response in place.
    #[inline]
    pub fn set_kind(&mut self, kind: SmPktKind) {
        self.kind = kind;
    }

    /// True for packets flowing client-to-server.
    #[inline]
    pub fn is_req(&self) -> bool {
        self.kind.is_req()
    }

    /// The RPC ID of the endpoint this packet should be delivered to:
    /// requests target the server endpoint, responses the client.
    #[inline]
    pub fn dest_rpc_id(&self) -> u8 {
        if self.is_req() {
            self.server.rpc_id
        } else {
            self.client.rpc_id
        }
    }

    /// Serialize in native byte order.
    pub fn to_bytes(&self) -> [u8; SM_PKT_SIZE] {
        let mut bytes = [0u8; SM_PKT_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const Self as *const u8,
                bytes.as_mut_ptr(),
                SM_PKT_SIZE,
            );
        }
        bytes
    }

    /// Deserialize, validating length and the kind and error bytes before
    /// any enum is materialized.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_PKT_SIZE {
            return Err(Error::BufferTooSmall {
                required: SM_PKT_SIZE,
                available: bytes.len(),
            });
        }
        SmPktKind::try_from(bytes[0])?;
        SmErrType::try_from(bytes[1])?;

        let mut pkt = std::mem::MaybeUninit::<Self>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                pkt.as_mut_ptr() as *mut u8,
                SM_PKT_SIZE,
            );
            Ok(pkt.assume_init())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pkt(kind: SmPktKind) -> SmPkt {
        let client = SmEndpoint::new("client-host", 31850, 7).unwrap();
        let server = SmEndpoint::new("server-host", 31851, 9).unwrap();
        SmPkt::new(kind, client, server)
    }

    #[test]
    fn test_endpoint_hostname_padding() {
        let ep = SmEndpoint::new("node-3", 31850, 2).unwrap();
        assert_eq!(ep.hostname(), "node-3");
        assert_eq!(ep.uri(), "node-3:31850");
        assert_eq!(ep.rpc_id, 2);
    }

    #[test]
    fn test_endpoint_hostname_too_long() {
        let long = "h".repeat(MAX_HOSTNAME_LEN);
        assert!(matches!(
            SmEndpoint::new(&long, 0, 0),
            Err(Error::HostnameTooLong(_))
        ));
    }

    #[test]
    fn test_pkt_roundtrip() {
        let mut pkt = sample_pkt(SmPktKind::ConnectReq);
        pkt.client_session_num = 11;
        pkt.err_type = SmErrType::NoError;

        let bytes = pkt.to_bytes();
        let decoded = SmPkt::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.kind(), SmPktKind::ConnectReq);
        assert_eq!(decoded.client.hostname(), "client-host");
        assert_eq!({ decoded.client_session_num }, 11);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let pkt = sample_pkt(SmPktKind::Reset);
        let mut bytes = pkt.to_bytes();

        bytes[0] = 200;
        assert!(matches!(
            SmPkt::from_bytes(&bytes),
            Err(Error::InvalidSmPktKind(200))
        ));

        bytes[0] = SmPktKind::Reset as u8;
        bytes[1] = 99;
        assert!(matches!(
            SmPkt::from_bytes(&bytes),
            Err(Error::InvalidSmErrType(99))
        ));

        assert!(matches!(
            SmPkt::from_bytes(&bytes[..8]),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_direction_helpers() {
        let req = sample_pkt(SmPktKind::ConnectReq);
        assert!(req.is_req());
        assert_eq!(req.dest_rpc_id(), 9);

        let resp = sample_pkt(SmPktKind::ConnectResp);
        assert!(!resp.is_req());
        assert_eq!(resp.dest_rpc_id(), 7);

        assert_eq!(
            SmPktKind::ConnectReq.response_kind(),
            Some(SmPktKind::ConnectResp)
        );
        assert_eq!(
            SmPktKind::DisconnectReq.response_kind(),
            Some(SmPktKind::DisconnectResp)
        );
        assert_eq!(SmPktKind::Reset.response_kind(), None);
    }
}
