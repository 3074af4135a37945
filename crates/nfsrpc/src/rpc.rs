//! ONC RPC version 2 message headers.
//!
//! # Protocol
//! RFC 5531. Only what a client needs: encoding call headers and decoding
//! reply headers. Credentials are carried as opaque bytes.

use {
    crate::{
        error::Error,
        utils::Result,
        xdr::{XdrBuffer, XdrReader},
    },
    bytes::Bytes,
    enum_primitive::*,
    std::{
        sync::atomic::{AtomicU32, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// The only RPC protocol version spoken.
pub const RPC_VERSION: u32 = 2;

/// Upper bound on an `opaque_auth` body.
pub const MAX_AUTH_BYTES: usize = 400;

enum_from_primitive! {
    #[doc = "Direction of an RPC message"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum MsgType {
        Call    = 0,
        Reply   = 1,
    }
}

enum_from_primitive! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum ReplyStat {
        Accepted    = 0,
        Denied      = 1,
    }
}

enum_from_primitive! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum AcceptStat {
        Success         = 0,
        ProgUnavail     = 1,
        ProgMismatch    = 2,
        ProcUnavail     = 3,
        GarbageArgs     = 4,
        SystemErr       = 5,
    }
}

enum_from_primitive! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum RejectStat {
        RpcMismatch = 0,
        AuthError   = 1,
    }
}

enum_from_primitive! {
    #[doc = "Authentication flavors"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum AuthFlavor {
        AuthNone    = 0,
        AuthSys     = 1,
        AuthShort   = 2,
        AuthDh      = 3,
        RpcSecGss   = 6,
    }
}

/// Credential or verifier, carried without interpretation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Bytes,
}

impl OpaqueAuth {
    pub fn none() -> OpaqueAuth {
        OpaqueAuth {
            flavor: AuthFlavor::AuthNone as u32,
            body: Bytes::new(),
        }
    }

    /// AUTH_SYS credential.
    pub fn unix(stamp: u32, machine: &str, uid: u32, gid: u32, gids: &[u32]) -> OpaqueAuth {
        let mut body = XdrBuffer::new();
        body.put_u32(stamp).put_string(machine).put_u32(uid).put_u32(gid);
        body.put_u32(gids.len() as u32);
        for gid in gids {
            body.put_u32(*gid);
        }
        OpaqueAuth {
            flavor: AuthFlavor::AuthSys as u32,
            body: body.to_bytes(),
        }
    }

    fn encode(&self, buf: &mut XdrBuffer) {
        buf.put_u32(self.flavor).put_opaque(&self.body);
    }

    fn decode(r: &mut XdrReader) -> Result<OpaqueAuth> {
        let flavor = r.get_u32()?;
        let body = r.get_opaque()?;
        if body.len() > MAX_AUTH_BYTES {
            return Err(Error::Protocol(format!(
                "auth body of {} bytes exceeds {}",
                body.len(),
                MAX_AUTH_BYTES
            )));
        }
        Ok(OpaqueAuth { flavor, body })
    }
}

/// Header of an outbound call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: OpaqueAuth,
    pub verifier: OpaqueAuth,
}

impl CallHeader {
    pub fn new(xid: u32, program: u32, version: u32, procedure: u32) -> CallHeader {
        CallHeader {
            xid,
            program,
            version,
            procedure,
            credential: OpaqueAuth::none(),
            verifier: OpaqueAuth::none(),
        }
    }

    pub fn credential(mut self, credential: OpaqueAuth) -> Self {
        self.credential = credential;
        self
    }

    /// Start a message with this header; procedure arguments follow.
    pub fn encode(&self) -> XdrBuffer {
        let mut buf = XdrBuffer::with_capacity(64);
        buf.put_u32(self.xid)
            .put_u32(MsgType::Call as u32)
            .put_u32(RPC_VERSION)
            .put_u32(self.program)
            .put_u32(self.version)
            .put_u32(self.procedure);
        self.credential.encode(&mut buf);
        self.verifier.encode(&mut buf);
        buf
    }
}

/// Body of a reply, after the xid and message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    RpcMismatch { low: u32, high: u32 },
    AuthError { stat: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: u32,
    pub verifier: Option<OpaqueAuth>,
    pub body: ReplyBody,
}

fn unknown(what: &str, v: u32) -> Error {
    Error::Protocol(format!("unknown {} {}", what, v))
}

impl ReplyHeader {
    /// Read a reply header; on success the reader is left at the procedure
    /// results.
    pub fn decode(r: &mut XdrReader) -> Result<ReplyHeader> {
        let xid = r.get_u32()?;
        let msg_type = r.get_u32()?;
        match MsgType::from_u32(msg_type) {
            Some(MsgType::Reply) => {}
            Some(MsgType::Call) => {
                return Err(Error::Protocol(format!("xid {:#010x} is a call, not a reply", xid)));
            }
            None => return Err(unknown("message type", msg_type)),
        }

        let stat = r.get_u32()?;
        let (verifier, body) = match ReplyStat::from_u32(stat) {
            Some(ReplyStat::Accepted) => {
                let verifier = OpaqueAuth::decode(r)?;
                let accept = r.get_u32()?;
                let body = match AcceptStat::from_u32(accept) {
                    Some(AcceptStat::Success) => ReplyBody::Success,
                    Some(AcceptStat::ProgUnavail) => ReplyBody::ProgUnavail,
                    Some(AcceptStat::ProgMismatch) => ReplyBody::ProgMismatch {
                        low: r.get_u32()?,
                        high: r.get_u32()?,
                    },
                    Some(AcceptStat::ProcUnavail) => ReplyBody::ProcUnavail,
                    Some(AcceptStat::GarbageArgs) => ReplyBody::GarbageArgs,
                    Some(AcceptStat::SystemErr) => ReplyBody::SystemErr,
                    None => return Err(unknown("accept status", accept)),
                };
                (Some(verifier), body)
            }
            Some(ReplyStat::Denied) => {
                let reject = r.get_u32()?;
                let body = match RejectStat::from_u32(reject) {
                    Some(RejectStat::RpcMismatch) => ReplyBody::RpcMismatch {
                        low: r.get_u32()?,
                        high: r.get_u32()?,
                    },
                    Some(RejectStat::AuthError) => ReplyBody::AuthError { stat: r.get_u32()? },
                    None => return Err(unknown("reject status", reject)),
                };
                (None, body)
            }
            None => return Err(unknown("reply status", stat)),
        };

        Ok(ReplyHeader {
            xid,
            verifier,
            body,
        })
    }

    /// `Ok` for an accepted, successful reply; a protocol error otherwise.
    pub fn into_result(self) -> Result<ReplyHeader> {
        let reason = match self.body {
            ReplyBody::Success => return Ok(self),
            ReplyBody::ProgUnavail => "program unavailable".to_owned(),
            ReplyBody::ProgMismatch { low, high } => {
                format!("program version mismatch, server supports {}..={}", low, high)
            }
            ReplyBody::ProcUnavail => "procedure unavailable".to_owned(),
            ReplyBody::GarbageArgs => "server could not decode arguments".to_owned(),
            ReplyBody::SystemErr => "server system error".to_owned(),
            ReplyBody::RpcMismatch { low, high } => {
                format!("rpc version mismatch, server supports {}..={}", low, high)
            }
            ReplyBody::AuthError { stat } => format!("authentication error {}", stat),
        };
        Err(Error::Protocol(format!("xid {:#010x}: {}", self.xid, reason)))
    }
}

/// Hands out XIDs for one process.
///
/// Starts from a time-derived value so restarted clients are unlikely to
/// reuse XIDs a server may still have cached.
#[derive(Debug)]
pub struct XidGenerator {
    next: AtomicU32,
}

impl Default for XidGenerator {
    fn default() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_secs() as u32) ^ d.subsec_nanos())
            .unwrap_or(1);
        XidGenerator::starting_at(seed)
    }
}

impl XidGenerator {
    pub fn new() -> XidGenerator {
        Default::default()
    }

    pub fn starting_at(xid: u32) -> XidGenerator {
        XidGenerator {
            next: AtomicU32::new(xid),
        }
    }

    pub fn next_xid(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted_reply(xid: u32, accept: u32, extra: &[u32]) -> Bytes {
        let mut buf = XdrBuffer::new();
        buf.put_u32(xid).put_u32(1).put_u32(0);
        OpaqueAuth::none().encode(&mut buf);
        buf.put_u32(accept);
        for v in extra {
            buf.put_u32(*v);
        }
        buf.to_bytes()
    }

    #[test]
    fn call_header_layout() {
        let msg = CallHeader::new(0x01020304, 100003, 3, 0).encode();
        let mut r = XdrReader::new(msg.to_bytes());
        assert_eq!(r.get_u32().unwrap(), 0x01020304);
        assert_eq!(r.get_u32().unwrap(), 0);
        assert_eq!(r.get_u32().unwrap(), RPC_VERSION);
        assert_eq!(r.get_u32().unwrap(), 100003);
        assert_eq!(r.get_u32().unwrap(), 3);
        assert_eq!(r.get_u32().unwrap(), 0);
        // AUTH_NONE credential and verifier
        for _ in 0..2 {
            assert_eq!(r.get_u32().unwrap(), 0);
            assert_eq!(r.get_opaque().unwrap().len(), 0);
        }
        assert_eq!(r.remaining(), 0);
        assert_eq!(msg.xid(), Some(0x01020304));
    }

    #[test]
    fn auth_sys_credential_body() {
        let cred = OpaqueAuth::unix(7, "client", 1000, 100, &[100, 10]);
        assert_eq!(cred.flavor, 1);
        let mut r = XdrReader::new(cred.body.clone());
        assert_eq!(r.get_u32().unwrap(), 7);
        assert_eq!(r.get_string().unwrap(), "client");
        assert_eq!(r.get_u32().unwrap(), 1000);
        assert_eq!(r.get_u32().unwrap(), 100);
        assert_eq!(r.get_u32().unwrap(), 2);
    }

    #[test]
    fn decode_success_leaves_results() {
        let mut bytes = XdrBuffer::from(accepted_reply(9, 0, &[]));
        bytes.put_u32(0xabcd);
        let mut r = XdrReader::new(bytes.to_bytes());

        let header = ReplyHeader::decode(&mut r).unwrap().into_result().unwrap();
        assert_eq!(header.xid, 9);
        assert_eq!(header.body, ReplyBody::Success);
        assert_eq!(r.get_u32().unwrap(), 0xabcd);
    }

    #[test]
    fn decode_prog_mismatch() {
        let mut r = XdrReader::new(accepted_reply(9, 2, &[2, 4]));
        let header = ReplyHeader::decode(&mut r).unwrap();
        assert_eq!(header.body, ReplyBody::ProgMismatch { low: 2, high: 4 });
        assert!(matches!(header.into_result(), Err(Error::Protocol(_))));
    }

    #[test]
    fn decode_denied() {
        let mut buf = XdrBuffer::new();
        buf.put_u32(5).put_u32(1).put_u32(1).put_u32(1).put_u32(2);
        let header = ReplyHeader::decode(&mut XdrReader::new(buf.to_bytes())).unwrap();
        assert_eq!(header.verifier, None);
        assert_eq!(header.body, ReplyBody::AuthError { stat: 2 });
    }

    #[test]
    fn decode_rejects_calls_and_garbage() {
        let call = CallHeader::new(1, 2, 3, 4).encode().to_bytes();
        assert!(ReplyHeader::decode(&mut XdrReader::new(call)).is_err());

        let mut r = XdrReader::new(accepted_reply(1, 99, &[]));
        assert!(matches!(ReplyHeader::decode(&mut r), Err(Error::Protocol(_))));
    }

    #[test]
    fn xids_are_sequential() {
        let xids = XidGenerator::starting_at(u32::MAX);
        assert_eq!(xids.next_xid(), u32::MAX);
        assert_eq!(xids.next_xid(), 0);
        assert_eq!(xids.next_xid(), 1);
    }
}
