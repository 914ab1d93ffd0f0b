//! Audio Stream Control Service (\[ASCS\]).
//!
//! Exposes one characteristic per Audio Stream Endpoint and a control point
//! through which a client drives each endpoint's state machine:
//!
//! ```text
//! Idle -> Config -> QoS -> Enabling -> Streaming -> Disabling -> QoS
//!                                 \________________________/
//!                                          Release -> Releasing -> Idle
//! ```
//!
//! Endpoint state is kept per peer. A bonded peer's endpoints survive a
//! disconnect with their codec configuration cached; a non-bonded peer's
//! endpoints are released outright.

use std::fmt::Debug;
use std::sync::Arc;

use structbuf::{Pack, Packer, StructBuf};
use tracing::{debug, warn};

use murmur_const::{Characteristic, Service};

use crate::att::{Access, ErrorCode};
use crate::gatt::{Builder, Db, Io, IoReq, IoResult, Prop};
use crate::le::Addr;
use crate::sec::BondStore;
use crate::{Error, Result, SyncMutex};

use super::Sessions;

/// Endpoint direction, fixed per ASE characteristic.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum Dir {
    Sink = 0x01,
    Source = 0x02,
}

/// Endpoint states (\[ASCS\] Section 3).
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq,
    num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum AseState {
    #[default]
    Idle = 0x00,
    Config = 0x01,
    QoS = 0x02,
    Enabling = 0x03,
    Streaming = 0x04,
    Disabling = 0x05,
    Releasing = 0x06,
}

/// Control point opcodes (\[ASCS\] Section 4).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum Op {
    Config = 0x01,
    Qos = 0x02,
    Enable = 0x03,
    Start = 0x04,
    Disable = 0x05,
    Stop = 0x06,
    Metadata = 0x07,
    Release = 0x08,
}

/// Control point response codes (\[ASCS\] Table 4.5).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum RspCode {
    Success = 0x00,
    NotSupported = 0x01,
    Truncated = 0x02,
    InvalidAse = 0x03,
    InvalidAseState = 0x04,
    CapUnsupported = 0x05,
    ConfUnsupported = 0x06,
    ConfRejected = 0x07,
    ConfInvalid = 0x08,
    MetadataUnsupported = 0x09,
    MetadataRejected = 0x0A,
    MetadataInvalid = 0x0B,
    NoMem = 0x0C,
    Unspecified = 0x0D,
}

/// Response reason codes identifying the failing parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Reason {
    None = 0x00,
    Direction = 0x01,
    Codec = 0x02,
    CodecDataLen = 0x03,
    CodecData = 0x04,
    Interval = 0x05,
    Framing = 0x06,
    Phy = 0x07,
    Sdu = 0x08,
    Rtn = 0x09,
    Latency = 0x0A,
    Pd = 0x0B,
    Metadata = 0x0C,
}

crate::impl_display_via_debug! { Dir, AseState, Op, RspCode, Reason }

/// Codec identifier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CodecId {
    pub id: u8,
    pub cid: u16,
    pub vid: u16,
}

/// Codec configuration accepted for an endpoint.
#[derive(Clone, Debug)]
pub struct CodecConfig {
    pub codec: CodecId,
    /// Target latency, `0x01..=0x03`.
    pub latency: u8,
    /// Target PHY, `0x01..=0x03`.
    pub phy: u8,
    /// LTV-formatted codec-specific configuration.
    pub data: Vec<u8>,
}

/// QoS configuration accepted for an endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct QosConfig {
    pub interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub sdu: u16,
    pub rtn: u8,
    pub latency: u16,
    pub pd: u32,
}

/// Isochronous channel binding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelId {
    pub cig: u8,
    pub cis: u8,
}

/// Error returned by the upper layer for a stream operation. Mapped onto a
/// control point response code according to the opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum StreamError {
    NoMemory,
    InvalidArgument,
    NotSupported,
    InvalidState,
    Unspecified,
}

/// Upper-layer hooks invoked as endpoints move through their lifecycle. The
/// default implementations accept every operation.
#[allow(unused_variables)]
pub trait StreamOps: Debug + Send + Sync {
    fn config(&self, peer: Addr, ase: u8, cfg: &CodecConfig) -> std::result::Result<(), StreamError> {
        Ok(())
    }
    fn qos(&self, peer: Addr, ase: u8, qos: &QosConfig) -> std::result::Result<(), StreamError> {
        Ok(())
    }
    fn enable(&self, peer: Addr, ase: u8, meta: &[u8]) -> std::result::Result<(), StreamError> {
        Ok(())
    }
    fn start(&self, peer: Addr, ase: u8) -> std::result::Result<(), StreamError> {
        Ok(())
    }
    fn disable(&self, peer: Addr, ase: u8) -> std::result::Result<(), StreamError> {
        Ok(())
    }
    fn stop(&self, peer: Addr, ase: u8) -> std::result::Result<(), StreamError> {
        Ok(())
    }
    fn metadata(&self, peer: Addr, ase: u8, meta: &[u8]) -> std::result::Result<(), StreamError> {
        Ok(())
    }
    /// Releases the endpoint's stream. `cache` keeps the codec configuration
    /// for a bonded peer that may reconnect.
    fn release(&self, peer: Addr, ase: u8, cache: bool) -> std::result::Result<(), StreamError> {
        Ok(())
    }
}

/// Accept-all stream hooks.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullOps;

impl StreamOps for NullOps {}

/// Service configuration.
#[derive(Clone, Debug)]
pub struct AudioStreamConfig {
    /// Endpoint directions. Endpoint IDs are assigned sequentially from 1.
    pub ases: Vec<Dir>,
    /// Maximum concurrent peer sessions, including detached bonded peers.
    pub max_sessions: usize,
}

impl Default for AudioStreamConfig {
    fn default() -> Self {
        Self {
            ases: vec![Dir::Sink, Dir::Source],
            max_sessions: 2,
        }
    }
}

/// Server-preferred presentation delay bounds reported while an endpoint is
/// codec configured, in microseconds.
const PREF_PD_MIN: u32 = 0;
const PREF_PD_MAX: u32 = 40_000;

/// Control point response scratch size.
const RSP_SIZE: usize = 2 + 3 * 32;

/// Audio Stream Control service.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct AudioStreamService(Arc<SyncMutex<Engine>>);

impl AudioStreamService {
    /// Creates the service.
    pub fn new(
        c: &AudioStreamConfig,
        ops: Arc<dyn StreamOps>,
        bonds: Arc<dyn BondStore>,
    ) -> Result<Self> {
        if c.ases.is_empty() || c.ases.len() > 0x7F || c.max_sessions == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self(Arc::new(SyncMutex::new(Engine {
            dirs: c.ases.clone(),
            sessions: Vec::with_capacity(c.max_sessions),
            max_sessions: c.max_sessions,
            ops,
            bonds,
            ntf: Sessions::new(),
        }))))
    }

    /// Defines the service structure.
    pub fn define(&self, db: &mut Builder<Db>) {
        const RO: Access = Access::READ.encrypt();
        const WO: Access = Access::WRITE.encrypt();
        let ccc = Access::READ | WO;
        let dirs = self.0.lock().dirs.clone();
        db.primary_service(Service::AudioStreamControl, [], |db| {
            for (i, &dir) in dirs.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let id = i as u8 + 1;
                let uuid = match dir {
                    Dir::Sink => Characteristic::SinkAse,
                    Dir::Source => Characteristic::SourceAse,
                };
                db.characteristic(
                    uuid,
                    Prop::READ | Prop::NOTIFY,
                    RO,
                    Io::with(&self.0, move |t, req| t.lock().ase_io(id, req)),
                    |db| {
                        db.cccd(ccc);
                    },
                );
            }
            db.characteristic(
                Characteristic::AseControlPoint,
                Prop::WRITE | Prop::WRITE_CMD | Prop::NOTIFY,
                WO,
                Io::with(&self.0, |t, req| t.lock().cp_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
        });
    }

    /// Returns the endpoint state for a peer session.
    #[must_use]
    pub fn ase_state(&self, peer: Addr, id: u8) -> Option<AseState> {
        let eng = self.0.lock();
        let s = eng.sessions.iter().find(|s| s.peer == peer)?;
        s.ases.get(usize::from(id).checked_sub(1)?).map(|a| a.state)
    }

    /// Handles a peer disconnect. Bonded peers detach with their codec
    /// configuration cached; everything else is released.
    pub fn disconnected(&self, peer: Addr) {
        let mut eng = self.0.lock();
        eng.ntf.drop_peer(peer);
        let bonded = eng.bonds.is_bonded(peer);
        let ops = Arc::clone(&eng.ops);
        let Some(i) = eng.sessions.iter().position(|s| s.peer == peer) else {
            return;
        };
        if bonded {
            debug!("Detaching {peer}");
            let s = &mut eng.sessions[i];
            s.attached = false;
            for ase in &mut s.ases {
                if ase.state != AseState::Idle {
                    let _ = ops.release(peer, ase.id, true);
                    ase.channel = None;
                    ase.qos = None;
                    ase.state = AseState::Config;
                }
            }
        } else {
            debug!("Clearing {peer}");
            let s = &mut eng.sessions[i];
            for ase in &mut s.ases {
                if ase.state != AseState::Idle {
                    let _ = ops.release(peer, ase.id, false);
                    ase.reset();
                }
            }
            eng.sessions.swap_remove(i);
        }
    }
}

/// One endpoint within a peer session.
#[derive(Debug)]
struct Ase {
    id: u8,
    dir: Dir,
    state: AseState,
    codec: Option<CodecConfig>,
    qos: Option<QosConfig>,
    metadata: Vec<u8>,
    channel: Option<ChannelId>,
}

impl Ase {
    fn new(id: u8, dir: Dir) -> Self {
        Self {
            id,
            dir,
            state: AseState::Idle,
            codec: None,
            qos: None,
            metadata: Vec::new(),
            channel: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.id, self.dir);
    }

    /// Serializes the ASE characteristic value (\[ASCS\] Table 4.6).
    fn status(&self, p: &mut Packer) {
        p.u8(self.id).u8(self.state);
        match self.state {
            AseState::Idle | AseState::Releasing => {}
            AseState::Config => {
                let c = self.codec.as_ref().expect("configured ASE without codec");
                p.u8(self.dir).u8(0).u8(c.phy).u8(0);
                p.u16(u16::from(c.latency));
                p.put(&PREF_PD_MIN.to_le_bytes()[..3]);
                p.put(&PREF_PD_MAX.to_le_bytes()[..3]);
                p.u8(c.codec.id).u16(c.codec.cid).u16(c.codec.vid);
                #[allow(clippy::cast_possible_truncation)]
                p.u8(c.data.len() as u8);
                p.put(&c.data);
            }
            AseState::QoS => {
                let ch = self.channel.unwrap_or(ChannelId { cig: 0, cis: 0 });
                let q = self.qos.unwrap_or_default();
                p.u8(ch.cig).u8(ch.cis);
                p.put(&q.interval.to_le_bytes()[..3]);
                p.u8(q.framing).u8(q.phy).u16(q.sdu).u8(q.rtn).u16(q.latency);
                p.put(&q.pd.to_le_bytes()[..3]);
            }
            AseState::Enabling | AseState::Streaming | AseState::Disabling => {
                let ch = self.channel.unwrap_or(ChannelId { cig: 0, cis: 0 });
                p.u8(ch.cig).u8(ch.cis);
                #[allow(clippy::cast_possible_truncation)]
                p.u8(self.metadata.len() as u8);
                p.put(&self.metadata);
            }
        }
    }
}

/// Per-peer endpoint session.
#[derive(Debug)]
struct Session {
    peer: Addr,
    attached: bool,
    ases: Vec<Ase>,
}

/// Control point response accumulator.
#[derive(Debug)]
struct CpRsp(StructBuf);

impl CpRsp {
    fn new(op: u8) -> Self {
        let mut v = StructBuf::new(RSP_SIZE);
        v.append().u8(op).u8(0);
        Self(v)
    }

    /// Appends a response entry. `Number_of_ASEs` becomes `0xFF` for the
    /// opcode-wide failure codes and no further entries are recorded.
    fn add(&mut self, id: u8, code: RspCode, reason: Reason) {
        let num = self.0.as_ref()[1];
        if num == 0xFF {
            return;
        }
        debug!("rsp: id {id:#04x} code {code} reason {reason}");
        let num = match code {
            RspCode::NotSupported | RspCode::Truncated => 0xFF,
            _ => num + 1,
        };
        self.0.put_at(1, &[num][..]);
        self.0.append().u8(id).u8(code).u8(reason);
    }

    fn success(&mut self, id: u8) {
        self.add(id, RspCode::Success, Reason::None);
    }

    /// Maps an upper-layer error onto the response code space for `op`.
    fn error(&mut self, id: u8, op: Op, e: StreamError) {
        use StreamError::*;
        let code = match e {
            NoMemory => RspCode::NoMem,
            InvalidArgument => match op {
                Op::Config | Op::Qos => RspCode::ConfInvalid,
                Op::Enable | Op::Metadata => RspCode::MetadataInvalid,
                _ => RspCode::Unspecified,
            },
            NotSupported => match op {
                Op::Config | Op::Qos => RspCode::ConfUnsupported,
                Op::Enable | Op::Metadata => RspCode::MetadataUnsupported,
                _ => RspCode::NotSupported,
            },
            InvalidState => RspCode::InvalidAseState,
            Unspecified => RspCode::Unspecified,
        };
        self.add(id, code, Reason::None);
    }
}

/// Byte cursor over a control point payload.
struct Cur<'a>(&'a [u8]);

impl<'a> Cur<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&v, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let v = self.take(2)?;
        Some(u16::from_le_bytes([v[0], v[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        let v = self.take(3)?;
        Some(u32::from_le_bytes([v[0], v[1], v[2], 0]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        (self.0.len() >= n).then(|| {
            let (v, rest) = self.0.split_at(n);
            self.0 = rest;
            v
        })
    }
}

#[derive(Debug)]
struct Engine {
    dirs: Vec<Dir>,
    sessions: Vec<Session>,
    max_sessions: usize,
    ops: Arc<dyn StreamOps>,
    bonds: Arc<dyn BondStore>,
    /// Key 0 is the control point; keys `1..` are endpoint IDs.
    ntf: Sessions<u8>,
}

impl Engine {
    fn ase_io(&mut self, id: u8, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => {
                let mut buf = StructBuf::new(64 + usize::from(u8::MAX));
                match r.peer().and_then(|peer| self.find(peer, id)) {
                    Some(ase) => ase.status(&mut buf.append()),
                    None => Ase::new(id, Dir::Sink).status(&mut buf.append()),
                }
                r.complete(&buf)
            }
            IoReq::Notify(n) => {
                self.ntf.insert(id, n);
                Ok(())
            }
            IoReq::Write(_) => unreachable!(),
        }
    }

    fn cp_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Write(w) => {
                let Some(peer) = w.peer() else {
                    return Err(ErrorCode::WriteRequestRejected);
                };
                self.cp_write(peer, w.offset(), w.value())
            }
            IoReq::Notify(n) => {
                self.ntf.insert(0, n);
                Ok(())
            }
            IoReq::Read(_) => unreachable!(),
        }
    }

    /// Handles one control point write, responding with a notification that
    /// aggregates the per-endpoint results.
    fn cp_write(&mut self, peer: Addr, off: usize, val: &[u8]) -> IoResult {
        if off != 0 {
            return Err(ErrorCode::InvalidOffset);
        }
        let &[op, ref pdu @ ..] = val else {
            return Err(ErrorCode::InvalidAttributeValueLength);
        };
        debug!("Control point op {op:#04x} from {peer}");
        let mut rsp = CpRsp::new(op);
        let res = match Op::try_from(op) {
            Err(_) => {
                warn!("Unknown opcode {op:#04x}");
                rsp.add(0, RspCode::NotSupported, Reason::None);
                Err(ErrorCode::RequestNotSupported)
            }
            Ok(op) => {
                if self.session(peer).is_none() {
                    rsp.add(0, RspCode::Unspecified, Reason::None);
                    Err(ErrorCode::UnlikelyError)
                } else {
                    let r = self.dispatch(op, peer, &mut Cur(pdu), &mut rsp);
                    if r.is_err() {
                        rsp.add(0, RspCode::Truncated, Reason::None);
                    }
                    r
                }
            }
        };
        self.ntf.notify_peer(0, peer, |p| {
            p.put(&rsp.0);
        });
        res
    }

    fn dispatch(
        &mut self,
        op: Op,
        peer: Addr,
        cur: &mut Cur,
        rsp: &mut CpRsp,
    ) -> std::result::Result<(), ErrorCode> {
        const TRUNC: ErrorCode = ErrorCode::InvalidAttributeValueLength;
        let num = cur.u8().ok_or(TRUNC)?;
        debug!("{op}: num_ases {num}");
        for _ in 0..num {
            match op {
                Op::Config => {
                    let id = cur.u8().ok_or(TRUNC)?;
                    let dir = cur.u8().ok_or(TRUNC)?;
                    let latency = cur.u8().ok_or(TRUNC)?;
                    let phy = cur.u8().ok_or(TRUNC)?;
                    let codec = CodecId {
                        id: cur.u8().ok_or(TRUNC)?,
                        cid: cur.u16().ok_or(TRUNC)?,
                        vid: cur.u16().ok_or(TRUNC)?,
                    };
                    let cc_len = cur.u8().ok_or(TRUNC)?;
                    let cc = cur.take(usize::from(cc_len)).ok_or(TRUNC)?;
                    let cfg = CodecConfig {
                        codec,
                        latency,
                        phy,
                        data: cc.to_vec(),
                    };
                    self.config(peer, id, dir, &cfg, rsp);
                }
                Op::Qos => {
                    let id = cur.u8().ok_or(TRUNC)?;
                    let cig = cur.u8().ok_or(TRUNC)?;
                    let cis = cur.u8().ok_or(TRUNC)?;
                    let qos = QosConfig {
                        interval: cur.u24().ok_or(TRUNC)?,
                        framing: cur.u8().ok_or(TRUNC)?,
                        phy: cur.u8().ok_or(TRUNC)?,
                        sdu: cur.u16().ok_or(TRUNC)?,
                        rtn: cur.u8().ok_or(TRUNC)?,
                        latency: cur.u16().ok_or(TRUNC)?,
                        pd: cur.u24().ok_or(TRUNC)?,
                    };
                    self.qos(peer, id, ChannelId { cig, cis }, &qos, rsp);
                }
                Op::Enable | Op::Metadata => {
                    let id = cur.u8().ok_or(TRUNC)?;
                    let len = cur.u8().ok_or(TRUNC)?;
                    let meta = cur.take(usize::from(len)).ok_or(TRUNC)?.to_vec();
                    self.with_meta(op, peer, id, &meta, rsp);
                }
                Op::Start | Op::Disable | Op::Stop | Op::Release => {
                    let id = cur.u8().ok_or(TRUNC)?;
                    self.simple(op, peer, id, rsp);
                }
            }
        }
        Ok(())
    }

    fn config(&mut self, peer: Addr, id: u8, dir: u8, cfg: &CodecConfig, rsp: &mut CpRsp) {
        if !(0x01..=0x03).contains(&cfg.latency) {
            warn!("Invalid latency {:#04x}", cfg.latency);
            rsp.add(id, RspCode::ConfInvalid, Reason::Latency);
            return;
        }
        if !(0x01..=0x03).contains(&cfg.phy) {
            warn!("Invalid PHY {:#04x}", cfg.phy);
            rsp.add(id, RspCode::ConfInvalid, Reason::Phy);
            return;
        }
        let ops = Arc::clone(&self.ops);
        let Some(ase) = self.find_or_alloc(peer, id) else {
            warn!("Unable to get ASE {id:#04x}");
            rsp.add(id, RspCode::InvalidAse, Reason::None);
            return;
        };
        let id = ase.id;
        if Dir::try_from(dir).map_or(true, |d| d != ase.dir) {
            rsp.add(id, RspCode::ConfRejected, Reason::Direction);
            return;
        }
        match ase.state {
            AseState::Idle | AseState::Config | AseState::QoS => {}
            s => {
                warn!("Invalid state: {s}");
                rsp.add(id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        }
        if let Err(e) = ops.config(peer, id, cfg) {
            rsp.error(id, Op::Config, e);
            return;
        }
        ase.codec = Some(cfg.clone());
        self.set_state(peer, id, AseState::Config);
        rsp.success(id);
    }

    fn qos(&mut self, peer: Addr, id: u8, ch: ChannelId, qos: &QosConfig, rsp: &mut CpRsp) {
        let ops = Arc::clone(&self.ops);
        let Some(ase) = self.find(peer, id) else {
            warn!("Unable to find ASE {id:#04x}");
            rsp.add(id, RspCode::InvalidAse, Reason::None);
            return;
        };
        match ase.state {
            AseState::Config | AseState::QoS => {}
            s => {
                warn!("Invalid state: {s}");
                rsp.add(id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        }
        let reason = if qos.interval == 0 {
            Some(Reason::Interval)
        } else if qos.framing > 0x01 {
            Some(Reason::Framing)
        } else if !(0x01..=0x03).contains(&qos.phy) {
            Some(Reason::Phy)
        } else if qos.sdu == 0xFFFF {
            Some(Reason::Sdu)
        } else if qos.latency == 0 {
            Some(Reason::Latency)
        } else if qos.pd == 0 {
            Some(Reason::Pd)
        } else {
            None
        };
        if let Some(reason) = reason {
            rsp.add(id, RspCode::ConfInvalid, reason);
            return;
        }
        if let Err(e) = ops.qos(peer, id, qos) {
            rsp.error(id, Op::Qos, e);
            return;
        }
        ase.qos = Some(*qos);
        ase.channel = Some(ch);
        self.set_state(peer, id, AseState::QoS);
        rsp.success(id);
    }

    fn with_meta(&mut self, op: Op, peer: Addr, id: u8, meta: &[u8], rsp: &mut CpRsp) {
        let ops = Arc::clone(&self.ops);
        let Some(ase) = self.find(peer, id) else {
            warn!("Unable to find ASE {id:#04x}");
            rsp.add(id, RspCode::InvalidAse, Reason::None);
            return;
        };
        let ok = matches!(
            (op, ase.state),
            (Op::Enable, AseState::QoS) | (Op::Metadata, AseState::Enabling | AseState::Streaming)
        );
        if !ok {
            warn!("Invalid state: {}", ase.state);
            rsp.add(id, RspCode::InvalidAseState, Reason::None);
            return;
        }
        let r = match op {
            Op::Enable => ops.enable(peer, id, meta),
            _ => ops.metadata(peer, id, meta),
        };
        if let Err(e) = r {
            rsp.error(id, op, e);
            return;
        }
        ase.metadata = meta.to_vec();
        if op == Op::Enable {
            self.set_state(peer, id, AseState::Enabling);
        }
        rsp.success(id);
    }

    fn simple(&mut self, op: Op, peer: Addr, id: u8, rsp: &mut CpRsp) {
        let ops = Arc::clone(&self.ops);
        let Some(ase) = self.find(peer, id) else {
            warn!("Unable to find ASE {id:#04x}");
            rsp.add(id, RspCode::InvalidAse, Reason::None);
            return;
        };
        let next = match (op, ase.state) {
            (Op::Start, AseState::Enabling) => AseState::Streaming,
            (Op::Disable, AseState::Enabling | AseState::Streaming) => AseState::Disabling,
            (Op::Stop, AseState::Disabling) => AseState::QoS,
            (Op::Release, s) if !matches!(s, AseState::Idle | AseState::Releasing) => {
                AseState::Releasing
            }
            (_, s) => {
                warn!("Invalid state: {s}");
                rsp.add(id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        };
        let r = match op {
            Op::Start => ops.start(peer, id),
            Op::Disable => ops.disable(peer, id),
            Op::Stop => ops.stop(peer, id),
            Op::Release => ops.release(peer, id, false),
            _ => unreachable!(),
        };
        if let Err(e) = r {
            rsp.error(id, op, e);
            return;
        }
        self.set_state(peer, id, next);
        if next == AseState::Releasing {
            // The transport binding is gone, so the endpoint completes the
            // transition to Idle and notifies again
            if let Some(ase) = self.find(peer, id) {
                ase.reset();
            }
            self.set_state(peer, id, AseState::Idle);
        }
        rsp.success(id);
    }

    /// Commits a state transition and notifies the owning peer.
    fn set_state(&mut self, peer: Addr, id: u8, state: AseState) {
        let Some(s) = self.sessions.iter_mut().find(|s| s.peer == peer) else {
            return;
        };
        let Some(ase) = usize::from(id).checked_sub(1).and_then(|i| s.ases.get_mut(i)) else {
            return;
        };
        debug!("ASE {id:#04x}: {} -> {state}", ase.state);
        ase.state = state;
        let ase = &*ase;
        self.ntf.notify_peer(id, peer, |p| ase.status(p));
    }

    /// Finds or creates the session for a peer.
    fn session(&mut self, peer: Addr) -> Option<&mut Session> {
        if let Some(i) = self.sessions.iter().position(|s| s.peer == peer) {
            let s = &mut self.sessions[i];
            s.attached = true;
            return Some(s);
        }
        if self.sessions.len() >= self.max_sessions {
            // Reclaim a detached session before giving up
            let i = self.sessions.iter().position(|s| !s.attached)?;
            self.sessions.swap_remove(i);
        }
        let ases = (self.dirs.iter().enumerate())
            .map(|(i, &dir)| {
                #[allow(clippy::cast_possible_truncation)]
                let id = i as u8 + 1;
                Ase::new(id, dir)
            })
            .collect();
        self.sessions.push(Session {
            peer,
            attached: true,
            ases,
        });
        self.sessions.last_mut()
    }

    fn find(&mut self, peer: Addr, id: u8) -> Option<&mut Ase> {
        let s = self.sessions.iter_mut().find(|s| s.peer == peer)?;
        s.ases.get_mut(usize::from(id).checked_sub(1)?)
    }

    /// Finds an endpoint, allocating the first idle one when `id` is zero.
    fn find_or_alloc(&mut self, peer: Addr, id: u8) -> Option<&mut Ase> {
        if id != 0 {
            return self.find(peer, id);
        }
        let s = self.sessions.iter_mut().find(|s| s.peer == peer)?;
        s.ases.iter_mut().find(|a| a.state == AseState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use crate::att::{Handle, HandleRange, Opcode};
    use crate::gatt::{IoMap, NotifyReq, NotifyVal, ReadReq, WriteReq};
    use crate::sec::MemoryBonds;

    use super::*;

    type Rx = tokio::sync::mpsc::Receiver<NotifyVal>;

    struct Fix {
        svc: AudioStreamService,
        io: IoMap,
        ases: Vec<Handle>,
        cp: Handle,
        bonds: Arc<MemoryBonds>,
        _cts: Vec<CancellationToken>,
    }

    fn peer(n: u8) -> Addr {
        Addr::peer(0, [n, 0, 0, 0, 0, 0].into())
    }

    fn fix() -> (Fix, Rx, Vec<Rx>) {
        let bonds = Arc::new(MemoryBonds::new());
        let store: Arc<dyn BondStore> = bonds.clone();
        let svc =
            AudioStreamService::new(&AudioStreamConfig::default(), Arc::new(NullOps), store)
                .unwrap();
        let mut db = Db::build();
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let mut hdls: Vec<_> = (db.characteristics(HandleRange::ALL))
            .map(|c| c.value_handle())
            .collect();
        let cp = hdls.pop().unwrap();
        let mut cts = Vec::new();
        let (req, cp_rx, ct) = NotifyReq::new(cp, Characteristic::AseControlPoint.uuid(), peer(1), 247);
        io.notify(req).unwrap();
        cts.push(ct);
        let mut ase_rx = Vec::new();
        for &h in &hdls {
            let (req, rx, ct) = NotifyReq::new(h, Characteristic::SinkAse.uuid(), peer(1), 247);
            io.notify(req).unwrap();
            cts.push(ct);
            ase_rx.push(rx);
        }
        (
            Fix {
                svc,
                io,
                ases: hdls,
                cp,
                bonds,
                _cts: cts,
            },
            cp_rx,
            ase_rx,
        )
    }

    fn write(f: &Fix, peer: Addr, val: &[u8]) -> IoResult {
        let req = WriteReq::new(
            Opcode::WriteReq,
            f.cp,
            Characteristic::AseControlPoint.uuid(),
            Some(peer),
            0,
            val,
        );
        f.io.write(&req)
    }

    fn read_ase(f: &Fix, peer: Addr, i: usize) -> Vec<u8> {
        let mut req = ReadReq::new(Opcode::ReadReq, 247);
        req.with(f.ases[i], Characteristic::SinkAse.uuid(), Some(peer), 0);
        f.io.read(&mut req).unwrap();
        req.into_value().as_ref().to_vec()
    }

    fn last(rx: &mut Rx) -> Option<Vec<u8>> {
        let mut v = None;
        while let Ok(n) = rx.try_recv() {
            v = Some(n.as_ref().to_vec());
        }
        v
    }

    fn config_entry(id: u8, dir: u8) -> Vec<u8> {
        vec![id, dir, 0x02, 0x02, 0x06, 0, 0, 0, 0, 0]
    }

    fn qos_entry(id: u8) -> Vec<u8> {
        let mut v = vec![id, 1, 1];
        v.extend_from_slice(&10_000_u32.to_le_bytes()[..3]);
        v.extend_from_slice(&[0x00, 0x02]); // Framing, PHY
        v.extend_from_slice(&100_u16.to_le_bytes());
        v.push(2); // RTN
        v.extend_from_slice(&10_u16.to_le_bytes());
        v.extend_from_slice(&40_000_u32.to_le_bytes()[..3]);
        v
    }

    fn op_write(f: &Fix, op: Op, entries: &[Vec<u8>]) -> IoResult {
        let mut v = vec![op.into(), entries.len() as u8];
        for e in entries {
            v.extend_from_slice(e);
        }
        write(f, peer(1), &v)
    }

    #[test]
    fn full_lifecycle() {
        let (f, mut cp_rx, mut ase_rx) = fix();
        let a = peer(1);

        op_write(&f, Op::Config, &[config_entry(1, 0x01)]).unwrap();
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::Config));
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x01, 1, 1, 0x00, 0x00]);
        let status = last(&mut ase_rx[0]).unwrap();
        assert_eq!(&status[..2], &[1, 0x01]);

        op_write(&f, Op::Qos, &[qos_entry(1)]).unwrap();
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::QoS));
        let status = last(&mut ase_rx[0]).unwrap();
        assert_eq!(&status[..4], &[1, 0x02, 1, 1]);

        op_write(&f, Op::Enable, &[vec![1, 2, 0xAA, 0xBB]]).unwrap();
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::Enabling));
        let status = last(&mut ase_rx[0]).unwrap();
        assert_eq!(status, vec![1, 0x03, 1, 1, 2, 0xAA, 0xBB]);

        op_write(&f, Op::Start, &[vec![1]]).unwrap();
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::Streaming));

        op_write(&f, Op::Disable, &[vec![1]]).unwrap();
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::Disabling));

        op_write(&f, Op::Stop, &[vec![1]]).unwrap();
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::QoS));

        op_write(&f, Op::Release, &[vec![1]]).unwrap();
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::Idle));
        // Releasing is observed, then the endpoint settles in Idle
        assert_eq!(last(&mut ase_rx[0]).unwrap(), vec![1, 0x00]);
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x08, 1, 1, 0x00, 0x00]);
    }

    #[test]
    fn config_validation() {
        let (f, mut cp_rx, _) = fix();

        // Latency out of range
        let mut e = config_entry(1, 0x01);
        e[2] = 0x04;
        op_write(&f, Op::Config, &[e]).unwrap();
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x01, 1, 1, 0x08, 0x0A]);

        // PHY out of range
        let mut e = config_entry(1, 0x01);
        e[3] = 0x00;
        op_write(&f, Op::Config, &[e]).unwrap();
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x01, 1, 1, 0x08, 0x07]);

        // Direction mismatch: endpoint 1 is a sink
        op_write(&f, Op::Config, &[config_entry(1, 0x02)]).unwrap();
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x01, 1, 1, 0x07, 0x01]);

        // Unknown endpoint
        op_write(&f, Op::Config, &[config_entry(9, 0x01)]).unwrap();
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x01, 1, 9, 0x03, 0x00]);
    }

    #[test]
    fn zero_id_allocates_idle_endpoint() {
        let (f, mut cp_rx, _) = fix();
        op_write(&f, Op::Config, &[config_entry(0, 0x01)]).unwrap();
        // Endpoint 1 is the first idle sink
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x01, 1, 1, 0x00, 0x00]);
        assert_eq!(f.svc.ase_state(peer(1), 1), Some(AseState::Config));
    }

    #[test]
    fn invalid_state_rejected() {
        let (f, mut cp_rx, _) = fix();
        op_write(&f, Op::Enable, &[vec![1, 0]]).unwrap();
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x03, 1, 1, 0x04, 0x00]);
        op_write(&f, Op::Start, &[vec![1]]).unwrap();
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x04, 1, 1, 0x04, 0x00]);
        op_write(&f, Op::Release, &[vec![1]]).unwrap();
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x08, 1, 1, 0x04, 0x00]);
    }

    #[test]
    fn unknown_opcode() {
        let (f, mut cp_rx, _) = fix();
        assert_eq!(
            write(&f, peer(1), &[0xFF, 1, 1]),
            Err(ErrorCode::RequestNotSupported)
        );
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0xFF, 0xFF, 0, 0x01, 0x00]);
    }

    #[test]
    fn truncated_request() {
        let (f, mut cp_rx, _) = fix();
        assert_eq!(
            op_write(&f, Op::Config, &[config_entry(1, 0x01)[..4].to_vec()]),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(last(&mut cp_rx).unwrap(), vec![0x01, 0xFF, 0, 0x02, 0x00]);

        assert_eq!(
            write(&f, peer(1), &[]),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
    }

    #[test]
    fn multi_ase_response() {
        let (f, mut cp_rx, _) = fix();
        op_write(
            &f,
            Op::Config,
            &[config_entry(1, 0x01), config_entry(2, 0x02)],
        )
        .unwrap();
        assert_eq!(
            last(&mut cp_rx).unwrap(),
            vec![0x01, 2, 1, 0x00, 0x00, 2, 0x00, 0x00]
        );
    }

    #[test]
    fn read_reports_status() {
        let (f, _, _) = fix();
        let a = peer(1);
        assert_eq!(read_ase(&f, a, 0), vec![1, 0x00]);
        op_write(&f, Op::Config, &[config_entry(1, 0x01)]).unwrap();
        let v = read_ase(&f, a, 0);
        // id, state, dir, framing, phy, rtn, latency16, pd_min24, pd_max24,
        // codec id, cid16, vid16, cc_len
        assert_eq!(&v[..5], &[1, 0x01, 0x01, 0, 0x02]);
        assert_eq!(v.len(), 2 + 12 + 5 + 1);
    }

    #[test]
    fn non_bonded_disconnect_clears() {
        let (f, _, _) = fix();
        let a = peer(1);
        op_write(&f, Op::Config, &[config_entry(1, 0x01)]).unwrap();
        f.svc.disconnected(a);
        // The session is gone entirely
        assert_eq!(f.svc.ase_state(a, 1), None);
    }

    #[test]
    fn bonded_disconnect_detaches() {
        let (f, _, _) = fix();
        let a = peer(1);
        f.bonds.insert(a);
        op_write(&f, Op::Config, &[config_entry(1, 0x01)]).unwrap();
        op_write(&f, Op::Qos, &[qos_entry(1)]).unwrap();
        f.svc.disconnected(a);
        // Codec configuration is cached, transport binding is cleared
        assert_eq!(f.svc.ase_state(a, 1), Some(AseState::Config));
    }

    #[test]
    fn detached_session_reclaimed() {
        let (f, _, _) = fix();
        f.bonds.insert(peer(1));
        op_write(&f, Op::Config, &[config_entry(1, 0x01)]).unwrap();
        f.svc.disconnected(peer(1));

        // Two new peers exhaust the session table; the detached session goes
        write(&f, peer(2), &[0x01, 0]).unwrap();
        write(&f, peer(3), &[0x01, 0]).unwrap();
        assert_eq!(f.svc.ase_state(peer(1), 1), None);
        assert_eq!(f.svc.ase_state(peer(3), 1), Some(AseState::Idle));
    }
}
