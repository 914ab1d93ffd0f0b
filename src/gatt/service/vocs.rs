//! Volume Offset Control Service (\[VOCS\]).
//!
//! A secondary service describing one audio output's volume offset. Instances
//! are owned and included by a primary service such as
//! [`vcs::VolumeControlService`](super::vcs::VolumeControlService).

use std::sync::Arc;

use structbuf::Packer;
use tokio::sync::watch;
use tracing::debug;

use murmur_const::{Characteristic, Service};

use crate::att::{Access, ErrorCode, Handle};
use crate::gatt::{Builder, Db, Io, IoReq, IoResult, Prop, ReadReq};
use crate::le::Addr;
use crate::{Error, Result, SyncMutex};

use super::{control_req, desc_eq, desc_store, Sessions};

pub use client::VolumeOffsetClient;

pub mod client;

/// Maximum stored description length in bytes. Longer writes are clipped.
pub const MAX_DESC_LEN: usize = 32;

/// Volume offset limits.
pub const MIN_OFFSET: i16 = -255;
pub const MAX_OFFSET: i16 = 255;

/// Control point opcodes (\[VOCS\] Section 3.1.1).
pub(crate) const OP_SET_OFFSET: u8 = 0x01;

/// Service error codes sent over ATT (\[VOCS\] Section 1.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum OffsetError {
    InvalidCounter = 0x80,
    OpcodeNotSupported = 0x81,
    OutOfRange = 0x82,
}

impl From<OffsetError> for ErrorCode {
    #[inline(always)]
    fn from(e: OffsetError) -> Self {
        Self::Application(e.into())
    }
}

crate::impl_display_via_debug! { OffsetError }

/// Volume Offset State characteristic value (\[VOCS\] Section 2.2.1).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OffsetState {
    pub offset: i16,
    pub counter: u8,
}

impl OffsetState {
    /// Value length on the wire.
    pub(crate) const LEN: usize = 3;

    pub(crate) fn pack(self, p: &mut Packer) {
        p.put(self.offset.to_le_bytes());
        p.u8(self.counter);
    }

    pub(crate) fn unpack(v: &[u8]) -> Option<Self> {
        (v.len() == Self::LEN).then(|| Self {
            offset: i16::from_le_bytes([v[0], v[1]]),
            counter: v[2],
        })
    }
}

/// Instance configuration.
#[derive(Clone, Debug, Default)]
pub struct VolumeOffsetConfig {
    /// Initial offset in [`MIN_OFFSET`]`..=`[`MAX_OFFSET`].
    pub offset: i16,
    /// Audio location bitmask.
    pub location: u8,
    /// Output description. Clipped to [`MAX_DESC_LEN`] bytes.
    pub description: String,
    /// Allow clients to rewrite the audio location.
    pub location_writable: bool,
    /// Allow clients to rewrite the output description.
    pub description_writable: bool,
}

/// Characteristic selector for notification sessions.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Chr {
    State,
    Location,
    Desc,
}

/// Volume Offset Control service instance.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct VolumeOffsetService(Arc<SyncMutex<Inst>>);

impl VolumeOffsetService {
    /// Creates a new instance.
    pub fn new(c: &VolumeOffsetConfig) -> Result<Self> {
        if !(MIN_OFFSET..=MAX_OFFSET).contains(&c.offset) {
            return Err(Error::InvalidArgument);
        }
        Ok(Self(Inst::new(c)))
    }

    /// Defines the service structure and returns the service declaration
    /// handle for use in an include declaration.
    pub fn define(&self, db: &mut Builder<Db>) -> Handle {
        const RO: Access = Access::READ.encrypt();
        const WO: Access = Access::WRITE.encrypt();
        let ccc = Access::READ | WO;
        let (loc_writable, desc_writable) = {
            let inst = self.0.lock();
            (inst.location_writable, inst.desc_writable)
        };
        let writable = |on| {
            if on {
                (Prop::READ | Prop::NOTIFY | Prop::WRITE_CMD, RO | WO)
            } else {
                (Prop::READ | Prop::NOTIFY, RO.into())
            }
        };
        db.secondary_service(Service::VolumeOffsetControl, [], |db| {
            use Characteristic::*;
            db.characteristic(
                VolumeOffsetState,
                Prop::READ | Prop::NOTIFY,
                RO,
                Io::with(&self.0, |t, req| t.lock().state_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
            let (props, perms) = writable(loc_writable);
            db.characteristic(
                AudioLocation,
                props,
                perms,
                Io::with(&self.0, |t, req| t.lock().location_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
            db.characteristic(
                VolumeOffsetControlPoint,
                Prop::WRITE,
                WO,
                Io::with(&self.0, |t, req| t.lock().control_io(req)),
                |_| {},
            );
            let (props, perms) = writable(desc_writable);
            db.characteristic(
                AudioOutputDescription,
                props,
                perms,
                Io::with(&self.0, |t, req| t.lock().desc_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
        })
        .0
    }

    /// Returns a watch receiver reflecting offset state changes.
    #[inline]
    #[must_use]
    pub fn offset_state(&self) -> watch::Receiver<OffsetState> {
        self.0.lock().state_w.subscribe()
    }

    /// Returns a watch receiver reflecting audio location changes.
    #[inline]
    #[must_use]
    pub fn location(&self) -> watch::Receiver<u8> {
        self.0.lock().location_w.subscribe()
    }

    /// Returns a watch receiver reflecting output description changes.
    #[inline]
    #[must_use]
    pub fn description(&self) -> watch::Receiver<String> {
        self.0.lock().desc_w.subscribe()
    }

    /// Sets the volume offset through the same validation and commit path as
    /// a client control-point write.
    pub fn set_offset(&self, offset: i16) -> Result<()> {
        let mut inst = self.0.lock();
        let mut val = [0; 4];
        val[0] = OP_SET_OFFSET;
        val[1] = inst.state.counter;
        val[2..].copy_from_slice(&offset.to_le_bytes());
        inst.write_control(None, 0, &val).map_err(|e| match e {
            ErrorCode::Application(v) if v == OffsetError::OutOfRange as u8 => {
                Error::InvalidArgument
            }
            e => Error::Att(e),
        })
    }

    /// Sets the audio location.
    pub fn set_location(&self, location: u8) -> Result<()> {
        (self.0.lock().write_location(None, &[location])).map_err(Error::Att)
    }

    /// Sets the output description, clipping it to [`MAX_DESC_LEN`] bytes.
    pub fn set_description(&self, desc: &str) -> Result<()> {
        (self.0.lock().write_desc(None, desc.as_bytes())).map_err(Error::Att)
    }
}

#[derive(Debug)]
struct Inst {
    state: OffsetState,
    location: u8,
    desc: String,
    location_writable: bool,
    desc_writable: bool,
    ntf: Sessions<Chr>,
    state_w: watch::Sender<OffsetState>,
    location_w: watch::Sender<u8>,
    desc_w: watch::Sender<String>,
}

impl Inst {
    fn new(c: &VolumeOffsetConfig) -> Arc<SyncMutex<Self>> {
        let state = OffsetState {
            offset: c.offset,
            counter: 0,
        };
        let desc = desc_store(c.description.as_bytes(), MAX_DESC_LEN);
        let (state_w, _) = watch::channel(state);
        let (location_w, _) = watch::channel(c.location);
        let (desc_w, _) = watch::channel(desc.clone());
        Arc::new(SyncMutex::new(Self {
            state,
            location: c.location,
            desc,
            location_writable: c.location_writable,
            desc_writable: c.description_writable,
            ntf: Sessions::new(),
            state_w,
            location_w,
            desc_w,
        }))
    }

    fn state_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => self.read_state(r),
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::State, n);
                Ok(())
            }
            IoReq::Write(_) => unreachable!(),
        }
    }

    fn location_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => {
                debug!("Location {:#04x}", self.location);
                r.complete([self.location])
            }
            IoReq::Write(w) => self.write_location(w.peer(), w.value()),
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::Location, n);
                Ok(())
            }
        }
    }

    fn control_io(&mut self, req: IoReq) -> IoResult {
        let IoReq::Write(w) = req else { unreachable!() };
        self.write_control(w.peer(), w.offset(), w.value())
    }

    fn desc_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => {
                debug!("Description {:?}", self.desc);
                r.complete(self.desc.as_bytes())
            }
            IoReq::Write(w) => self.write_desc(w.peer(), w.value()),
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::Desc, n);
                Ok(())
            }
        }
    }

    fn read_state(&mut self, r: &mut ReadReq) -> IoResult {
        debug!(
            "Offset {}, counter {}",
            self.state.offset, self.state.counter
        );
        let mut v = [0; OffsetState::LEN];
        v[..2].copy_from_slice(&self.state.offset.to_le_bytes());
        v[2] = self.state.counter;
        r.complete(v)
    }

    fn write_location(&mut self, peer: Option<Addr>, val: &[u8]) -> IoResult {
        if peer.is_some() && !self.location_writable {
            return Err(ErrorCode::WriteNotPermitted);
        }
        let &[location] = val else {
            return Err(ErrorCode::InvalidAttributeValueLength);
        };
        if location != self.location {
            self.location = location;
            debug!("Location {location:#04x}");
            self.ntf.notify(Chr::Location, None, |p| {
                p.u8(location);
            });
            self.location_w.send_replace(location);
        }
        Ok(())
    }

    /// Control-point handler shared by client writes and the local API.
    fn write_control(&mut self, _peer: Option<Addr>, att_off: usize, val: &[u8]) -> IoResult {
        let req = control_req(
            att_off,
            val,
            |op| (op == OP_SET_OFFSET).then_some(2),
            OffsetError::OpcodeNotSupported.into(),
        )?;
        debug!("Opcode {}, counter {}", req.opcode, req.counter);
        if req.counter != self.state.counter {
            return Err(OffsetError::InvalidCounter.into());
        }
        let offset = i16::from_le_bytes([req.operand[0], req.operand[1]]);
        if !(MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
            return Err(OffsetError::OutOfRange.into());
        }
        if self.state.offset != offset {
            self.state.offset = offset;
            self.state.counter = self.state.counter.wrapping_add(1);
            debug!(
                "New state: offset {}, counter {}",
                self.state.offset, self.state.counter
            );
            let state = self.state;
            self.ntf.notify(Chr::State, None, |p| state.pack(p));
            self.state_w.send_replace(state);
        }
        Ok(())
    }

    fn write_desc(&mut self, peer: Option<Addr>, val: &[u8]) -> IoResult {
        if peer.is_some() && !self.desc_writable {
            return Err(ErrorCode::WriteNotPermitted);
        }
        let raw = &val[..val.len().min(MAX_DESC_LEN)];
        if raw.len() < val.len() {
            debug!("Description clipped from {} to {} bytes", val.len(), raw.len());
        }
        // Writes matching the stored length and bytes are skipped; a write
        // that differs only by trailing NULs still renotifies
        if raw.len() != self.desc.len() || !desc_eq(&self.desc, raw) {
            self.desc = desc_store(raw, MAX_DESC_LEN);
            debug!("Description {:?}", self.desc);
            let desc = self.desc.clone();
            self.ntf.notify(Chr::Desc, None, |p| {
                p.put(desc.as_bytes());
            });
            self.desc_w.send_replace(desc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::att::Opcode;
    use crate::gatt::{IoMap, WriteReq};

    use super::*;

    fn inst() -> (VolumeOffsetService, IoMap, [Handle; 4]) {
        let svc = VolumeOffsetService::new(&VolumeOffsetConfig {
            offset: -10,
            location: 0x01,
            description: "Left".into(),
            location_writable: true,
            description_writable: true,
        })
        .unwrap();
        let mut db = Db::build();
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let svc_range = crate::att::HandleRange::ALL;
        let mut hdls = [Handle::new(1).unwrap(); 4];
        for (i, c) in db.characteristics(svc_range).enumerate() {
            hdls[i] = c.value_handle();
        }
        (svc, io, hdls)
    }

    fn write(io: &IoMap, hdl: Handle, peer: Option<Addr>, val: &[u8]) -> IoResult {
        let req = WriteReq::new(
            Opcode::WriteReq,
            hdl,
            Characteristic::VolumeOffsetControlPoint.uuid(),
            peer,
            0,
            val,
        );
        io.write(&req)
    }

    fn read(io: &IoMap, hdl: Handle) -> Vec<u8> {
        let mut req = ReadReq::new(Opcode::ReadReq, 247);
        req.with(hdl, Characteristic::VolumeOffsetState.uuid(), None, 0);
        io.read(&mut req).unwrap();
        req.into_value().as_ref().to_vec()
    }

    #[test]
    fn set_offset() {
        let (svc, io, [state, _, control, _]) = inst();
        assert_eq!(read(&io, state), vec![0xF6, 0xFF, 0]);

        // Valid write commits and bumps the counter
        write(&io, control, None, &[OP_SET_OFFSET, 0, 0x10, 0x00]).unwrap();
        assert_eq!(read(&io, state), vec![0x10, 0, 1]);
        assert_eq!(svc.offset_state().borrow().offset, 0x10);

        // Stale counter
        assert_eq!(
            write(&io, control, None, &[OP_SET_OFFSET, 0, 0x20, 0x00]),
            Err(OffsetError::InvalidCounter.into())
        );

        // +256 is out of range
        assert_eq!(
            write(&io, control, None, &[OP_SET_OFFSET, 1, 0x00, 0x01]),
            Err(OffsetError::OutOfRange.into())
        );
        assert_eq!(read(&io, state), vec![0x10, 0, 1]);

        // Identical value commits nothing
        write(&io, control, None, &[OP_SET_OFFSET, 1, 0x10, 0x00]).unwrap();
        assert_eq!(read(&io, state), vec![0x10, 0, 1]);
    }

    #[test]
    fn control_guards() {
        let (_svc, io, [_, _, control, _]) = inst();
        assert_eq!(
            write(&io, control, None, &[0x02, 0, 0, 0]),
            Err(OffsetError::OpcodeNotSupported.into())
        );
        assert_eq!(
            write(&io, control, None, &[OP_SET_OFFSET, 0, 0]),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(
            write(&io, control, None, &[]),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
    }

    #[test]
    fn description_clips() {
        let (svc, io, [_, _, _, desc]) = inst();
        let long = [b'x'; MAX_DESC_LEN + 9];
        write(&io, desc, None, &long).unwrap();
        assert_eq!(svc.description().borrow().len(), MAX_DESC_LEN);

        svc.set_description("Back Left").unwrap();
        assert_eq!(&*svc.description().borrow(), "Back Left");
    }

    #[test]
    fn location_writable_gate() {
        let svc = VolumeOffsetService::new(&VolumeOffsetConfig::default()).unwrap();
        let mut db = Db::build();
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let loc = (db.characteristics(crate::att::HandleRange::ALL).nth(1))
            .unwrap()
            .value_handle();
        let peer = Addr::peer(0, [1, 2, 3, 4, 5, 6].into());
        assert_eq!(
            write(&io, loc, Some(peer), &[0x04]),
            Err(ErrorCode::WriteNotPermitted)
        );
        // The local path is always allowed
        svc.set_location(0x04).unwrap();
        assert_eq!(*svc.location().borrow(), 0x04);
    }
}
