//! Volume Control Service (\[VCS\]).
//!
//! The primary rendering-control service. It owns its included
//! [`VolumeOffsetService`] and [`AudioInputService`] instances and declares
//! one include per instance ahead of its own characteristics.

use std::sync::Arc;

use structbuf::Packer;
use tokio::sync::watch;
use tracing::debug;

use murmur_const::{Characteristic, Service};

use crate::att::{Access, ErrorCode, Handle};
use crate::gatt::{Builder, Db, Io, IoReq, IoResult, Prop};
use crate::le::Addr;
use crate::{Error, Result, SyncMutex};

use super::aics::{AudioInputConfig, AudioInputService};
use super::vocs::{VolumeOffsetConfig, VolumeOffsetService};
use super::{control_req, Sessions};

pub use client::VolumeControlClient;

pub mod client;

/// Control point opcodes (\[VCS\] Section 3.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub(crate) enum Op {
    RelVolDown = 0x00,
    RelVolUp = 0x01,
    UnmuteRelVolDown = 0x02,
    UnmuteRelVolUp = 0x03,
    SetAbsVol = 0x04,
    Unmute = 0x05,
    Mute = 0x06,
}

/// Service error codes sent over ATT (\[VCS\] Section 1.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum VolumeError {
    InvalidCounter = 0x80,
    OpcodeNotSupported = 0x81,
}

impl From<VolumeError> for ErrorCode {
    #[inline(always)]
    fn from(e: VolumeError) -> Self {
        Self::Application(e.into())
    }
}

crate::impl_display_via_debug! { VolumeError }

/// Volume Flags bit 0: the volume setting has been changed since boot.
pub const FLAG_VOLUME_CHANGED: u8 = 1 << 0;

/// Volume State characteristic value (\[VCS\] Section 2.2.1).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VolumeState {
    pub volume: u8,
    pub muted: bool,
    pub counter: u8,
}

impl VolumeState {
    /// Value length on the wire.
    pub(crate) const LEN: usize = 3;

    pub(crate) fn pack(self, p: &mut Packer) {
        p.u8(self.volume).u8(u8::from(self.muted)).u8(self.counter);
    }

    pub(crate) fn unpack(v: &[u8]) -> Option<Self> {
        (v.len() == Self::LEN).then(|| Self {
            volume: v[0],
            muted: v[1] != 0,
            counter: v[2],
        })
    }
}

/// Service configuration.
#[derive(Clone, Debug)]
pub struct VolumeControlConfig {
    /// Initial volume setting.
    pub volume: u8,
    /// Initial mute state.
    pub muted: bool,
    /// Relative volume step, greater than zero.
    pub step: u8,
    /// Included volume offset instances.
    pub offsets: Vec<VolumeOffsetConfig>,
    /// Included audio input instances.
    pub inputs: Vec<AudioInputConfig>,
}

impl Default for VolumeControlConfig {
    fn default() -> Self {
        Self {
            volume: 100,
            muted: false,
            step: 1,
            offsets: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

/// Characteristic selector for notification sessions.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Chr {
    State,
    Flags,
}

/// Volume Control service.
#[derive(Clone, Debug)]
pub struct VolumeControlService {
    inner: Arc<SyncMutex<Inst>>,
    vocs: Vec<VolumeOffsetService>,
    aics: Vec<AudioInputService>,
}

impl VolumeControlService {
    /// Creates the service and its included instances.
    pub fn new(c: &VolumeControlConfig) -> Result<Self> {
        if c.step == 0 {
            return Err(Error::InvalidArgument);
        }
        let vocs = (c.offsets.iter()).map(VolumeOffsetService::new).collect::<Result<_>>()?;
        let aics = (c.inputs.iter()).map(AudioInputService::new).collect::<Result<_>>()?;
        Ok(Self {
            inner: Inst::new(c),
            vocs,
            aics,
        })
    }

    /// Defines the included services followed by the service structure.
    pub fn define(&self, db: &mut Builder<Db>) {
        const RO: Access = Access::READ.encrypt();
        const WO: Access = Access::WRITE.encrypt();
        let ccc = Access::READ | WO;
        let mut inc = Vec::with_capacity(self.vocs.len() + self.aics.len());
        inc.extend(self.vocs.iter().map(|s| s.define(db)));
        inc.extend(self.aics.iter().map(|s| s.define(db)));
        db.primary_service(Service::VolumeControl, inc, |db| {
            db.characteristic(
                Characteristic::VolumeState,
                Prop::READ | Prop::NOTIFY,
                RO,
                Io::with(&self.inner, |t, req| t.lock().state_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
            db.characteristic(
                Characteristic::VolumeControlPoint,
                Prop::WRITE,
                WO,
                Io::with(&self.inner, |t, req| t.lock().control_io(req)),
                |_| {},
            );
            db.characteristic(
                Characteristic::VolumeFlags,
                Prop::READ | Prop::NOTIFY,
                RO,
                Io::with(&self.inner, |t, req| t.lock().flags_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
        });
    }

    /// Returns a watch receiver reflecting volume state changes.
    #[inline]
    #[must_use]
    pub fn volume_state(&self) -> watch::Receiver<VolumeState> {
        self.inner.lock().state_w.subscribe()
    }

    /// Returns a watch receiver reflecting volume flag changes.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> watch::Receiver<u8> {
        self.inner.lock().flags_w.subscribe()
    }

    /// Returns the included volume offset instances.
    #[inline]
    #[must_use]
    pub fn offsets(&self) -> &[VolumeOffsetService] {
        &self.vocs
    }

    /// Returns the included audio input instances.
    #[inline]
    #[must_use]
    pub fn inputs(&self) -> &[AudioInputService] {
        &self.aics
    }

    /// Sets the step used by the relative volume opcodes.
    pub fn set_volume_step(&self, step: u8) -> Result<()> {
        if step == 0 {
            return Err(Error::InvalidArgument);
        }
        self.inner.lock().step = step;
        Ok(())
    }

    /// Turns the volume down by one step.
    pub fn volume_down(&self) -> Result<()> {
        self.control(Op::RelVolDown, None)
    }

    /// Turns the volume up by one step.
    pub fn volume_up(&self) -> Result<()> {
        self.control(Op::RelVolUp, None)
    }

    /// Unmutes and turns the volume down by one step.
    pub fn unmute_volume_down(&self) -> Result<()> {
        self.control(Op::UnmuteRelVolDown, None)
    }

    /// Unmutes and turns the volume up by one step.
    pub fn unmute_volume_up(&self) -> Result<()> {
        self.control(Op::UnmuteRelVolUp, None)
    }

    /// Sets the absolute volume.
    pub fn set_volume(&self, volume: u8) -> Result<()> {
        self.control(Op::SetAbsVol, Some(volume))
    }

    /// Unmutes the output.
    pub fn unmute(&self) -> Result<()> {
        self.control(Op::Unmute, None)
    }

    /// Mutes the output.
    pub fn mute(&self) -> Result<()> {
        self.control(Op::Mute, None)
    }

    /// Re-enters the control-point handler with a synthesized request so the
    /// local API and client writes share one commit path.
    fn control(&self, op: Op, operand: Option<u8>) -> Result<()> {
        let mut inst = self.inner.lock();
        let mut val = [0; 3];
        val[0] = op.into();
        val[1] = inst.state.counter;
        let len = operand.map_or(2, |v| {
            val[2] = v;
            3
        });
        inst.write_control(None, 0, &val[..len]).map_err(Error::Att)
    }
}

#[derive(Debug)]
struct Inst {
    state: VolumeState,
    flags: u8,
    step: u8,
    ntf: Sessions<Chr>,
    state_w: watch::Sender<VolumeState>,
    flags_w: watch::Sender<u8>,
}

impl Inst {
    fn new(c: &VolumeControlConfig) -> Arc<SyncMutex<Self>> {
        let state = VolumeState {
            volume: c.volume,
            muted: c.muted,
            counter: 0,
        };
        let (state_w, _) = watch::channel(state);
        let (flags_w, _) = watch::channel(0);
        Arc::new(SyncMutex::new(Self {
            state,
            flags: 0,
            step: c.step,
            ntf: Sessions::new(),
            state_w,
            flags_w,
        }))
    }

    fn state_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => {
                debug!(
                    "Volume {}, mute {}, counter {}",
                    self.state.volume, self.state.muted, self.state.counter
                );
                r.complete([
                    self.state.volume,
                    u8::from(self.state.muted),
                    self.state.counter,
                ])
            }
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::State, n);
                Ok(())
            }
            IoReq::Write(_) => unreachable!(),
        }
    }

    fn control_io(&mut self, req: IoReq) -> IoResult {
        let IoReq::Write(w) = req else { unreachable!() };
        self.write_control(w.peer(), w.offset(), w.value())
    }

    fn flags_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => {
                debug!("Flags {:#04x}", self.flags);
                r.complete([self.flags])
            }
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::Flags, n);
                Ok(())
            }
            IoReq::Write(_) => unreachable!(),
        }
    }

    /// Control-point handler shared by client writes and the local API.
    fn write_control(&mut self, _peer: Option<Addr>, att_off: usize, val: &[u8]) -> IoResult {
        let req = control_req(
            att_off,
            val,
            |op| match op {
                _ if op == Op::SetAbsVol as u8 => Some(1),
                0x00..=0x06 => Some(0),
                _ => None,
            },
            VolumeError::OpcodeNotSupported.into(),
        )?;
        debug!("Opcode {}, counter {}", req.opcode, req.counter);
        if req.counter != self.state.counter {
            return Err(VolumeError::InvalidCounter.into());
        }
        let step = self.step;
        let down = |v: u8| v.saturating_sub(step);
        let up = |v: u8| v.saturating_add(step);
        let mut new = self.state;
        // Relative and absolute volume opcodes latch the changed flag even
        // when the committed value is unchanged
        let mut volume_change = false;
        match req.opcode {
            op if op == Op::RelVolDown as u8 => {
                debug!("Relative Volume Down (0x00)");
                new.volume = down(new.volume);
                volume_change = true;
            }
            op if op == Op::RelVolUp as u8 => {
                debug!("Relative Volume Up (0x01)");
                new.volume = up(new.volume);
                volume_change = true;
            }
            op if op == Op::UnmuteRelVolDown as u8 => {
                debug!("(Unmute) Relative Volume Down (0x02)");
                new.volume = down(new.volume);
                new.muted = false;
                volume_change = true;
            }
            op if op == Op::UnmuteRelVolUp as u8 => {
                debug!("(Unmute) Relative Volume Up (0x03)");
                new.volume = up(new.volume);
                new.muted = false;
                volume_change = true;
            }
            op if op == Op::SetAbsVol as u8 => {
                debug!("Set Absolute Volume (0x04): {}", req.operand[0]);
                new.volume = req.operand[0];
                volume_change = true;
            }
            op if op == Op::Unmute as u8 => {
                debug!("Unmuted (0x05)");
                new.muted = false;
            }
            op if op == Op::Mute as u8 => {
                debug!("Muted (0x06)");
                new.muted = true;
            }
            _ => return Err(VolumeError::OpcodeNotSupported.into()),
        }
        if new != self.state {
            new.counter = self.state.counter.wrapping_add(1);
            self.state = new;
            debug!(
                "New state: volume {}, mute {}, counter {}",
                new.volume, new.muted, new.counter
            );
            self.ntf.notify(Chr::State, None, |p| new.pack(p));
            self.state_w.send_replace(new);
        }
        if volume_change && self.flags & FLAG_VOLUME_CHANGED == 0 {
            self.flags |= FLAG_VOLUME_CHANGED;
            let flags = self.flags;
            self.ntf.notify(Chr::Flags, None, |p| {
                p.u8(flags);
            });
            self.flags_w.send_replace(flags);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use murmur_const::Uuid;

    use crate::att::{HandleRange, Opcode};
    use crate::gatt::{IoMap, NotifyReq, ReadReq, WriteReq};

    use super::*;

    struct Fix {
        svc: VolumeControlService,
        db: Db,
        io: IoMap,
        state: Handle,
        control: Handle,
        flags: Handle,
    }

    fn fix(c: &VolumeControlConfig) -> Fix {
        let svc = VolumeControlService::new(c).unwrap();
        let mut db = Db::build();
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let vcs = (db.primary_services(Handle::new(1).unwrap(), None)).next().unwrap();
        let mut hdls = db
            .characteristics(vcs.handle_range())
            .map(|c| c.value_handle())
            .collect::<Vec<_>>()
            .into_iter();
        let (state, control, flags) = (
            hdls.next().unwrap(),
            hdls.next().unwrap(),
            hdls.next().unwrap(),
        );
        Fix {
            svc,
            db,
            io,
            state,
            control,
            flags,
        }
    }

    fn write(f: &Fix, val: &[u8]) -> IoResult {
        let req = WriteReq::new(
            Opcode::WriteReq,
            f.control,
            Characteristic::VolumeControlPoint.uuid(),
            Some(Addr::default()),
            0,
            val,
        );
        f.io.write(&req)
    }

    fn read(f: &Fix, hdl: Handle) -> Vec<u8> {
        let mut req = ReadReq::new(Opcode::ReadReq, 247);
        req.with(hdl, Uuid::try_from(&[0x7D, 0x2B][..]).unwrap(), None, 0);
        f.io.read(&mut req).unwrap();
        req.into_value().as_ref().to_vec()
    }

    fn subscribe(f: &Fix, hdl: Handle) -> tokio::sync::mpsc::Receiver<crate::gatt::NotifyVal> {
        let (req, rx, _ct) = NotifyReq::new(
            hdl,
            Characteristic::VolumeState.uuid(),
            Addr::default(),
            247,
        );
        f.io.notify(req).unwrap();
        rx
    }

    #[test]
    fn volume_up_latches_flags() {
        let f = fix(&VolumeControlConfig::default());
        let mut flags_rx = subscribe(&f, f.flags);
        assert_eq!(read(&f, f.state), vec![100, 0, 0]);
        assert_eq!(read(&f, f.flags), vec![0]);

        write(&f, &[0x01, 0x00]).unwrap();
        assert_eq!(read(&f, f.state), vec![101, 0, 1]);
        assert_eq!(flags_rx.try_recv().unwrap().as_ref(), &[0x01]);
        assert_eq!(read(&f, f.flags), vec![0x01]);

        // The flag latches once per lifetime
        write(&f, &[0x01, 0x01]).unwrap();
        assert!(flags_rx.try_recv().is_err());
    }

    #[test]
    fn set_absolute_volume() {
        let f = fix(&VolumeControlConfig::default());
        write(&f, &[0x01, 0x00]).unwrap();
        write(&f, &[0x04, 0x01, 200]).unwrap();
        assert_eq!(read(&f, f.state), vec![200, 0, 2]);
        assert_eq!(f.svc.volume_state().borrow().volume, 200);
    }

    #[test]
    fn stale_counter_rejected() {
        let f = fix(&VolumeControlConfig::default());
        write(&f, &[0x01, 0x00]).unwrap();
        write(&f, &[0x04, 0x01, 200]).unwrap();
        assert_eq!(
            write(&f, &[0x04, 0x00, 50]),
            Err(VolumeError::InvalidCounter.into())
        );
        assert_eq!(read(&f, f.state), vec![200, 0, 2]);
    }

    #[test]
    fn opcode_and_length_guards() {
        let f = fix(&VolumeControlConfig::default());
        assert_eq!(
            write(&f, &[0x07, 0x00]),
            Err(VolumeError::OpcodeNotSupported.into())
        );
        // Operand only allowed for Set Absolute Volume
        assert_eq!(
            write(&f, &[0x01, 0x00, 0x05]),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(
            write(&f, &[0x04, 0x00]),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(write(&f, &[]), Err(ErrorCode::InvalidAttributeValueLength));
    }

    #[test]
    fn mute_unmute_idempotence() {
        let f = fix(&VolumeControlConfig::default());
        let mut state_rx = subscribe(&f, f.state);

        write(&f, &[0x06, 0x00]).unwrap();
        assert_eq!(state_rx.try_recv().unwrap().as_ref(), &[100, 1, 1]);

        // Mute while muted: success, no commit, no notification
        write(&f, &[0x06, 0x01]).unwrap();
        assert!(state_rx.try_recv().is_err());
        assert_eq!(read(&f, f.state), vec![100, 1, 1]);

        write(&f, &[0x05, 0x01]).unwrap();
        assert_eq!(state_rx.try_recv().unwrap().as_ref(), &[100, 0, 2]);
        // Mute opcodes never latch the volume flag
        assert_eq!(read(&f, f.flags), vec![0]);
    }

    #[test]
    fn volume_bounds() {
        let f = fix(&VolumeControlConfig {
            volume: 255,
            ..VolumeControlConfig::default()
        });
        // Saturates at the top
        write(&f, &[0x01, 0x00]).unwrap();
        assert_eq!(read(&f, f.state), vec![255, 0, 0]);
        // But still latches the changed flag
        assert_eq!(read(&f, f.flags), vec![0x01]);

        f.svc.set_volume(0).unwrap();
        write(&f, &[0x00, 0x01]).unwrap();
        assert_eq!(read(&f, f.state), vec![0, 0, 1]);
    }

    #[test]
    fn unmute_volume_step() {
        let f = fix(&VolumeControlConfig {
            volume: 50,
            muted: true,
            step: 10,
            ..VolumeControlConfig::default()
        });
        write(&f, &[0x03, 0x00]).unwrap();
        assert_eq!(read(&f, f.state), vec![60, 0, 1]);
        f.svc.set_volume_step(25).unwrap();
        write(&f, &[0x02, 0x01]).unwrap();
        assert_eq!(read(&f, f.state), vec![35, 0, 2]);
        assert_eq!(f.svc.set_volume_step(0), Err(Error::InvalidArgument));
    }

    #[test]
    fn local_api_shares_commit_path() {
        let f = fix(&VolumeControlConfig::default());
        f.svc.volume_down().unwrap();
        f.svc.mute().unwrap();
        let s = *f.svc.volume_state().borrow();
        assert_eq!((s.volume, s.muted, s.counter), (99, true, 2));
        assert_eq!(*f.svc.flags().borrow(), FLAG_VOLUME_CHANGED);
    }

    #[test]
    fn includes_declared() {
        let f = fix(&VolumeControlConfig {
            offsets: vec![VolumeOffsetConfig::default(); 2],
            inputs: vec![AudioInputConfig::default()],
            ..VolumeControlConfig::default()
        });
        let vcs = (f.db.primary_services(Handle::new(1).unwrap(), None)).next().unwrap();
        let inc: Vec<_> = f.db.includes(vcs.handle_range()).collect();
        assert_eq!(inc.len(), 3);
        assert_eq!(
            inc[0].include_uuid(),
            Some(Service::VolumeOffsetControl.uuid16())
        );
        assert_eq!(
            inc[2].include_uuid(),
            Some(Service::AudioInputControl.uuid16())
        );
        assert_eq!(f.svc.offsets().len(), 2);
        assert_eq!(f.svc.inputs().len(), 1);
    }

    #[test]
    fn zero_step_rejected() {
        assert!(matches!(
            VolumeControlService::new(&VolumeControlConfig {
                step: 0,
                ..VolumeControlConfig::default()
            }),
            Err(Error::InvalidArgument)
        ));
    }
}
