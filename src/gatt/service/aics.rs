//! Audio Input Control Service (\[AICS\]).
//!
//! A secondary service describing one audio input's gain, mute, and gain
//! mode. Instances are owned and included by a primary service such as
//! [`vcs::VolumeControlService`](super::vcs::VolumeControlService).

use std::sync::Arc;

use structbuf::Packer;
use tokio::sync::watch;
use tracing::debug;

use murmur_const::{Characteristic, Service};

use crate::att::{Access, ErrorCode, Handle};
use crate::gatt::{Builder, Db, Io, IoReq, IoResult, Prop};
use crate::le::Addr;
use crate::{Error, Result, SyncMutex};

use super::{control_req, desc_eq, desc_store, Sessions};

pub use client::AudioInputClient;

pub mod client;

/// Maximum stored description length in bytes. Longer writes are clipped.
pub const MAX_DESC_LEN: usize = 32;

/// Control point opcodes (\[AICS\] Section 3.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub(crate) enum Op {
    SetGain = 0x01,
    Unmute = 0x02,
    Mute = 0x03,
    SetManual = 0x04,
    SetAuto = 0x05,
}

/// Service error codes sent over ATT (\[AICS\] Section 1.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum GainError {
    InvalidCounter = 0x80,
    OpcodeNotSupported = 0x81,
    MuteDisabled = 0x82,
    OutOfRange = 0x83,
    GainModeNotAllowed = 0x84,
}

impl From<GainError> for ErrorCode {
    #[inline(always)]
    fn from(e: GainError) -> Self {
        Self::Application(e.into())
    }
}

crate::impl_display_via_debug! { GainError }

/// Input mute state.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq,
    num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum Mute {
    #[default]
    Unmuted = 0x00,
    Muted = 0x01,
    /// Mute and Unmute opcodes are rejected in this state.
    Disabled = 0x02,
}

/// Gain mode. The `*Only` modes cannot be changed by a client.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq,
    num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum Mode {
    ManualOnly = 0x00,
    AutoOnly = 0x01,
    #[default]
    Manual = 0x02,
    Auto = 0x03,
}

impl Mode {
    /// Returns whether a client may switch between manual and automatic.
    #[inline]
    #[must_use]
    pub const fn adjustable(self) -> bool {
        matches!(self, Self::Manual | Self::Auto)
    }
}

/// Audio input type.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq,
    num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum InputType {
    #[default]
    Local = 0x00,
    Iso = 0x01,
    Analog = 0x02,
    Digital = 0x03,
    Radio = 0x04,
    PhysicalMedia = 0x05,
    Network = 0x06,
    Other = 0xFF,
}

/// Input status.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq,
    num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum InputStatus {
    Inactive = 0x00,
    #[default]
    Active = 0x01,
}

/// Audio Input State characteristic value (\[AICS\] Section 2.2.1).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InputState {
    pub gain: i8,
    pub mute: Mute,
    pub mode: Mode,
    pub counter: u8,
}

impl InputState {
    /// Value length on the wire.
    pub(crate) const LEN: usize = 4;

    pub(crate) fn pack(self, p: &mut Packer) {
        p.i8(self.gain).u8(self.mute).u8(self.mode).u8(self.counter);
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn unpack(v: &[u8]) -> Option<Self> {
        if v.len() != Self::LEN {
            return None;
        }
        Some(Self {
            gain: v[0] as i8,
            mute: Mute::try_from(v[1]).ok()?,
            mode: Mode::try_from(v[2]).ok()?,
            counter: v[3],
        })
    }
}

/// Gain Settings Properties characteristic value (\[AICS\] Section 2.2.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GainSettings {
    /// Gain step size in 0.1 dB units.
    pub units: u8,
    pub min: i8,
    pub max: i8,
}

impl GainSettings {
    pub(crate) const LEN: usize = 3;

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn unpack(v: &[u8]) -> Option<Self> {
        (v.len() == Self::LEN).then(|| Self {
            units: v[0],
            min: v[1] as i8,
            max: v[2] as i8,
        })
    }
}

impl Default for GainSettings {
    fn default() -> Self {
        Self {
            units: 1,
            min: i8::MIN,
            max: i8::MAX,
        }
    }
}

/// Instance configuration.
#[derive(Clone, Debug, Default)]
pub struct AudioInputConfig {
    pub gain: i8,
    pub mute: Mute,
    pub mode: Mode,
    /// Immutable after init.
    pub gain_settings: GainSettings,
    /// Immutable after init.
    pub input_type: InputType,
    pub status: InputStatus,
    /// Input description. Clipped to [`MAX_DESC_LEN`] bytes.
    pub description: String,
    /// Allow clients to rewrite the input description.
    pub description_writable: bool,
}

/// Characteristic selector for notification sessions.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Chr {
    State,
    Status,
    Desc,
}

/// Audio Input Control service instance.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct AudioInputService(Arc<SyncMutex<Inst>>);

impl AudioInputService {
    /// Creates a new instance.
    pub fn new(c: &AudioInputConfig) -> Result<Self> {
        let gs = c.gain_settings;
        if gs.min > gs.max || !(gs.min..=gs.max).contains(&c.gain) {
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
        let (gs, typ, desc_writable) = {
            let inst = self.0.lock();
            (inst.gain_settings, inst.input_type, inst.desc_writable)
        };
        db.secondary_service(Service::AudioInputControl, [], |db| {
            db.characteristic(
                Characteristic::AudioInputState,
                Prop::READ | Prop::NOTIFY,
                RO,
                Io::with(&self.0, |t, req| t.lock().state_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
            #[allow(clippy::cast_sign_loss)]
            db.ro_characteristic(
                Characteristic::GainSettings,
                RO,
                [gs.units, gs.min as u8, gs.max as u8],
                |_| {},
            );
            db.ro_characteristic(Characteristic::AudioInputType, RO, [u8::from(typ)], |_| {});
            db.characteristic(
                Characteristic::AudioInputStatus,
                Prop::READ | Prop::NOTIFY,
                RO,
                Io::with(&self.0, |t, req| t.lock().status_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
            db.characteristic(
                Characteristic::AudioInputControlPoint,
                Prop::WRITE,
                WO,
                Io::with(&self.0, |t, req| t.lock().control_io(req)),
                |_| {},
            );
            let (props, perms) = if desc_writable {
                (Prop::READ | Prop::NOTIFY | Prop::WRITE_CMD, RO | WO)
            } else {
                (Prop::READ | Prop::NOTIFY, RO.into())
            };
            db.characteristic(
                Characteristic::AudioInputDescription,
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

    /// Returns a watch receiver reflecting input state changes.
    #[inline]
    #[must_use]
    pub fn input_state(&self) -> watch::Receiver<InputState> {
        self.0.lock().state_w.subscribe()
    }

    /// Returns a watch receiver reflecting input status changes.
    #[inline]
    #[must_use]
    pub fn status(&self) -> watch::Receiver<InputStatus> {
        self.0.lock().status_w.subscribe()
    }

    /// Returns a watch receiver reflecting input description changes.
    #[inline]
    #[must_use]
    pub fn description(&self) -> watch::Receiver<String> {
        self.0.lock().desc_w.subscribe()
    }

    /// Returns the immutable gain settings.
    #[inline]
    #[must_use]
    pub fn gain_settings(&self) -> GainSettings {
        self.0.lock().gain_settings
    }

    /// Returns the immutable input type.
    #[inline]
    #[must_use]
    pub fn input_type(&self) -> InputType {
        self.0.lock().input_type
    }

    /// Sets the gain through the same validation and commit path as a client
    /// control-point write.
    #[allow(clippy::cast_sign_loss)]
    pub fn set_gain(&self, gain: i8) -> Result<()> {
        self.control(Op::SetGain, Some(gain as u8))
    }

    /// Unmutes the input.
    pub fn unmute(&self) -> Result<()> {
        self.control(Op::Unmute, None)
    }

    /// Mutes the input.
    pub fn mute(&self) -> Result<()> {
        self.control(Op::Mute, None)
    }

    /// Switches the input to manual gain mode.
    pub fn set_manual_gain(&self) -> Result<()> {
        self.control(Op::SetManual, None)
    }

    /// Switches the input to automatic gain mode.
    pub fn set_automatic_gain(&self) -> Result<()> {
        self.control(Op::SetAuto, None)
    }

    /// Sets the input description, clipping it to [`MAX_DESC_LEN`] bytes.
    pub fn set_description(&self, desc: &str) -> Result<()> {
        (self.0.lock().write_desc(None, desc.as_bytes())).map_err(Error::Att)
    }

    /// Marks the input active, notifying subscribers of the status change.
    pub fn activate(&self) {
        self.0.lock().set_status(InputStatus::Active);
    }

    /// Marks the input inactive, notifying subscribers of the status change.
    pub fn deactivate(&self) {
        self.0.lock().set_status(InputStatus::Inactive);
    }

    fn control(&self, op: Op, operand: Option<u8>) -> Result<()> {
        let mut inst = self.0.lock();
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
    state: InputState,
    gain_settings: GainSettings,
    input_type: InputType,
    status: InputStatus,
    desc: String,
    desc_writable: bool,
    ntf: Sessions<Chr>,
    state_w: watch::Sender<InputState>,
    status_w: watch::Sender<InputStatus>,
    desc_w: watch::Sender<String>,
}

impl Inst {
    fn new(c: &AudioInputConfig) -> Arc<SyncMutex<Self>> {
        let state = InputState {
            gain: c.gain,
            mute: c.mute,
            mode: c.mode,
            counter: 0,
        };
        let desc = desc_store(c.description.as_bytes(), MAX_DESC_LEN);
        let (state_w, _) = watch::channel(state);
        let (status_w, _) = watch::channel(c.status);
        let (desc_w, _) = watch::channel(desc.clone());
        Arc::new(SyncMutex::new(Self {
            state,
            gain_settings: c.gain_settings,
            input_type: c.input_type,
            status: c.status,
            desc,
            desc_writable: c.description_writable,
            ntf: Sessions::new(),
            state_w,
            status_w,
            desc_w,
        }))
    }

    fn state_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => {
                debug!(
                    "Gain {}, mute {}, mode {}, counter {}",
                    self.state.gain, self.state.mute, self.state.mode, self.state.counter
                );
                #[allow(clippy::cast_sign_loss)]
                let v = [
                    self.state.gain as u8,
                    self.state.mute.into(),
                    self.state.mode.into(),
                    self.state.counter,
                ];
                r.complete(v)
            }
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::State, n);
                Ok(())
            }
            IoReq::Write(_) => unreachable!(),
        }
    }

    fn status_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => r.complete([u8::from(self.status)]),
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::Status, n);
                Ok(())
            }
            IoReq::Write(_) => unreachable!(),
        }
    }

    fn control_io(&mut self, req: IoReq) -> IoResult {
        let IoReq::Write(w) = req else { unreachable!() };
        self.write_control(w.peer(), w.offset(), w.value())
    }

    fn desc_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => r.complete(self.desc.as_bytes()),
            IoReq::Write(w) => self.write_desc(w.peer(), w.value()),
            IoReq::Notify(n) => {
                self.ntf.insert(Chr::Desc, n);
                Ok(())
            }
        }
    }

    /// Control-point handler shared by client writes and the local API.
    fn write_control(&mut self, _peer: Option<Addr>, att_off: usize, val: &[u8]) -> IoResult {
        let req = control_req(
            att_off,
            val,
            |op| match op {
                _ if op == Op::SetGain as u8 => Some(1),
                _ if (Op::Unmute as u8..=Op::SetAuto as u8).contains(&op) => Some(0),
                _ => None,
            },
            GainError::OpcodeNotSupported.into(),
        )?;
        debug!("Opcode {}, counter {}", req.opcode, req.counter);
        if req.counter != self.state.counter {
            return Err(GainError::InvalidCounter.into());
        }
        let mut new = self.state;
        match req.opcode {
            op if op == Op::SetGain as u8 => {
                #[allow(clippy::cast_possible_wrap)]
                let gain = req.operand[0] as i8;
                debug!("Set gain {gain}");
                if !(self.gain_settings.min..=self.gain_settings.max).contains(&gain) {
                    return Err(GainError::OutOfRange.into());
                }
                // A valid gain is accepted in the fixed modes, but only
                // applied when the mode is client-adjustable
                if new.mode.adjustable() {
                    new.gain = gain;
                }
            }
            op if op == Op::Unmute as u8 => {
                debug!("Unmute");
                if new.mute == Mute::Disabled {
                    return Err(GainError::MuteDisabled.into());
                }
                new.mute = Mute::Unmuted;
            }
            op if op == Op::Mute as u8 => {
                debug!("Mute");
                if new.mute == Mute::Disabled {
                    return Err(GainError::MuteDisabled.into());
                }
                new.mute = Mute::Muted;
            }
            op if op == Op::SetManual as u8 => {
                debug!("Set manual mode");
                if !new.mode.adjustable() {
                    return Err(GainError::GainModeNotAllowed.into());
                }
                new.mode = Mode::Manual;
            }
            op if op == Op::SetAuto as u8 => {
                debug!("Set automatic mode");
                if !new.mode.adjustable() {
                    return Err(GainError::GainModeNotAllowed.into());
                }
                new.mode = Mode::Auto;
            }
            _ => return Err(GainError::OpcodeNotSupported.into()),
        }
        if new != self.state {
            new.counter = self.state.counter.wrapping_add(1);
            self.state = new;
            debug!(
                "New state: gain {}, mute {}, mode {}, counter {}",
                new.gain, new.mute, new.mode, new.counter
            );
            self.ntf.notify(Chr::State, None, |p| new.pack(p));
            self.state_w.send_replace(new);
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
        // A NUL-padded byte-for-byte match is skipped, so a write that is a
        // prefix of the stored value compares as unchanged
        if !desc_eq(&self.desc, raw) {
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

    fn set_status(&mut self, status: InputStatus) {
        if self.status != status {
            self.status = status;
            debug!("Status {status}");
            self.ntf.notify(Chr::Status, None, |p| {
                p.u8(status);
            });
            self.status_w.send_replace(status);
        }
    }
}

crate::impl_display_via_debug! { Mute, Mode, InputType, InputStatus }

#[cfg(test)]
mod tests {
    use crate::att::{HandleRange, Opcode};
    use crate::gatt::{IoMap, ReadReq, WriteReq};

    use super::*;

    fn inst(c: &AudioInputConfig) -> (AudioInputService, IoMap, Vec<Handle>) {
        let svc = AudioInputService::new(c).unwrap();
        let mut db = Db::build();
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let hdls = (db.characteristics(HandleRange::ALL))
            .map(|c| c.value_handle())
            .collect();
        (svc, io, hdls)
    }

    fn write(io: &IoMap, hdl: Handle, val: &[u8]) -> IoResult {
        let req = WriteReq::new(
            Opcode::WriteReq,
            hdl,
            Characteristic::AudioInputControlPoint.uuid(),
            Some(Addr::default()),
            0,
            val,
        );
        io.write(&req)
    }

    fn read(io: &IoMap, hdl: Handle) -> Vec<u8> {
        let mut req = ReadReq::new(Opcode::ReadReq, 247);
        req.with(hdl, Characteristic::AudioInputState.uuid(), None, 0);
        io.read(&mut req).unwrap();
        req.into_value().as_ref().to_vec()
    }

    #[test]
    fn gain() {
        let (svc, io, hdls) = inst(&AudioInputConfig {
            gain: 0,
            gain_settings: GainSettings {
                units: 1,
                min: -10,
                max: 10,
            },
            ..AudioInputConfig::default()
        });
        let (state, control) = (hdls[0], hdls[4]);

        write(&io, control, &[0x01, 0, 5]).unwrap();
        assert_eq!(read(&io, state), vec![5, 0, 2, 1]);
        assert_eq!(svc.input_state().borrow().gain, 5);

        // Out of range
        assert_eq!(
            write(&io, control, &[0x01, 1, 0x20]),
            Err(GainError::OutOfRange.into())
        );

        // Stale counter
        assert_eq!(
            write(&io, control, &[0x01, 0, 3]),
            Err(GainError::InvalidCounter.into())
        );
    }

    #[test]
    fn gain_not_applied_in_fixed_mode() {
        let (svc, io, hdls) = inst(&AudioInputConfig {
            mode: Mode::AutoOnly,
            ..AudioInputConfig::default()
        });
        let control = hdls[4];

        // Accepted by the protocol, not applied
        write(&io, control, &[0x01, 0, 5]).unwrap();
        let state = *svc.input_state().borrow();
        assert_eq!(state.gain, 0);
        assert_eq!(state.counter, 0);
    }

    #[test]
    fn mute_disabled() {
        let (svc, io, hdls) = inst(&AudioInputConfig {
            mute: Mute::Disabled,
            ..AudioInputConfig::default()
        });
        let control = hdls[4];
        assert_eq!(
            write(&io, control, &[0x02, 0]),
            Err(GainError::MuteDisabled.into())
        );
        assert_eq!(
            write(&io, control, &[0x03, 0]),
            Err(GainError::MuteDisabled.into())
        );
        assert_eq!(svc.input_state().borrow().counter, 0);
    }

    #[test]
    fn fixed_mode_rejects_mode_change() {
        for mode in [Mode::ManualOnly, Mode::AutoOnly] {
            let (svc, io, hdls) = inst(&AudioInputConfig {
                mode,
                ..AudioInputConfig::default()
            });
            let control = hdls[4];
            assert_eq!(
                write(&io, control, &[0x04, 0]),
                Err(GainError::GainModeNotAllowed.into())
            );
            assert_eq!(
                write(&io, control, &[0x05, 0]),
                Err(GainError::GainModeNotAllowed.into())
            );
            assert_eq!(svc.input_state().borrow().counter, 0);
        }
    }

    #[test]
    fn mute_idempotent() {
        let (svc, io, hdls) = inst(&AudioInputConfig::default());
        let control = hdls[4];
        write(&io, control, &[0x03, 0]).unwrap();
        assert_eq!(svc.input_state().borrow().counter, 1);
        // Muting a muted input succeeds without a commit
        write(&io, control, &[0x03, 1]).unwrap();
        assert_eq!(svc.input_state().borrow().counter, 1);
    }

    #[test]
    fn status_flip() {
        let (svc, _io, _) = inst(&AudioInputConfig::default());
        assert_eq!(*svc.status().borrow(), InputStatus::Active);
        svc.deactivate();
        assert_eq!(*svc.status().borrow(), InputStatus::Inactive);
        svc.deactivate(); // Idempotent
        svc.activate();
        assert_eq!(*svc.status().borrow(), InputStatus::Active);
    }

    #[test]
    fn local_ops() {
        let (svc, _io, _) = inst(&AudioInputConfig::default());
        svc.set_gain(7).unwrap();
        svc.mute().unwrap();
        svc.set_automatic_gain().unwrap();
        let state = *svc.input_state().borrow();
        assert_eq!((state.gain, state.mute, state.mode), (7, Mute::Muted, Mode::Auto));
        assert_eq!(state.counter, 3);
    }

    #[test]
    fn ro_values() {
        let (_svc, _io, hdls) = inst(&AudioInputConfig {
            input_type: InputType::Analog,
            ..AudioInputConfig::default()
        });
        assert_eq!(hdls.len(), 6);
    }
}
