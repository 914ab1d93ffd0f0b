//! Audio Input Control client.
//!
//! Mirrors one remote AICS instance discovered through a parent service's
//! include declarations. The parent owns the transport; every operation
//! borrows it for the duration of one transaction.

use tokio::sync::watch;
use tracing::{debug, warn};

use murmur_const::Characteristic;

use crate::att::{ErrorCode, Handle, HandleRange, MAX_VAL_LEN};
use crate::gatt::client::Gatt;
use crate::gatt::Prop;
use crate::{Error, Result};

use super::{GainError, GainSettings, InputState, InputStatus, InputType, Op};

/// Client mirror of one remote Audio Input Control instance.
#[derive(Debug)]
pub struct AudioInputClient {
    range: HandleRange,
    state_hdl: Option<Handle>,
    gain_hdl: Option<Handle>,
    type_hdl: Option<Handle>,
    status_hdl: Option<Handle>,
    control_hdl: Option<Handle>,
    desc_hdl: Option<Handle>,
    desc_writable: bool,
    busy: bool,
    state: InputState,
    gain_settings: Option<GainSettings>,
    desc: String,
    state_w: watch::Sender<InputState>,
    status_w: watch::Sender<InputStatus>,
    desc_w: watch::Sender<String>,
}

impl AudioInputClient {
    /// Discovers the instance's characteristics within its handle range and
    /// subscribes to the ones that notify.
    pub(crate) async fn discover<T: Gatt>(gatt: &mut T, range: HandleRange) -> Result<Self> {
        let (state_w, _) = watch::channel(InputState::default());
        let (status_w, _) = watch::channel(InputStatus::Active);
        let (desc_w, _) = watch::channel(String::new());
        let mut this = Self {
            range,
            state_hdl: None,
            gain_hdl: None,
            type_hdl: None,
            status_hdl: None,
            control_hdl: None,
            desc_hdl: None,
            desc_writable: false,
            busy: false,
            state: InputState::default(),
            gain_settings: None,
            desc: String::new(),
            state_w,
            status_w,
            desc_w,
        };
        for c in gatt.characteristics(range).await? {
            let Some(u) = c.uuid.as_uuid16() else { continue };
            let mut sub = false;
            if u == Characteristic::AudioInputState {
                debug!("Audio input state {}", c.value);
                this.state_hdl = Some(c.value);
                sub = true;
            } else if u == Characteristic::GainSettings {
                debug!("Gain settings {}", c.value);
                this.gain_hdl = Some(c.value);
            } else if u == Characteristic::AudioInputType {
                debug!("Input type {}", c.value);
                this.type_hdl = Some(c.value);
            } else if u == Characteristic::AudioInputStatus {
                debug!("Input status {}", c.value);
                this.status_hdl = Some(c.value);
                sub = true;
            } else if u == Characteristic::AudioInputControlPoint {
                debug!("Control point {}", c.value);
                this.control_hdl = Some(c.value);
            } else if u == Characteristic::AudioInputDescription {
                debug!("Description {}", c.value);
                this.desc_hdl = Some(c.value);
                sub = c.props.contains(Prop::NOTIFY);
                this.desc_writable = c.props.contains(Prop::WRITE_CMD);
            }
            if sub {
                if let Some(ccc) = c.client_config() {
                    gatt.subscribe(ccc).await?;
                }
            }
        }
        Ok(this)
    }

    /// Returns whether a value handle belongs to this instance.
    #[inline]
    #[must_use]
    pub fn contains(&self, hdl: Handle) -> bool {
        use std::ops::RangeBounds;
        self.range.contains(&hdl)
    }

    /// Returns a watch receiver reflecting input state changes.
    #[inline]
    #[must_use]
    pub fn input_state(&self) -> watch::Receiver<InputState> {
        self.state_w.subscribe()
    }

    /// Returns a watch receiver reflecting input status changes.
    #[inline]
    #[must_use]
    pub fn status(&self) -> watch::Receiver<InputStatus> {
        self.status_w.subscribe()
    }

    /// Returns a watch receiver reflecting description changes.
    #[inline]
    #[must_use]
    pub fn description(&self) -> watch::Receiver<String> {
        self.desc_w.subscribe()
    }

    /// Returns the cached gain settings, if read.
    #[inline]
    #[must_use]
    pub const fn cached_gain_settings(&self) -> Option<GainSettings> {
        self.gain_settings
    }

    /// Returns whether the peer permits description writes.
    #[inline]
    #[must_use]
    pub const fn description_writable(&self) -> bool {
        self.desc_writable
    }

    /// Clears the busy gate after a disconnect tore down the transaction.
    pub(crate) fn reset(&mut self) {
        self.busy = false;
    }

    /// Reads the input state, updating the cached change counter.
    pub async fn read_state<T: Gatt>(&mut self, gatt: &mut T) -> Result<InputState> {
        let hdl = self.state_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = gatt.read(hdl).await;
        self.busy = false;
        let s = InputState::unpack(&r?).ok_or(ErrorCode::InvalidAttributeValueLength)?;
        self.update_state(s);
        Ok(s)
    }

    /// Reads the immutable gain settings.
    pub async fn read_gain_settings<T: Gatt>(&mut self, gatt: &mut T) -> Result<GainSettings> {
        let hdl = self.gain_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = gatt.read(hdl).await;
        self.busy = false;
        let gs = GainSettings::unpack(&r?).ok_or(ErrorCode::InvalidAttributeValueLength)?;
        self.gain_settings = Some(gs);
        Ok(gs)
    }

    /// Reads the immutable input type.
    pub async fn read_input_type<T: Gatt>(&mut self, gatt: &mut T) -> Result<InputType> {
        let hdl = self.type_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = gatt.read(hdl).await;
        self.busy = false;
        let v = r?;
        let &[typ] = &*v else {
            return Err(ErrorCode::InvalidAttributeValueLength.into());
        };
        InputType::try_from(typ).map_err(|_| ErrorCode::ValueNotAllowed.into())
    }

    /// Reads the input status.
    pub async fn read_status<T: Gatt>(&mut self, gatt: &mut T) -> Result<InputStatus> {
        let hdl = self.status_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = gatt.read(hdl).await;
        self.busy = false;
        let v = r?;
        let Some(status) = v.first().and_then(|&b| InputStatus::try_from(b).ok()) else {
            return Err(ErrorCode::InvalidAttributeValueLength.into());
        };
        self.status_w.send_replace(status);
        Ok(status)
    }

    /// Reads the input description.
    pub async fn read_description<T: Gatt>(&mut self, gatt: &mut T) -> Result<String> {
        let hdl = self.desc_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = gatt.read(hdl).await;
        self.busy = false;
        let v = r?;
        if v.len() > MAX_VAL_LEN {
            return Err(ErrorCode::InvalidAttributeValueLength.into());
        }
        let desc = String::from_utf8_lossy(&v).into_owned();
        self.desc.clone_from(&desc);
        self.desc_w.send_replace(desc.clone());
        Ok(desc)
    }

    /// Sets the gain, retrying once on a change-counter mismatch.
    #[allow(clippy::cast_sign_loss)]
    pub async fn set_gain<T: Gatt>(&mut self, gatt: &mut T, gain: i8) -> Result<()> {
        self.control(gatt, Op::SetGain, Some(gain as u8)).await
    }

    /// Unmutes the input.
    pub async fn unmute<T: Gatt>(&mut self, gatt: &mut T) -> Result<()> {
        self.control(gatt, Op::Unmute, None).await
    }

    /// Mutes the input.
    pub async fn mute<T: Gatt>(&mut self, gatt: &mut T) -> Result<()> {
        self.control(gatt, Op::Mute, None).await
    }

    /// Switches the input to manual gain mode.
    pub async fn set_manual_gain<T: Gatt>(&mut self, gatt: &mut T) -> Result<()> {
        self.control(gatt, Op::SetManual, None).await
    }

    /// Switches the input to automatic gain mode.
    pub async fn set_automatic_gain<T: Gatt>(&mut self, gatt: &mut T) -> Result<()> {
        self.control(gatt, Op::SetAuto, None).await
    }

    /// Writes the input description without response.
    pub async fn set_description<T: Gatt>(&mut self, gatt: &mut T, desc: &str) -> Result<()> {
        let hdl = self.desc_hdl.ok_or(Error::InvalidArgument)?;
        if !self.desc_writable {
            debug!("Description is not writable on the peer instance");
            return Err(Error::NotPermitted);
        }
        self.begin()?;
        let r = gatt.write_cmd(hdl, desc.as_bytes()).await;
        self.busy = false;
        r
    }

    /// Dispatches a notification by value handle. Returns whether the handle
    /// belongs to this instance.
    pub fn handle_notification(&mut self, hdl: Handle, data: &[u8]) -> bool {
        if Some(hdl) == self.state_hdl {
            // Length mismatches are dropped, the subscription stays alive
            if let Some(s) = InputState::unpack(data) {
                debug!(
                    "Gain {}, mute {}, mode {}, counter {}",
                    s.gain, s.mute, s.mode, s.counter
                );
                self.update_state(s);
            }
        } else if Some(hdl) == self.status_hdl {
            if let Some(status) = data.first().and_then(|&b| InputStatus::try_from(b).ok()) {
                debug!("Status {status}");
                self.status_w.send_replace(status);
            }
        } else if Some(hdl) == self.desc_hdl {
            if data.len() > MAX_VAL_LEN {
                warn!("Description notification too long ({})", data.len());
                return true;
            }
            let desc = String::from_utf8_lossy(data).into_owned();
            debug!("Description {desc:?}");
            self.desc.clone_from(&desc);
            self.desc_w.send_replace(desc);
        } else {
            return false;
        }
        true
    }

    /// Control-point write with the one-shot counter refresh.
    async fn control<T: Gatt>(&mut self, gatt: &mut T, op: Op, operand: Option<u8>) -> Result<()> {
        const INVALID_COUNTER: Error =
            Error::Att(ErrorCode::Application(GainError::InvalidCounter as u8));
        let control = self.control_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = match gatt.write(control, &control_buf(op, self.state.counter, operand)).await {
            Err(e) if e == INVALID_COUNTER && self.state_hdl.is_some() => {
                let hdl = self.state_hdl.unwrap_or_else(|| unreachable!());
                match (gatt.read(hdl).await)
                    .ok()
                    .and_then(|v| InputState::unpack(&v))
                {
                    Some(s) => {
                        self.update_state(s);
                        gatt.write(control, &control_buf(op, s.counter, operand)).await
                    }
                    None => Err(ErrorCode::UnlikelyError.into()),
                }
            }
            r => r,
        };
        self.busy = false;
        r
    }

    fn update_state(&mut self, s: InputState) {
        self.state = s;
        self.state_w.send_replace(s);
    }

    fn begin(&mut self) -> Result<()> {
        if self.busy {
            return Err(Error::Busy);
        }
        self.busy = true;
        Ok(())
    }
}

fn control_buf(op: Op, counter: u8, operand: Option<u8>) -> Vec<u8> {
    let mut v = vec![op.into(), counter];
    if let Some(operand) = operand {
        v.push(operand);
    }
    v
}
