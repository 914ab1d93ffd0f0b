//! Volume Offset Control client.
//!
//! Mirrors one remote VOCS instance discovered through a parent service's
//! include declarations. The parent owns the transport; every operation
//! borrows it for the duration of one transaction.

use tokio::sync::watch;
use tracing::{debug, warn};

use murmur_const::Characteristic;

use crate::att::{ErrorCode, Handle, HandleRange, MAX_VAL_LEN};
use crate::gatt::client::Gatt;
use crate::gatt::Prop;
use crate::{Error, Result};

use super::{OffsetError, OffsetState, OP_SET_OFFSET};

/// Client mirror of one remote Volume Offset Control instance.
#[derive(Debug)]
pub struct VolumeOffsetClient {
    range: HandleRange,
    state_hdl: Option<Handle>,
    location_hdl: Option<Handle>,
    control_hdl: Option<Handle>,
    desc_hdl: Option<Handle>,
    location_writable: bool,
    desc_writable: bool,
    busy: bool,
    state: OffsetState,
    location: u8,
    desc: String,
    state_w: watch::Sender<OffsetState>,
    location_w: watch::Sender<u8>,
    desc_w: watch::Sender<String>,
}

impl VolumeOffsetClient {
    /// Discovers the instance's characteristics within its handle range and
    /// subscribes to the ones that notify.
    pub(crate) async fn discover<T: Gatt>(gatt: &mut T, range: HandleRange) -> Result<Self> {
        let (state_w, _) = watch::channel(OffsetState::default());
        let (location_w, _) = watch::channel(0);
        let (desc_w, _) = watch::channel(String::new());
        let mut this = Self {
            range,
            state_hdl: None,
            location_hdl: None,
            control_hdl: None,
            desc_hdl: None,
            location_writable: false,
            desc_writable: false,
            busy: false,
            state: OffsetState::default(),
            location: 0,
            desc: String::new(),
            state_w,
            location_w,
            desc_w,
        };
        for c in gatt.characteristics(range).await? {
            let Some(u) = c.uuid.as_uuid16() else { continue };
            let mut sub = false;
            if u == Characteristic::VolumeOffsetState {
                debug!("Volume offset state {}", c.value);
                this.state_hdl = Some(c.value);
                sub = true;
            } else if u == Characteristic::AudioLocation {
                debug!("Location {}", c.value);
                this.location_hdl = Some(c.value);
                sub = c.props.contains(Prop::NOTIFY);
                this.location_writable = c.props.contains(Prop::WRITE_CMD);
            } else if u == Characteristic::VolumeOffsetControlPoint {
                debug!("Control point {}", c.value);
                this.control_hdl = Some(c.value);
            } else if u == Characteristic::AudioOutputDescription {
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

    /// Returns a watch receiver reflecting offset state changes.
    #[inline]
    #[must_use]
    pub fn offset_state(&self) -> watch::Receiver<OffsetState> {
        self.state_w.subscribe()
    }

    /// Returns a watch receiver reflecting audio location changes.
    #[inline]
    #[must_use]
    pub fn location(&self) -> watch::Receiver<u8> {
        self.location_w.subscribe()
    }

    /// Returns a watch receiver reflecting description changes.
    #[inline]
    #[must_use]
    pub fn description(&self) -> watch::Receiver<String> {
        self.desc_w.subscribe()
    }

    /// Returns whether the peer permits location writes.
    #[inline]
    #[must_use]
    pub const fn location_writable(&self) -> bool {
        self.location_writable
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

    /// Reads the offset state, updating the cached change counter.
    pub async fn read_state<T: Gatt>(&mut self, gatt: &mut T) -> Result<OffsetState> {
        let hdl = self.state_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = gatt.read(hdl).await;
        self.busy = false;
        let s = OffsetState::unpack(&r?).ok_or(ErrorCode::InvalidAttributeValueLength)?;
        self.update_state(s);
        Ok(s)
    }

    /// Reads the audio location.
    pub async fn read_location<T: Gatt>(&mut self, gatt: &mut T) -> Result<u8> {
        let hdl = self.location_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = gatt.read(hdl).await;
        self.busy = false;
        let v = r?;
        let &[location] = &*v else {
            return Err(ErrorCode::InvalidAttributeValueLength.into());
        };
        self.location = location;
        self.location_w.send_replace(location);
        Ok(location)
    }

    /// Reads the output description.
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

    /// Writes the offset through the control point, transparently refreshing
    /// the change counter and retrying once on a counter mismatch.
    pub async fn set_offset<T: Gatt>(&mut self, gatt: &mut T, offset: i16) -> Result<()> {
        let control = self.control_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = self.write_control(gatt, control, offset).await;
        self.busy = false;
        r
    }

    /// Writes the audio location without response.
    pub async fn set_location<T: Gatt>(&mut self, gatt: &mut T, location: u8) -> Result<()> {
        let hdl = self.location_hdl.ok_or(Error::InvalidArgument)?;
        if !self.location_writable {
            debug!("Location is not writable on the peer instance");
            return Err(Error::NotPermitted);
        }
        self.begin()?;
        let r = gatt.write_cmd(hdl, &[location]).await;
        self.busy = false;
        r
    }

    /// Writes the output description without response.
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
            if let Some(s) = OffsetState::unpack(data) {
                debug!("Offset {}, counter {}", s.offset, s.counter);
                self.update_state(s);
            }
        } else if Some(hdl) == self.location_hdl {
            if let &[location] = data {
                debug!("Location {location:#04x}");
                self.location = location;
                self.location_w.send_replace(location);
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

    async fn write_control<T: Gatt>(
        &mut self,
        gatt: &mut T,
        control: Handle,
        offset: i16,
    ) -> Result<()> {
        const INVALID_COUNTER: Error =
            Error::Att(ErrorCode::Application(OffsetError::InvalidCounter as u8));
        match gatt.write(control, &control_buf(self.state.counter, offset)).await {
            Err(e) if e == INVALID_COUNTER && self.state_hdl.is_some() => {
                // Refresh the counter from the state characteristic and
                // retry the buffered write exactly once
                let hdl = self.state_hdl.unwrap_or_else(|| unreachable!());
                let v = (gatt.read(hdl).await).map_err(|_| ErrorCode::UnlikelyError)?;
                let s = OffsetState::unpack(&v).ok_or(ErrorCode::UnlikelyError)?;
                self.update_state(s);
                gatt.write(control, &control_buf(s.counter, offset)).await
            }
            r => r,
        }
    }

    fn update_state(&mut self, s: OffsetState) {
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

fn control_buf(counter: u8, offset: i16) -> [u8; 4] {
    let off = offset.to_le_bytes();
    [OP_SET_OFFSET, counter, off[0], off[1]]
}
