//! Volume Control client.
//!
//! Discovers a remote VCS in four phases: primary service, service
//! characteristics, include declarations, and finally the characteristics of
//! each included Volume Offset and Audio Input instance. Write-capable
//! operations share one transaction at a time per instance; a control-point
//! write that collides with a concurrent change transparently refreshes the
//! change counter and retries once.

use smallvec::SmallVec;
use tokio::sync::watch;
use tracing::{debug, warn};

use murmur_const::{Characteristic, Service};

use crate::att::{ErrorCode, Handle, MAX_VAL_LEN};
use crate::gatt::client::Gatt;
use crate::gatt::service::aics::{AudioInputClient, GainSettings, InputState, InputStatus, InputType};
use crate::gatt::service::vocs::{OffsetState, VolumeOffsetClient};
use crate::{Error, Result};

use super::{Op, VolumeError, VolumeState};

/// Included instance limits. Additional instances on the peer are ignored.
pub const MAX_OFFSET_INSTANCES: usize = 2;
pub const MAX_INPUT_INSTANCES: usize = 2;

/// Volume Control client.
#[derive(Debug)]
pub struct VolumeControlClient<T> {
    gatt: T,
    state_hdl: Option<Handle>,
    control_hdl: Option<Handle>,
    flags_hdl: Option<Handle>,
    busy: bool,
    state: VolumeState,
    vocs: SmallVec<[VolumeOffsetClient; MAX_OFFSET_INSTANCES]>,
    aics: SmallVec<[AudioInputClient; MAX_INPUT_INSTANCES]>,
    state_w: watch::Sender<VolumeState>,
    flags_w: watch::Sender<u8>,
}

impl<T: Gatt> VolumeControlClient<T> {
    /// Creates a client for one connection's transport.
    #[must_use]
    pub fn new(gatt: T) -> Self {
        let (state_w, _) = watch::channel(VolumeState::default());
        let (flags_w, _) = watch::channel(0);
        Self {
            gatt,
            state_hdl: None,
            control_hdl: None,
            flags_hdl: None,
            busy: false,
            state: VolumeState::default(),
            vocs: SmallVec::new(),
            aics: SmallVec::new(),
            state_w,
            flags_w,
        }
    }

    /// Runs the discovery chain, subscribing to every notifying
    /// characteristic of interest. Returns the number of audio input and
    /// volume offset instances found.
    pub async fn discover(&mut self) -> Result<(usize, usize)> {
        self.reset();
        self.state_hdl = None;
        self.control_hdl = None;
        self.flags_hdl = None;
        self.vocs.clear();
        self.aics.clear();

        let Some(svc) = (self.gatt.primary_service(Service::VolumeControl.uuid16())).await? else {
            debug!("No Volume Control instance on the peer");
            return Err(Error::NotSupported);
        };
        for c in self.gatt.characteristics(svc.range).await? {
            let Some(u) = c.uuid.as_uuid16() else { continue };
            let mut sub = false;
            if u == Characteristic::VolumeState {
                debug!("Volume state {}", c.value);
                self.state_hdl = Some(c.value);
                sub = true;
            } else if u == Characteristic::VolumeControlPoint {
                debug!("Control point {}", c.value);
                self.control_hdl = Some(c.value);
            } else if u == Characteristic::VolumeFlags {
                debug!("Flags {}", c.value);
                self.flags_hdl = Some(c.value);
                sub = true;
            }
            if sub {
                if let Some(ccc) = c.client_config() {
                    self.gatt.subscribe(ccc).await?;
                }
            }
        }
        for inc in self.gatt.includes(svc.range).await? {
            let Some(u) = inc.uuid.as_uuid16() else { continue };
            if u == Service::AudioInputControl {
                if self.aics.len() < MAX_INPUT_INSTANCES {
                    let c = AudioInputClient::discover(&mut self.gatt, inc.range).await?;
                    self.aics.push(c);
                }
            } else if u == Service::VolumeOffsetControl
                && self.vocs.len() < MAX_OFFSET_INSTANCES
            {
                let c = VolumeOffsetClient::discover(&mut self.gatt, inc.range).await?;
                self.vocs.push(c);
            }
        }
        debug!(
            "Setup complete: {} AICS, {} VOCS",
            self.aics.len(),
            self.vocs.len()
        );
        Ok((self.aics.len(), self.vocs.len()))
    }

    /// Tears down discovery state after a disconnect. Handles become invalid
    /// and busy gates clear.
    pub fn reset(&mut self) {
        self.busy = false;
        for c in &mut self.vocs {
            c.reset();
        }
        for c in &mut self.aics {
            c.reset();
        }
    }

    /// Returns a watch receiver reflecting volume state changes.
    #[inline]
    #[must_use]
    pub fn volume_state(&self) -> watch::Receiver<VolumeState> {
        self.state_w.subscribe()
    }

    /// Returns a watch receiver reflecting volume flag changes.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> watch::Receiver<u8> {
        self.flags_w.subscribe()
    }

    /// Returns a discovered volume offset instance.
    #[inline]
    #[must_use]
    pub fn offset(&self, i: usize) -> Option<&VolumeOffsetClient> {
        self.vocs.get(i)
    }

    /// Returns a discovered audio input instance.
    #[inline]
    #[must_use]
    pub fn input(&self, i: usize) -> Option<&AudioInputClient> {
        self.aics.get(i)
    }

    /// Reads the volume state, updating the cached change counter.
    pub async fn read_volume_state(&mut self) -> Result<VolumeState> {
        let hdl = self.state_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = self.gatt.read(hdl).await;
        self.busy = false;
        let s = VolumeState::unpack(&r?).ok_or(ErrorCode::InvalidAttributeValueLength)?;
        self.update_state(s);
        Ok(s)
    }

    /// Reads the volume flags.
    pub async fn read_flags(&mut self) -> Result<u8> {
        let hdl = self.flags_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let r = self.gatt.read(hdl).await;
        self.busy = false;
        let v = r?;
        let &[flags] = &*v else {
            return Err(ErrorCode::InvalidAttributeValueLength.into());
        };
        self.flags_w.send_replace(flags);
        Ok(flags)
    }

    /// Turns the volume down by one server-side step.
    pub async fn volume_down(&mut self) -> Result<()> {
        self.control(Op::RelVolDown, None).await
    }

    /// Turns the volume up by one server-side step.
    pub async fn volume_up(&mut self) -> Result<()> {
        self.control(Op::RelVolUp, None).await
    }

    /// Unmutes and turns the volume down by one server-side step.
    pub async fn unmute_volume_down(&mut self) -> Result<()> {
        self.control(Op::UnmuteRelVolDown, None).await
    }

    /// Unmutes and turns the volume up by one server-side step.
    pub async fn unmute_volume_up(&mut self) -> Result<()> {
        self.control(Op::UnmuteRelVolUp, None).await
    }

    /// Sets the absolute volume.
    pub async fn set_volume(&mut self, volume: u8) -> Result<()> {
        self.control(Op::SetAbsVol, Some(volume)).await
    }

    /// Unmutes the output.
    pub async fn unmute(&mut self) -> Result<()> {
        self.control(Op::Unmute, None).await
    }

    /// Mutes the output.
    pub async fn mute(&mut self) -> Result<()> {
        self.control(Op::Mute, None).await
    }

    /// Reads the offset state of an included instance.
    pub async fn offset_state(&mut self, i: usize) -> Result<OffsetState> {
        let Self { gatt, vocs, .. } = self;
        vocs.get_mut(i).ok_or(Error::OutOfRange)?.read_state(gatt).await
    }

    /// Writes the offset of an included instance.
    pub async fn set_offset(&mut self, i: usize, offset: i16) -> Result<()> {
        let Self { gatt, vocs, .. } = self;
        (vocs.get_mut(i).ok_or(Error::OutOfRange)?.set_offset(gatt, offset)).await
    }

    /// Reads the audio location of an included instance.
    pub async fn offset_location(&mut self, i: usize) -> Result<u8> {
        let Self { gatt, vocs, .. } = self;
        (vocs.get_mut(i).ok_or(Error::OutOfRange)?.read_location(gatt)).await
    }

    /// Writes the audio location of an included instance.
    pub async fn set_offset_location(&mut self, i: usize, location: u8) -> Result<()> {
        let Self { gatt, vocs, .. } = self;
        (vocs.get_mut(i).ok_or(Error::OutOfRange)?.set_location(gatt, location)).await
    }

    /// Reads the output description of an included instance.
    pub async fn offset_description(&mut self, i: usize) -> Result<String> {
        let Self { gatt, vocs, .. } = self;
        (vocs.get_mut(i).ok_or(Error::OutOfRange)?.read_description(gatt)).await
    }

    /// Writes the output description of an included instance.
    pub async fn set_offset_description(&mut self, i: usize, desc: &str) -> Result<()> {
        let Self { gatt, vocs, .. } = self;
        (vocs.get_mut(i).ok_or(Error::OutOfRange)?.set_description(gatt, desc)).await
    }

    /// Reads the input state of an included instance.
    pub async fn input_state(&mut self, i: usize) -> Result<InputState> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.read_state(gatt)).await
    }

    /// Reads the gain settings of an included instance.
    pub async fn input_gain_settings(
        &mut self,
        i: usize,
    ) -> Result<GainSettings> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.read_gain_settings(gatt)).await
    }

    /// Reads the input type of an included instance.
    pub async fn input_type(&mut self, i: usize) -> Result<InputType> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.read_input_type(gatt)).await
    }

    /// Reads the input status of an included instance.
    pub async fn input_status(&mut self, i: usize) -> Result<InputStatus> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.read_status(gatt)).await
    }

    /// Sets the gain of an included instance.
    pub async fn set_input_gain(&mut self, i: usize, gain: i8) -> Result<()> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.set_gain(gatt, gain)).await
    }

    /// Mutes an included input.
    pub async fn mute_input(&mut self, i: usize) -> Result<()> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.mute(gatt)).await
    }

    /// Unmutes an included input.
    pub async fn unmute_input(&mut self, i: usize) -> Result<()> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.unmute(gatt)).await
    }

    /// Switches an included input to manual gain mode.
    pub async fn set_input_manual_gain(&mut self, i: usize) -> Result<()> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.set_manual_gain(gatt)).await
    }

    /// Switches an included input to automatic gain mode.
    pub async fn set_input_automatic_gain(&mut self, i: usize) -> Result<()> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.set_automatic_gain(gatt)).await
    }

    /// Reads the description of an included input.
    pub async fn input_description(&mut self, i: usize) -> Result<String> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.read_description(gatt)).await
    }

    /// Writes the description of an included input.
    pub async fn set_input_description(&mut self, i: usize, desc: &str) -> Result<()> {
        let Self { gatt, aics, .. } = self;
        (aics.get_mut(i).ok_or(Error::OutOfRange)?.set_description(gatt, desc)).await
    }

    /// Dispatches an incoming notification by value handle to the matching
    /// mirror.
    pub fn handle_notification(&mut self, hdl: Handle, data: &[u8]) {
        if Some(hdl) == self.state_hdl {
            // Length mismatches are dropped, the subscription stays alive
            if let Some(s) = VolumeState::unpack(data) {
                debug!(
                    "Volume {}, mute {}, counter {}",
                    s.volume, s.muted, s.counter
                );
                self.update_state(s);
            }
            return;
        }
        if Some(hdl) == self.flags_hdl {
            if let &[flags] = data {
                debug!("Flags {flags:#04x}");
                self.flags_w.send_replace(flags);
            }
            return;
        }
        if data.len() > MAX_VAL_LEN {
            warn!("Oversized notification for {hdl}");
            return;
        }
        for c in &mut self.vocs {
            if c.contains(hdl) {
                c.handle_notification(hdl, data);
                return;
            }
        }
        for c in &mut self.aics {
            if c.contains(hdl) {
                c.handle_notification(hdl, data);
                return;
            }
        }
        debug!("Unmatched notification for {hdl}");
    }

    /// Control-point write with the one-shot counter refresh.
    async fn control(&mut self, op: Op, operand: Option<u8>) -> Result<()> {
        const INVALID_COUNTER: Error =
            Error::Att(ErrorCode::Application(VolumeError::InvalidCounter as u8));
        let control = self.control_hdl.ok_or(Error::InvalidArgument)?;
        self.begin()?;
        let buf = control_buf(op, self.state.counter, operand);
        let r = match self.gatt.write(control, &buf).await {
            Err(e) if e == INVALID_COUNTER && self.state_hdl.is_some() => {
                // Refresh the counter from the state characteristic and
                // retry the buffered write exactly once
                let hdl = self.state_hdl.unwrap_or_else(|| unreachable!());
                match (self.gatt.read(hdl).await)
                    .ok()
                    .and_then(|v| VolumeState::unpack(&v))
                {
                    Some(s) => {
                        self.update_state(s);
                        let buf = control_buf(op, s.counter, operand);
                        self.gatt.write(control, &buf).await
                    }
                    None => Err(ErrorCode::UnlikelyError.into()),
                }
            }
            r => r,
        };
        self.busy = false;
        r
    }

    fn update_state(&mut self, s: VolumeState) {
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

    #[cfg(test)]
    fn gatt_mut(&mut self) -> &mut T {
        &mut self.gatt
    }
}

fn control_buf(op: Op, counter: u8, operand: Option<u8>) -> Vec<u8> {
    let mut v = vec![op.into(), counter];
    if let Some(operand) = operand {
        v.push(operand);
    }
    v
}

#[cfg(test)]
mod tests {
    use crate::gatt::client::loopback::Loopback;
    use crate::gatt::service::aics::{
        AudioInputConfig, GainSettings, InputType, Mode, Mute,
    };
    use crate::gatt::service::vcs::{VolumeControlConfig, VolumeControlService};
    use crate::gatt::service::vocs::VolumeOffsetConfig;
    use crate::gatt::Db;
    use crate::le::Addr;

    use super::*;

    fn server() -> VolumeControlService {
        VolumeControlService::new(&VolumeControlConfig {
            offsets: vec![
                VolumeOffsetConfig {
                    offset: -5,
                    location: 0x01,
                    description: "Left".into(),
                    location_writable: true,
                    description_writable: true,
                },
                VolumeOffsetConfig {
                    offset: 5,
                    location: 0x02,
                    description: "Right".into(),
                    ..VolumeOffsetConfig::default()
                },
            ],
            inputs: vec![AudioInputConfig {
                gain: 0,
                gain_settings: GainSettings {
                    units: 1,
                    min: -20,
                    max: 20,
                },
                input_type: InputType::Analog,
                description: "Mic".into(),
                ..AudioInputConfig::default()
            }],
            ..VolumeControlConfig::default()
        })
        .unwrap()
    }

    async fn connect(svc: &VolumeControlService) -> VolumeControlClient<Loopback> {
        let mut db = Db::build();
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let peer = Addr::peer(0, [9, 9, 9, 9, 9, 9].into());
        let mut client = VolumeControlClient::new(Loopback::new(db, io, peer));
        assert_eq!(client.discover().await.unwrap(), (1, 2));
        client
    }

    fn pump(client: &mut VolumeControlClient<Loopback>) {
        for (hdl, data) in client.gatt_mut().drain() {
            client.handle_notification(hdl, &data);
        }
    }

    #[tokio::test]
    async fn discovery_chain() {
        let svc = server();
        let mut client = connect(&svc).await;
        assert!(client.offset(0).is_some());
        assert!(client.offset(2).is_none());
        assert!(client.input(0).is_some());
        assert!(client.offset(0).unwrap().location_writable());
        assert!(!client.offset(1).unwrap().location_writable());

        let s = client.read_volume_state().await.unwrap();
        assert_eq!((s.volume, s.muted, s.counter), (100, false, 0));
        assert_eq!(client.read_flags().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn volume_round_trip() {
        let svc = server();
        let mut client = connect(&svc).await;
        client.read_volume_state().await.unwrap();

        client.set_volume(42).await.unwrap();
        assert_eq!(svc.volume_state().borrow().volume, 42);

        // Server committed, so the client sees the new state by notification
        pump(&mut client);
        assert_eq!(client.volume_state().borrow().volume, 42);
        assert_eq!(*client.flags().borrow(), 0x01);

        client.mute().await.unwrap();
        pump(&mut client);
        assert!(client.volume_state().borrow().muted);
        client.unmute_volume_up().await.unwrap();
        pump(&mut client);
        let s = *client.volume_state().borrow();
        assert_eq!((s.volume, s.muted), (43, false));
    }

    #[tokio::test]
    async fn counter_retry_is_transparent() {
        let svc = server();
        let mut client = connect(&svc).await;
        client.read_volume_state().await.unwrap();

        // A competing local change invalidates the cached counter
        svc.volume_up().unwrap();
        svc.volume_up().unwrap();

        client.set_volume(7).await.unwrap();
        assert_eq!(svc.volume_state().borrow().volume, 7);
        // The refreshed counter is cached for the next transaction
        pump(&mut client);
        client.volume_down().await.unwrap();
        assert_eq!(svc.volume_state().borrow().volume, 6);
    }

    #[tokio::test]
    async fn second_counter_mismatch_surfaces() {
        /// Transport that answers every control-point write with a counter
        /// mismatch.
        #[derive(Debug)]
        struct Stale {
            inner: Loopback,
            control: Option<Handle>,
            writes: usize,
        }

        impl Gatt for Stale {
            async fn primary_service(
                &mut self,
                uuid: murmur_const::Uuid16,
            ) -> Result<Option<crate::gatt::client::ServiceInfo>> {
                self.inner.primary_service(uuid).await
            }
            async fn includes(
                &mut self,
                range: crate::att::HandleRange,
            ) -> Result<Vec<crate::gatt::client::IncludeInfo>> {
                self.inner.includes(range).await
            }
            async fn characteristics(
                &mut self,
                range: crate::att::HandleRange,
            ) -> Result<Vec<crate::gatt::client::CharacteristicInfo>> {
                let v = self.inner.characteristics(range).await?;
                for c in &v {
                    if c.uuid == Characteristic::VolumeControlPoint.uuid() {
                        self.control = Some(c.value);
                    }
                }
                Ok(v)
            }
            async fn read(&mut self, hdl: Handle) -> Result<Vec<u8>> {
                self.inner.read(hdl).await
            }
            async fn write(&mut self, hdl: Handle, val: &[u8]) -> Result<()> {
                if Some(hdl) == self.control {
                    self.writes += 1;
                    return Err(Error::Att(ErrorCode::Application(
                        VolumeError::InvalidCounter as u8,
                    )));
                }
                self.inner.write(hdl, val).await
            }
            async fn write_cmd(&mut self, hdl: Handle, val: &[u8]) -> Result<()> {
                self.inner.write_cmd(hdl, val).await
            }
            async fn subscribe(&mut self, ccc: Handle) -> Result<()> {
                self.inner.subscribe(ccc).await
            }
        }

        let svc = server();
        let mut db = Db::build();
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let peer = Addr::peer(0, [9, 9, 9, 9, 9, 9].into());
        let mut client = VolumeControlClient::new(Stale {
            inner: Loopback::new(db, io, peer),
            control: None,
            writes: 0,
        });
        client.discover().await.unwrap();

        // The mismatch persists, so it surfaces after exactly one retry
        assert_eq!(
            client.set_volume(7).await,
            Err(Error::Att(ErrorCode::Application(
                VolumeError::InvalidCounter as u8
            )))
        );
        assert_eq!(client.gatt_mut().writes, 2);
    }

    #[tokio::test]
    async fn offset_instances() {
        let svc = server();
        let mut client = connect(&svc).await;

        let s = client.offset_state(0).await.unwrap();
        assert_eq!(s.offset, -5);
        assert_eq!(client.offset_location(0).await.unwrap(), 0x01);
        assert_eq!(client.offset_description(0).await.unwrap(), "Left");

        client.set_offset(1, -100).await.unwrap();
        assert_eq!(svc.offsets()[1].offset_state().borrow().offset, -100);

        // Writable flags gate the description and location writes
        client.set_offset_location(0, 0x04).await.unwrap();
        assert_eq!(*svc.offsets()[0].location().borrow(), 0x04);
        assert_eq!(
            client.set_offset_location(1, 0x04).await,
            Err(Error::NotPermitted)
        );
        client.set_offset_description(0, "Side").await.unwrap();
        assert_eq!(&*svc.offsets()[0].description().borrow(), "Side");
        assert_eq!(
            client.set_offset_description(1, "x").await,
            Err(Error::NotPermitted)
        );

        assert_eq!(
            client.set_offset(9, 0).await,
            Err(Error::OutOfRange)
        );
    }

    #[tokio::test]
    async fn offset_retry_after_competing_writer() {
        let svc = server();
        let mut client = connect(&svc).await;
        client.offset_state(0).await.unwrap();

        svc.offsets()[0].set_offset(11).unwrap();
        client.set_offset(0, 42).await.unwrap();
        assert_eq!(svc.offsets()[0].offset_state().borrow().offset, 42);
    }

    #[tokio::test]
    async fn input_instances() {
        let svc = server();
        let mut client = connect(&svc).await;

        let gs = client.input_gain_settings(0).await.unwrap();
        assert_eq!((gs.units, gs.min, gs.max), (1, -20, 20));
        assert_eq!(client.input_type(0).await.unwrap(), InputType::Analog);
        assert_eq!(client.input_description(0).await.unwrap(), "Mic");

        client.set_input_gain(0, 12).await.unwrap();
        client.mute_input(0).await.unwrap();
        client.set_input_automatic_gain(0).await.unwrap();
        let s = *svc.inputs()[0].input_state().borrow();
        assert_eq!((s.gain, s.mute, s.mode), (12, Mute::Muted, Mode::Auto));

        // Out-of-range gain surfaces the service error byte
        assert_eq!(
            client.set_input_gain(0, 127).await,
            Err(Error::Att(ErrorCode::Application(0x83)))
        );
    }

    #[tokio::test]
    async fn notifications_update_mirrors() {
        let svc = server();
        let mut client = connect(&svc).await;

        svc.set_volume(10).unwrap();
        svc.offsets()[0].set_offset(99).unwrap();
        svc.inputs()[0].set_gain(-3).unwrap();
        svc.inputs()[0].deactivate();
        svc.offsets()[1].set_description("Rear Right").unwrap();

        pump(&mut client);
        assert_eq!(client.volume_state().borrow().volume, 10);
        assert_eq!(client.offset(0).unwrap().offset_state().borrow().offset, 99);
        let input = client.input(0).unwrap();
        assert_eq!(input.input_state().borrow().gain, -3);
        assert_eq!(
            *input.status().borrow(),
            crate::gatt::service::aics::InputStatus::Inactive
        );
        assert_eq!(&*client.offset(1).unwrap().description().borrow(), "Rear Right");
    }

    #[tokio::test]
    async fn no_vcs_on_peer() {
        let mut db = Db::build();
        // A database without a Volume Control service
        let svc = crate::gatt::service::csis::CoordinatedSetService::new(
            &crate::gatt::service::csis::CoordinatedSetConfig::default(),
            std::sync::Arc::new(crate::sec::MemoryBonds::new()),
        );
        svc.define(&mut db);
        let (db, io) = db.freeze();
        let peer = Addr::peer(0, [9, 9, 9, 9, 9, 9].into());
        let mut client = VolumeControlClient::new(Loopback::new(db, io, peer));
        assert_eq!(client.discover().await, Err(Error::NotSupported));
    }
}
