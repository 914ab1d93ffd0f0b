//! Remote GATT operations used by the profile clients.
//!
//! The host stack implements [`Gatt`] on top of its ATT bearer. Profile
//! clients drive discovery, reads, and writes through it and receive
//! notifications from the host by value handle.

use murmur_const::{Uuid, Uuid16};

use crate::att::{Handle, HandleRange};
use crate::gatt::Prop;
use crate::Result;

/// Discovered service group.
#[derive(Clone, Copy, Debug)]
pub struct ServiceInfo {
    /// Handle range of the service, starting at the declaration.
    pub range: HandleRange,
}

/// Discovered include declaration.
#[derive(Clone, Copy, Debug)]
pub struct IncludeInfo {
    /// UUID of the included service.
    pub uuid: Uuid,
    /// Handle range of the included service.
    pub range: HandleRange,
}

/// Discovered characteristic.
#[derive(Clone, Copy, Debug)]
pub struct CharacteristicInfo {
    /// Declaration handle.
    pub decl: Handle,
    /// Value handle.
    pub value: Handle,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Characteristic properties.
    pub props: Prop,
}

impl CharacteristicInfo {
    /// Returns the assumed Client Characteristic Configuration descriptor
    /// handle. Descriptor discovery is skipped and the CCC is taken to
    /// immediately follow the value attribute, which holds for every known
    /// audio-control server layout.
    #[inline]
    #[must_use]
    pub fn client_config(&self) -> Option<Handle> {
        self.props
            .intersects(Prop::NOTIFY | Prop::INDICATE)
            .then(|| self.value.next())?
    }
}

/// Callback-free interface to the remote GATT server. Each operation maps to
/// one ATT transaction whose completion resolves the future. A write that
/// fails with an error response resolves to [`crate::Error::Att`] carrying
/// the error byte.
#[allow(async_fn_in_trait)]
pub trait Gatt {
    /// Discovers the first primary service with the specified UUID.
    async fn primary_service(&mut self, uuid: Uuid16) -> Result<Option<ServiceInfo>>;

    /// Discovers the services included by the specified service.
    async fn includes(&mut self, range: HandleRange) -> Result<Vec<IncludeInfo>>;

    /// Discovers all characteristics of the specified service.
    async fn characteristics(&mut self, range: HandleRange) -> Result<Vec<CharacteristicInfo>>;

    /// Reads a characteristic value.
    async fn read(&mut self, hdl: Handle) -> Result<Vec<u8>>;

    /// Writes a characteristic value and awaits the response.
    async fn write(&mut self, hdl: Handle, val: &[u8]) -> Result<()>;

    /// Writes a characteristic value without response.
    async fn write_cmd(&mut self, hdl: Handle, val: &[u8]) -> Result<()>;

    /// Enables notifications by writing the Client Characteristic
    /// Configuration descriptor.
    async fn subscribe(&mut self, ccc: Handle) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod loopback {
    use crate::att::{ErrorCode, Opcode};
    use crate::gatt::{Db, IoMap, NotifyReq, NotifyVal, ReadReq, WriteReq};
    use crate::le::Addr;
    use crate::Error;

    use super::*;

    const MTU: u16 = 247;

    /// In-process client transport that executes operations directly against
    /// a local database and I/O map.
    #[derive(Debug)]
    pub struct Loopback {
        db: Db,
        io: IoMap,
        peer: Addr,
        subs: Vec<(Handle, tokio::sync::mpsc::Receiver<NotifyVal>)>,
    }

    impl Loopback {
        pub fn new(db: Db, io: IoMap, peer: Addr) -> Self {
            Self {
                db,
                io,
                peer,
                subs: Vec::new(),
            }
        }

        pub fn peer(&self) -> Addr {
            self.peer
        }

        /// Drains every queued notification in arrival order.
        pub fn drain(&mut self) -> Vec<(Handle, Vec<u8>)> {
            let mut v = Vec::new();
            for (hdl, rx) in &mut self.subs {
                while let Ok(val) = rx.try_recv() {
                    debug_assert_eq!(val.handle(), *hdl);
                    v.push((*hdl, val.as_ref().to_vec()));
                }
            }
            v
        }

        fn uuid_of(&self, hdl: Handle) -> Result<Uuid> {
            (self.db.get(hdl).map(|(u, _)| u)).ok_or(Error::Att(ErrorCode::InvalidHandle))
        }
    }

    impl Gatt for Loopback {
        async fn primary_service(&mut self, uuid: Uuid16) -> Result<Option<ServiceInfo>> {
            Ok((self.db.primary_services(Handle::new(1).unwrap(), Some(uuid.as_uuid())))
                .next()
                .map(|s| ServiceInfo {
                    range: s.handle_range(),
                }))
        }

        async fn includes(&mut self, range: HandleRange) -> Result<Vec<IncludeInfo>> {
            Ok((self.db.includes(range))
                .map(|inc| IncludeInfo {
                    uuid: inc.include_uuid().map_or_else(
                        || {
                            (self.db.get(inc.include_range().start()))
                                .and_then(|(_, v)| Uuid::try_from(v).ok())
                                .expect("invalid include")
                        },
                        Uuid16::as_uuid,
                    ),
                    range: inc.include_range(),
                })
                .collect())
        }

        async fn characteristics(&mut self, range: HandleRange) -> Result<Vec<CharacteristicInfo>> {
            Ok((self.db.characteristics(range))
                .map(|c| CharacteristicInfo {
                    decl: c.handle(),
                    value: c.value_handle(),
                    uuid: c.uuid(),
                    props: c.properties(),
                })
                .collect())
        }

        async fn read(&mut self, hdl: Handle) -> Result<Vec<u8>> {
            if self.io.contains(hdl) {
                let mut req = ReadReq::new(Opcode::ReadReq, MTU);
                req.with(hdl, self.uuid_of(hdl)?, Some(self.peer), 0);
                self.io.read(&mut req).map_err(Error::Att)?;
                return Ok(req.into_value().as_ref().to_vec());
            }
            (self.db.get(hdl).map(|(_, v)| v.to_vec())).ok_or(Error::Att(ErrorCode::InvalidHandle))
        }

        async fn write(&mut self, hdl: Handle, val: &[u8]) -> Result<()> {
            let req = WriteReq::new(
                Opcode::WriteReq,
                hdl,
                self.uuid_of(hdl)?,
                Some(self.peer),
                0,
                val,
            );
            self.io.write(&req).map_err(Error::Att)
        }

        async fn write_cmd(&mut self, hdl: Handle, val: &[u8]) -> Result<()> {
            let req = WriteReq::new(
                Opcode::WriteCmd,
                hdl,
                self.uuid_of(hdl)?,
                Some(self.peer),
                0,
                val,
            );
            self.io.write(&req).map_err(Error::Att)
        }

        async fn subscribe(&mut self, ccc: Handle) -> Result<()> {
            // The CCC follows the value attribute in every service layout
            // used here
            let vhdl = Handle::new(u16::from(ccc) - 1).ok_or(Error::InvalidArgument)?;
            let (req, rx, _ct) = NotifyReq::new(vhdl, self.uuid_of(vhdl)?, self.peer, MTU);
            self.io.notify(req).map_err(Error::Att)?;
            self.subs.push((vhdl, rx));
            Ok(())
        }
    }
}
