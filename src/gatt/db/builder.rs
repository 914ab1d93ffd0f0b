use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use bitflags::bitflags;
use structbuf::{Pack, Packer, StructBuf};

use murmur_const::{Uuid, Uuid16, UuidPacker, UuidType};

use super::*;

/// Database service definition marker type.
#[derive(Debug)]
pub struct ServiceDef;

/// Database characteristic definition marker type.
#[derive(Debug)]
pub struct CharacteristicDef;

/// Database include definition marker type.
#[derive(Debug)]
pub struct IncludeDef;

/// Database descriptor definition marker type.
#[derive(Debug)]
pub struct DescriptorDef;

/// Database builder used to define services, characteristics, and
/// descriptors.
#[derive(Debug)]
#[repr(transparent)]
pub struct Builder<T>(DbBuilder, PhantomData<T>);

impl<T> Builder<T> {
    /// Creates a generic attribute with an externally stored value.
    fn attr(&mut self, typ: Uuid, perms: Perms) -> Handle {
        let typ16 = typ.as_uuid16();
        if typ16.is_none() {
            self.append_data(u128::from(typ).to_le_bytes());
        }
        let hdl = self.next_handle();
        self.append_attr(hdl, typ16, perms)
    }
}

impl<T> Deref for Builder<T> {
    type Target = DbBuilder;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Builder<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Builder<Db> {
    /// Creates a new database builder.
    #[inline]
    #[must_use]
    pub(super) fn new() -> Self {
        Self(
            DbBuilder {
                attr: Vec::with_capacity(64),
                data: Vec::with_capacity(256),
                ..DbBuilder::default()
            },
            PhantomData,
        )
    }

    /// Returns the final read-only database and I/O map.
    #[inline]
    #[must_use]
    pub fn freeze(self) -> (Db, IoMap) {
        (
            Db {
                attr: self.0.attr.into_boxed_slice(),
                data: self.0.data.into_boxed_slice(),
            },
            IoMap(self.0.io),
        )
    }

    /// Defines a primary service ([Vol 3] Part G, Section 3.1).
    ///
    /// Included services must be defined before the service that references
    /// them.
    #[inline]
    pub fn primary_service<T>(
        &mut self,
        uuid: impl Into<Uuid>,
        include: impl AsRef<[Handle]>,
        chars: impl FnOnce(&mut Builder<ServiceDef>) -> T,
    ) -> (Handle, T) {
        let hdl = self.service(Declaration::PrimaryService, uuid.into(), include.as_ref());
        (hdl, chars(self.builder()))
    }

    /// Defines a secondary service ([Vol 3] Part G, Section 3.1).
    #[inline]
    pub fn secondary_service<T>(
        &mut self,
        uuid: impl Into<Uuid>,
        include: impl AsRef<[Handle]>,
        chars: impl FnOnce(&mut Builder<ServiceDef>) -> T,
    ) -> (Handle, T) {
        let hdl = self.service(Declaration::SecondaryService, uuid.into(), include.as_ref());
        (hdl, chars(self.builder()))
    }

    /// Declares a primary or secondary service and any included services
    /// ([Vol 3] Part G, Section 3.2).
    fn service(&mut self, typ: Declaration, uuid: Uuid, include: &[Handle]) -> Handle {
        if let Some((UuidType::Service(s), uuid16)) = uuid.as_uuid16().map(|u| (u.typ(), u)) {
            assert!(
                s.multi_instance() || !self.attr.iter().any(|at| at.typ == Some(uuid16)),
                "only one instance of the {s} service is allowed"
            );
        }
        let hdl = self.decl(typ, |v| v.uuid(uuid));
        for &inc in include {
            let s = self.service_group(inc).expect("invalid service handle");
            let uuid = (s.first().len() == 2)
                .then(|| u16::from_le_bytes(self.value(s.first()).try_into().unwrap()));
            let end = s.last().hdl;
            self.decl(Declaration::Include, |v| {
                v.u16(inc).u16(end);
                uuid.map(|u| v.u16(u));
            });
        }
        hdl
    }
}

impl Builder<ServiceDef> {
    /// Defines a single-value characteristic ([Vol 3] Part G, Section 3.3).
    ///
    /// Mandatory service characteristics must precede optional ones and
    /// 16-bit UUID characteristics should precede 128-bit ones.
    #[inline]
    pub fn characteristic<T>(
        &mut self,
        uuid: impl Into<Uuid>,
        props: Prop,
        perms: impl Into<Perms>,
        io: impl Into<Io>,
        descs: impl FnOnce(&mut Builder<CharacteristicDef>) -> T,
    ) -> (Handle, T) {
        let hdl = self.decl_value(uuid.into(), props, perms.into());
        self.io.insert(hdl, io.into());
        self.flag = Bld::empty();
        let v = descs(self.0.builder());
        (hdl, v)
    }

    /// Defines a read-only characteristic with a database-stored value
    /// ([Vol 3] Part G, Section 3.3).
    #[inline]
    pub fn ro_characteristic<T>(
        &mut self,
        uuid: impl Into<Uuid>,
        perms: impl Into<Perms>,
        val: impl AsRef<[u8]>,
        descs: impl FnOnce(&mut Builder<CharacteristicDef>) -> T,
    ) -> T {
        self.decl_value(uuid.into(), Prop::READ, perms.into());
        self.append_val(val);
        self.flag = Bld::empty();
        descs(self.0.builder())
    }

    /// Adds characteristic and characteristic value declarations.
    fn decl_value(&mut self, uuid: Uuid, props: Prop, perms: Perms) -> Handle {
        let val_hdl = self.next_handle().next().expect("maximum handle reached");
        self.decl(Declaration::Characteristic, |v| {
            v.u8(props.bits()).u16(val_hdl).uuid(uuid);
        });
        self.append_attr(val_hdl, uuid.as_uuid16(), perms)
    }
}

impl Builder<CharacteristicDef> {
    /// Declares a non-GATT profile characteristic descriptor
    /// ([Vol 3] Part G, Section 3.3.3).
    #[inline]
    pub fn descriptor(
        &mut self,
        uuid: impl Into<Uuid>,
        perms: impl Into<Perms>,
        io: impl Into<Io>,
    ) -> Handle {
        let hdl = self.attr(uuid.into(), perms.into());
        self.io.insert(hdl, io.into());
        hdl
    }

    /// Declares a read-only characteristic descriptor with the value stored
    /// in the database ([Vol 3] Part G, Section 3.3.3).
    #[inline]
    pub fn ro_descriptor(&mut self, uuid: impl Into<Uuid>, perms: impl Into<Perms>, val: impl AsRef<[u8]>) {
        self.attr(uuid.into(), perms.into());
        self.append_val(val);
    }

    /// Declares a Client Characteristic Configuration descriptor
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[inline]
    pub fn cccd(&mut self, perms: impl Into<Perms>) -> Handle {
        assert!(
            !self.flag.contains(Bld::HAVE_CCCD),
            "descriptor already exists"
        );
        self.flag.insert(Bld::HAVE_CCCD);
        self.attr(
            Descriptor::ClientCharacteristicConfiguration.uuid(),
            perms.into(),
        )
    }
}

bitflags! {
    /// Builder flags.
    #[derive(Default)]
    #[repr(transparent)]
    struct Bld: u8 {
        const HAVE_CCCD = 1 << 0;
    }
}

/// Shared [`Db`] builder state.
#[derive(Debug, Default)]
pub struct DbBuilder {
    attr: Vec<Attr>,
    data: Vec<u8>,
    io: BTreeMap<Handle, Io>,
    flag: Bld,
}

impl DbBuilder {
    /// Creates a read-only GATT profile declaration with value set by `val`.
    #[inline]
    fn decl(&mut self, typ: impl Into<Uuid16>, val: impl FnOnce(&mut Packer)) -> Handle {
        // Maximum length of the Characteristic declaration value, which is
        // the longest value stored in the database
        // ([Vol 3] Part G, Section 3.3.1).
        let mut b = StructBuf::new(1 + 2 + 16);
        val(&mut b.append());
        let hdl = self.next_handle();
        let val = self.append_data(&b);
        self.attr.push(Attr {
            hdl,
            typ: Some(typ.into()),
            val,
            perms: Perms::new(Access::READ),
        });
        hdl
    }

    /// Returns the next unused handle.
    #[inline]
    fn next_handle(&self) -> Handle {
        self.attr.last().map_or(Handle::MIN, |at| {
            at.hdl.next().expect("maximum handle reached")
        })
    }

    /// Appends a new attribute entry. If `typ == None`, then the last 16
    /// data bytes must contain the 128-bit UUID.
    #[inline]
    fn append_attr(&mut self, hdl: Handle, typ: Option<Uuid16>, perms: Perms) -> Handle {
        #[allow(clippy::cast_possible_truncation)]
        let i = match typ {
            None => self.data.len() as Idx,
            Some(_) => 0,
        };
        self.attr.push(Attr {
            hdl,
            typ,
            val: (i, i),
            perms,
        });
        hdl
    }

    /// Appends a read-only value for the last attribute entry.
    #[inline]
    fn append_val(&mut self, v: impl AsRef<[u8]>) {
        self.attr.last_mut().expect("empty database").val = self.append_data(v);
    }

    /// Appends `v` to the database and returns the resulting index range.
    #[inline]
    fn append_data(&mut self, v: impl AsRef<[u8]>) -> (Idx, Idx) {
        #[allow(clippy::cast_possible_truncation)]
        let start = self.data.len() as Idx;
        self.data.extend_from_slice(v.as_ref());
        let end = Idx::try_from(self.data.len())
            .expect("database data overflow (see Idx type in gatt/db.rs)");
        (start, end)
    }

    /// Returns a new builder.
    #[inline(always)]
    fn builder<T>(&mut self) -> &mut Builder<T> {
        // SAFETY: Builder is a `repr(transparent)` newtype
        unsafe { &mut *(self as *mut Self).cast() }
    }
}

impl CommonOps for DbBuilder {
    #[inline(always)]
    fn attr(&self) -> &[Attr] {
        &self.attr
    }

    #[inline(always)]
    fn data(&self) -> &[u8] {
        &self.data
    }
}

use murmur_const::Descriptor;

#[cfg(test)]
mod tests {
    use murmur_const::{Characteristic, Service};

    use super::*;

    #[test]
    fn service_group() {
        fn eq(b: &DbBuilder, h: Handle, r: Range<usize>) {
            let s = b.service_group(h).unwrap();
            assert_eq!(s.off..s.off + s.attr.len(), r);
        }

        let mut db = Db::build();
        let (h1, _) = db.secondary_service(Service::AudioInputControl, [], |_| {});
        let (h2, _) = db.primary_service(Service::VolumeControl, [h1], |_| {});
        eq(&db, h1, 0..1);
        eq(&db, h2, 1..3);

        let (h3, _) = db.primary_service(Service::CoordinatedSetIdentification, [], |_| {});
        eq(&db, h2, 1..3);
        eq(&db, h3, 3..4);
    }

    #[test]
    #[should_panic(expected = "only one instance")]
    fn single_instance() {
        let mut db = Db::build();
        db.primary_service(Service::VolumeControl, [], |_| {});
        db.primary_service(Service::VolumeControl, [], |_| {});
    }

    #[test]
    fn handles_are_sequential() {
        let mut db = Db::build();
        let (svc, (val, ccc)) = db.primary_service(Service::VolumeControl, [], |db| {
            db.characteristic(
                Characteristic::VolumeState,
                Prop::READ | Prop::NOTIFY,
                Access::READ.encrypt(),
                Io::NONE,
                |db| db.cccd(Access::READ | Access::WRITE.encrypt()),
            )
        });
        assert_eq!(u16::from(svc), 1);
        assert_eq!(u16::from(val), 3); // Value handle follows the declaration
        assert_eq!(u16::from(ccc), 4);
    }
}
