use std::marker::PhantomData;
use std::ops::Range;
use std::{iter, slice};

use tracing::warn;

pub use builder::*;

use murmur_const::{Uuid, Uuid16, UuidVec};

use super::*;

mod builder;

/// Database data index type. `u16` is enough for 3k 128-bit characteristics.
type Idx = u16;

/// Read-only attribute database.
///
/// Describes the service structure, attribute permissions, and stores
/// read-only values. Dynamic values live in the services and are accessed
/// through the [`IoMap`] returned by [`Builder::freeze`].
#[derive(Clone, Debug, Default)]
pub struct Db {
    /// Attribute metadata sorted by handle.
    attr: Box<[Attr]>,
    /// Concatenated attribute values and 128-bit UUIDs.
    data: Box<[u8]>,
}

impl Db {
    /// Creates a new database builder.
    #[inline(always)]
    #[must_use]
    pub fn build() -> Builder<Self> {
        Builder::new()
    }

    /// Returns an iterator over all attributes in handle order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Handle, Uuid, &[u8])> {
        (self.attr.iter()).map(|at| (at.hdl, self.typ(at), self.value(at)))
    }

    /// Returns the type and value of the specified handle or [`None`] if the
    /// handle is invalid. The value will be empty if it's not stored in the
    /// database.
    #[inline]
    #[must_use]
    pub fn get(&self, hdl: Handle) -> Option<(Uuid, &[u8])> {
        (self.try_get(hdl).ok()).map(|at| (self.typ(at), self.value(at)))
    }

    /// Returns an iterator over primary services with optional UUID matching
    /// ([Vol 3] Part G, Section 4.4).
    #[inline]
    pub fn primary_services(
        &self,
        start: Handle,
        uuid: Option<Uuid>,
    ) -> impl Iterator<Item = DbEntry<ServiceDef>> {
        let i = self.try_get(start).map_or_else(|i| i, |at| self.index(at));
        let uuid = uuid.map_or_else(UuidVec::default, UuidVec::new);
        GroupIter::new(self, &self.attr[i..], move |at| {
            at.is_primary_service() && (uuid.is_empty() || self.value(at) == &*uuid)
        })
    }

    /// Returns an iterator over service includes
    /// ([Vol 3] Part G, Section 4.5.1).
    pub fn includes(&self, hdls: HandleRange) -> impl Iterator<Item = DbEntry<IncludeDef>> {
        (self.service_attrs(hdls).iter())
            .map_while(|at| at.is_include().then(|| DbEntry::new(self, at, at.hdl)))
    }

    /// Returns an iterator over service characteristics
    /// ([Vol 3] Part G, Section 4.6.1).
    pub fn characteristics(
        &self,
        hdls: HandleRange,
    ) -> impl Iterator<Item = DbEntry<CharacteristicDef>> {
        GroupIter::new(self, self.service_attrs(hdls), Attr::is_char)
    }

    /// Performs a read/write access permission check for a single handle.
    pub fn try_access(&self, req: Request, hdl: Handle) -> std::result::Result<(), ErrorCode> {
        let Ok(at) = self.try_get(hdl) else {
            warn!("Denied {} for invalid {hdl}", req.op);
            return Err(ErrorCode::InvalidHandle);
        };
        // [Vol 3] Part F, Section 4
        if let Err(e) = at.perms.test(req.ac) {
            warn!("Denied {} to {hdl} due to {e}", req.op);
            return Err(e);
        }
        let Some((props, vhdl)) = self.characteristic_for_attr(at) else {
            return Ok(()); // Permission check passed, no properties to test
        };
        if hdl != vhdl {
            return Ok(()); // Descriptor or declaration access
        }
        // [Vol 3] Part G, Section 3.3.1.1
        let bit = match req.op {
            Opcode::ReadReq => Prop::READ,
            Opcode::WriteReq => Prop::WRITE,
            Opcode::WriteCmd => Prop::WRITE_CMD,
            Opcode::HandleValueNtf => {
                warn!("Denied non-read/write {} for {hdl}", req.op);
                return Err(ErrorCode::RequestNotSupported);
            }
        };
        if !props.contains(bit) {
            let e = if req.ac.typ() == Access::READ {
                ErrorCode::ReadNotPermitted
            } else {
                ErrorCode::WriteNotPermitted
            };
            warn!("Denied {} for {hdl} due to {e} by properties", req.op);
            return Err(e);
        }
        Ok(())
    }

    /// Returns a subset of attributes for one service. The service
    /// declaration is skipped.
    fn service_attrs(&self, hdls: HandleRange) -> &[Attr] {
        let attr = self.subset(hdls).and_then(|s| {
            let attr = if s.first().is_service() {
                &s.attr[1..]
            } else {
                s.attr
            };
            // Handle range cannot cross service boundary
            (!attr.iter().any(Attr::is_service)).then_some(attr)
        });
        attr.unwrap_or_default()
    }

    /// Returns the properties and value handle of the characteristic that
    /// contains the specified attribute.
    fn characteristic_for_attr(&self, at: &Attr) -> Option<(Prop, Handle)> {
        use private::Group;
        let i = self.index(at);
        let decl = self.attr[..=i].iter().rposition(Attr::is_char)?;
        let end = (self.attr[decl + 1..].iter())
            .position(|at| CharacteristicDef::is_next_group(at.typ))
            .map_or(self.attr.len(), |j| decl + 1 + j);
        if end <= i {
            return None; // hdl is not part of a characteristic definition
        }
        let dval = self.value(&self.attr[decl]);
        let props = Prop::from_bits_truncate(*dval.first()?);
        Some((props, value_handle(dval)))
    }

    /// Returns all attributes within the specified handle range or [`None`]
    /// if the handle range is empty.
    fn subset(&self, hdls: HandleRange) -> Option<Subset> {
        let i = self.try_get(hdls.start()).map_or_else(
            |i| (i < self.attr.len()).then_some(i),
            |at| Some(self.index(at)),
        )?;
        let j = (self.try_get(hdls.end()))
            .map_or_else(|j| (j > 0).then_some(j), |at| Some(self.index(at) + 1))?;
        (i < j).then(|| Subset::new(&self.attr, i..j))
    }

    /// Returns the attribute type.
    #[inline]
    fn typ(&self, at: &Attr) -> Uuid {
        at.typ.map_or_else(
            // SAFETY: 128-bit UUIDs are stored in the data array immediately
            // before the value and are never zero.
            || unsafe {
                let i = usize::from(at.val.0) - 16;
                let v: [u8; 16] = self.data[i..i + 16].try_into().unwrap_unchecked();
                Uuid::new_unchecked(u128::from_le_bytes(v))
            },
            Uuid16::as_uuid,
        )
    }
}

/// Operations shared by [`Db`] and [`DbBuilder`].
trait CommonOps {
    /// Returns the attribute metadata.
    fn attr(&self) -> &[Attr];

    /// Returns the attribute value and 128-bit UUID buffer.
    #[must_use]
    fn data(&self) -> &[u8];

    /// Returns the attribute for the specified handle or the index where
    /// that handle can be inserted.
    #[inline]
    fn try_get(&self, hdl: Handle) -> std::result::Result<&Attr, usize> {
        let i = usize::from(hdl) - 1;
        // The attribute can exist at or, if there are gaps, before index `i`.
        // Usually, the 1-based handle value is also the 0-based index.
        let prior = match self.attr().get(i) {
            Some(at) if at.hdl == hdl => return Ok(&self.attr()[i]),
            Some(_) => &self.attr()[..i],
            None => self.attr(),
        };
        (prior.binary_search_by(|at| at.hdl.cmp(&hdl))).map(|i| &prior[i])
    }

    /// Returns the index of `at` in `self.attr()`.
    #[inline(always)]
    fn index(&self, at: &Attr) -> usize {
        // SAFETY: Caller only has access to attributes in self.attr() and
        // `self.attr().as_ptr() <= at`
        unsafe {
            usize::try_from((at as *const Attr).offset_from(self.attr().as_ptr()))
                .unwrap_unchecked()
        }
    }

    /// Returns the attribute value.
    #[inline(always)]
    #[must_use]
    fn value(&self, at: &Attr) -> &[u8] {
        &self.data()[usize::from(at.val.0)..usize::from(at.val.1)]
    }

    /// Returns all attributes of the service group defined by `hdl` or
    /// [`None`] if the handle does not refer to a service.
    fn service_group(&self, hdl: Handle) -> Option<Subset> {
        let Ok(at) = self.try_get(hdl) else {
            return None;
        };
        at.is_service().then(|| {
            let i = self.index(at);
            let j = (self.attr()[i + 1..].iter())
                .position(Attr::is_service)
                .map_or(self.attr().len(), |j| i + 1 + j);
            Subset::new(self.attr(), i..j)
        })
    }
}

impl CommonOps for Db {
    #[inline(always)]
    fn attr(&self) -> &[Attr] {
        &self.attr
    }

    #[inline(always)]
    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Trait implemented by [`ServiceDef`] and [`CharacteristicDef`] markers.
pub trait Group: private::Group {}

impl Group for ServiceDef {}
impl Group for CharacteristicDef {}

/// Database attribute information.
#[derive(Clone, Copy, Debug)]
pub struct DbEntry<'a, T> {
    hdls: HandleRange,
    typ: Uuid,
    val: &'a [u8],
    _marker: PhantomData<T>,
}

impl<'a, T> DbEntry<'a, T> {
    /// Combines information about a database entry.
    #[inline(always)]
    #[must_use]
    fn new(db: &'a Db, at: &Attr, end_hdl: Handle) -> Self {
        Self {
            hdls: HandleRange::new(at.hdl, end_hdl),
            typ: db.typ(at),
            val: db.value(at),
            _marker: PhantomData,
        }
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdls.start()
    }

    /// Returns the attribute value.
    #[inline(always)]
    #[must_use]
    pub const fn value(&self) -> &'a [u8] {
        self.val
    }
}

impl<T: Group> DbEntry<'_, T> {
    /// Returns the group handle range.
    #[inline(always)]
    pub const fn handle_range(&self) -> HandleRange {
        self.hdls
    }

    /// Returns the service or characteristic UUID.
    #[inline]
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        use private::Group;
        Uuid::try_from(&self.val[T::UUID_OFF..]).expect("invalid declaration")
    }
}

impl DbEntry<'_, CharacteristicDef> {
    /// Returns the characteristic properties.
    #[inline]
    #[must_use]
    pub fn properties(&self) -> Prop {
        Prop::from_bits_truncate(self.val[0])
    }

    /// Returns the handle of the value attribute.
    #[inline]
    #[must_use]
    pub fn value_handle(&self) -> Handle {
        value_handle(self.val)
    }
}

impl DbEntry<'_, IncludeDef> {
    /// Returns the handle range of the included service.
    #[inline]
    #[must_use]
    pub fn include_range(&self) -> HandleRange {
        let start = u16::from_le_bytes([self.val[0], self.val[1]]);
        let end = u16::from_le_bytes([self.val[2], self.val[3]]);
        HandleRange::new(
            Handle::new(start).expect("invalid include"),
            Handle::new(end).expect("invalid include"),
        )
    }

    /// Returns the 16-bit UUID of the included service, if stored in the
    /// declaration.
    #[inline]
    #[must_use]
    pub fn include_uuid(&self) -> Option<Uuid16> {
        (self.val.len() >= 6).then(|| Uuid16::new(u16::from_le_bytes([self.val[4], self.val[5]])))?
    }
}

/// Attribute entry. `val` contains start and end indices of the attribute
/// value in the data array. If `typ` is [`None`], then the 128-bit UUID is
/// stored at `val.0 - 16..val.0` in the data array.
#[derive(Clone, Copy, Debug)]
#[must_use]
struct Attr {
    hdl: Handle,
    typ: Option<Uuid16>,
    val: (Idx, Idx),
    perms: Perms,
}

impl Attr {
    /// Returns whether the attribute is a service declaration.
    #[inline(always)]
    const fn is_service(&self) -> bool {
        matches!(
            self.typ,
            Some(Declaration::PRIMARY_SERVICE | Declaration::SECONDARY_SERVICE)
        )
    }

    /// Returns whether the attribute is a primary service declaration.
    #[inline(always)]
    const fn is_primary_service(&self) -> bool {
        matches!(self.typ, Some(Declaration::PRIMARY_SERVICE))
    }

    /// Returns whether the attribute is an include declaration.
    #[inline(always)]
    const fn is_include(&self) -> bool {
        matches!(self.typ, Some(Declaration::INCLUDE))
    }

    /// Returns whether the attribute is a characteristic declaration.
    #[inline(always)]
    const fn is_char(&self) -> bool {
        matches!(self.typ, Some(Declaration::CHARACTERISTIC))
    }

    /// Returns the attribute value length.
    #[inline(always)]
    const fn len(&self) -> usize {
        self.val.1 as usize - self.val.0 as usize
    }
}

/// A non-empty subset of attributes.
#[derive(Clone, Copy, Debug)]
struct Subset<'a> {
    off: usize,
    attr: &'a [Attr],
}

impl<'a> Subset<'a> {
    /// Creates a new subset of attributes.
    #[inline(always)]
    fn new(attr: &[Attr], r: Range<usize>) -> Subset {
        debug_assert!(!r.is_empty() && r.end <= attr.len());
        Subset {
            off: r.start,
            attr: &attr[r],
        }
    }

    /// Returns the first attribute.
    #[inline(always)]
    fn first(&self) -> &'a Attr {
        &self.attr[0]
    }

    /// Returns the last attribute.
    #[inline(always)]
    fn last(&self) -> &'a Attr {
        &self.attr[self.attr.len() - 1]
    }
}

struct GroupIter<'a, T, F> {
    db: &'a Db,
    it: iter::Peekable<slice::Iter<'a, Attr>>,
    is_start: F,
    _marker: PhantomData<T>,
}

impl<'a, T: Group, F: Fn(&Attr) -> bool> GroupIter<'a, T, F> {
    /// Creates a new attribute group iterator.
    #[inline(always)]
    #[must_use]
    fn new(db: &'a Db, it: &'a [Attr], is_start: F) -> Self {
        Self {
            db,
            it: it.iter().peekable(),
            is_start,
            _marker: PhantomData,
        }
    }
}

impl<'a, T: Group, F: Fn(&Attr) -> bool> Iterator for GroupIter<'a, T, F> {
    type Item = DbEntry<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        use private::Group;
        let decl = self.it.find(|at| (self.is_start)(at))?;
        let mut end = decl.hdl;
        while !self.it.peek().map_or(true, |at| T::is_next_group(at.typ)) {
            // SAFETY: `peek()` returned another attribute
            end = unsafe { self.it.next().unwrap_unchecked().hdl };
        }
        Some(DbEntry::new(self.db, decl, end))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.it.size_hint()
    }
}

impl<T: Group, F: Fn(&Attr) -> bool> iter::FusedIterator for GroupIter<'_, T, F> {}

/// Returns the characteristic value attribute handle from the value of the
/// characteristic declaration.
#[inline]
fn value_handle(decl: &[u8]) -> Handle {
    Handle::new(u16::from_le_bytes([decl[1], decl[2]])).unwrap_or(Handle::MAX)
}

use murmur_const::Declaration;

mod private {
    use murmur_const::{Declaration, Uuid16};

    use super::{CharacteristicDef, IncludeDef, ServiceDef};

    /// Sealed implementation of an attribute group.
    pub trait Group {
        /// Offset of the UUID in the declaration value.
        const UUID_OFF: usize = 0;

        /// Returns whether the specified attribute type is not part of the
        /// current group.
        #[inline(always)]
        #[must_use]
        fn is_next_group(typ: Option<Uuid16>) -> bool {
            matches!(
                typ,
                Some(Declaration::PRIMARY_SERVICE | Declaration::SECONDARY_SERVICE)
            )
        }
    }

    impl Group for ServiceDef {}

    impl Group for IncludeDef {}

    impl Group for CharacteristicDef {
        const UUID_OFF: usize = 3;

        #[inline(always)]
        fn is_next_group(typ: Option<Uuid16>) -> bool {
            matches!(
                typ,
                Some(
                    Declaration::PRIMARY_SERVICE
                        | Declaration::SECONDARY_SERVICE
                        | Declaration::INCLUDE
                        | Declaration::CHARACTERISTIC
                )
            )
        }
    }
}
