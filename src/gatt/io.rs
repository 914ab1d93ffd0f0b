use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use structbuf::{Pack, Packer, StructBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use murmur_const::Uuid;

use crate::le::Addr;
use crate::name_of;

use super::*;

/// I/O callback result type.
pub type IoResult = std::result::Result<(), ErrorCode>;

/// Characteristic or descriptor I/O callback.
#[derive(Clone)]
#[repr(transparent)]
pub struct Io(Arc<dyn for<'a> Fn(IoReq<'a>) -> IoResult + Send + Sync>);

impl Io {
    pub const NONE: () = ();

    /// Returns an I/O callback for a method of `T`.
    #[inline(always)]
    pub fn with<T: Send + Sync + 'static>(
        this: &Arc<T>,
        f: impl Fn(&T, IoReq) -> IoResult + Send + Sync + 'static,
    ) -> Self {
        let this = Arc::clone(this);
        Self(Arc::new(move |req: IoReq| f(&this, req)))
    }
}

impl Debug for Io {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_tuple(name_of!(Io)).field(&Arc::as_ptr(&self.0))).finish()
    }
}

impl<T: Fn(IoReq) -> IoResult + Send + Sync + 'static> From<T> for Io {
    #[inline(always)]
    fn from(f: T) -> Self {
        Self(Arc::new(f))
    }
}

#[doc(hidden)]
impl From<()> for Io {
    fn from(_: ()) -> Self {
        Self(Arc::new(|_: IoReq| unreachable!()))
    }
}

/// Map of value handles to their I/O callbacks.
#[derive(Debug, Default)]
pub struct IoMap(pub(in crate::gatt) BTreeMap<Handle, Io>);

impl IoMap {
    /// Executes a read request.
    #[inline(always)]
    pub fn read(&self, r: &mut ReadReq) -> IoResult {
        self.exec(r.hdl, IoReq::Read(r))
    }

    /// Executes a write request.
    #[inline(always)]
    pub fn write(&self, w: &WriteReq) -> IoResult {
        self.exec(w.hdl, IoReq::Write(w))
    }

    /// Executes a notify request.
    #[inline(always)]
    pub fn notify(&self, n: NotifyReq) -> IoResult {
        self.exec(n.hdl, IoReq::Notify(n))
    }

    /// Returns whether the handle has an I/O callback.
    #[inline(always)]
    #[must_use]
    pub fn contains(&self, hdl: Handle) -> bool {
        self.0.contains_key(&hdl)
    }

    /// Executes the specified request.
    #[inline]
    fn exec(&self, hdl: Handle, req: IoReq) -> IoResult {
        (self.0.get(&hdl).ok_or(ErrorCode::UnlikelyError)).and_then(|io| io.0(req))
    }
}

/// Characteristic or descriptor I/O request.
#[derive(Debug)]
#[non_exhaustive]
pub enum IoReq<'a> {
    Read(&'a mut ReadReq),
    Write(&'a WriteReq<'a>),
    Notify(NotifyReq),
}

/// Server characteristic or descriptor read request.
#[derive(Debug)]
pub struct ReadReq {
    pub(in crate::gatt) op: Opcode,
    pub(in crate::gatt) hdl: Handle,
    pub(in crate::gatt) uuid: Option<Uuid>,
    pub(in crate::gatt) peer: Option<Addr>,
    pub(in crate::gatt) off: u16,
    pub(in crate::gatt) buf: StructBuf,
}

impl ReadReq {
    /// Creates a new read request.
    #[inline(always)]
    #[must_use]
    pub const fn new(op: Opcode, mtu: u16) -> Self {
        Self {
            op,
            hdl: Handle::MAX,
            uuid: None,
            peer: None,
            off: 0,
            buf: StructBuf::new(mtu as _),
        }
    }

    /// Sets request parameters.
    #[inline(always)]
    pub fn with(&mut self, hdl: Handle, uuid: Uuid, peer: Option<Addr>, off: u16) -> &mut Self {
        self.hdl = hdl;
        self.uuid = Some(uuid);
        self.peer = peer;
        self.off = off;
        self.buf.clear();
        self
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the attribute UUID.
    #[inline(always)]
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid.expect("request parameters not set")
    }

    /// Returns the peer making the request or [`None`] for a server-local
    /// read.
    #[inline(always)]
    #[must_use]
    pub const fn peer(&self) -> Option<Addr> {
        self.peer
    }

    /// Returns the value offset.
    #[inline(always)]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.off as _
    }

    /// Provides the complete attribute value with automatic offset and MTU
    /// handling.
    #[inline]
    pub fn complete(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        self.partial((v.as_ref().get(self.offset()..)).ok_or(ErrorCode::InvalidOffset)?)
    }

    /// Provides the attribute value starting at the requested offset. The
    /// value may be truncated to fit within the MTU.
    #[inline]
    pub fn partial(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        let v = v.as_ref();
        self.buf.clear();
        self.buf.put_at(0, &v[..v.len().min(self.buf.lim())]);
        Ok(())
    }

    /// Consumes the request and returns the value buffer.
    #[inline(always)]
    #[must_use]
    pub fn into_value(self) -> StructBuf {
        self.buf
    }
}

/// Server characteristic or descriptor write request.
#[derive(Debug)]
pub struct WriteReq<'a> {
    pub(in crate::gatt) op: Opcode,
    pub(in crate::gatt) hdl: Handle,
    pub(in crate::gatt) uuid: Uuid,
    pub(in crate::gatt) peer: Option<Addr>,
    pub(in crate::gatt) off: u16,
    pub(in crate::gatt) val: &'a [u8],
}

impl<'a> WriteReq<'a> {
    /// Creates a new write request. `peer` is [`None`] for a server-local
    /// write that re-enters the same handler as writes from remote clients.
    #[inline(always)]
    #[must_use]
    pub const fn new(
        op: Opcode,
        hdl: Handle,
        uuid: Uuid,
        peer: Option<Addr>,
        off: u16,
        val: &'a [u8],
    ) -> Self {
        Self {
            op,
            hdl,
            uuid,
            peer,
            off,
            val,
        }
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the attribute UUID.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the peer making the request or [`None`] for a server-local
    /// write.
    #[inline(always)]
    #[must_use]
    pub const fn peer(&self) -> Option<Addr> {
        self.peer
    }

    /// Returns the value offset.
    #[inline(always)]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.off as _
    }

    /// Returns the value to be written at the specified offset.
    #[inline(always)]
    #[must_use]
    pub const fn value(&self) -> &'a [u8] {
        self.val
    }

    /// Updates `dst` with the written value. Returns either `InvalidOffset`
    /// or `InvalidAttributeValueLength` if the written value is not a
    /// subslice of `dst`.
    #[inline]
    pub fn update(&self, mut dst: impl AsMut<[u8]>) -> IoResult {
        let Some(dst) = dst.as_mut().get_mut(self.off as usize..) else {
            return Err(ErrorCode::InvalidOffset);
        };
        let Some(dst) = dst.get_mut(..self.val.len()) else {
            return Err(ErrorCode::InvalidAttributeValueLength);
        };
        dst.copy_from_slice(self.val);
        Ok(())
    }
}

impl<'a> AsRef<[u8]> for WriteReq<'a> {
    #[inline(always)]
    fn as_ref(&self) -> &'a [u8] {
        self.val
    }
}

/// Server characteristic notification session. The receiver is expected to
/// keep this request and use it to notify the client of characteristic value
/// changes. Values are queued for transmission in commit order; the host
/// drains the queue and sends `ATT_HANDLE_VALUE_NTF` PDUs.
#[derive(Debug)]
pub struct NotifyReq {
    pub(in crate::gatt) hdl: Handle,
    pub(in crate::gatt) uuid: Uuid,
    pub(in crate::gatt) peer: Addr,
    pub(in crate::gatt) mtu: u16,
    pub(in crate::gatt) tx: tokio::sync::mpsc::Sender<NotifyVal>,
    pub(in crate::gatt) ct: CancellationToken,
}

impl NotifyReq {
    /// Queue capacity per session. A slow host loses intermediate values,
    /// never their order.
    const QUEUE: usize = 16;

    /// Creates a new notification session. The returned receiver yields the
    /// queued values and the token closes the session when cancelled.
    #[must_use]
    pub fn new(
        hdl: Handle,
        uuid: Uuid,
        peer: Addr,
        mtu: u16,
    ) -> (Self, tokio::sync::mpsc::Receiver<NotifyVal>, CancellationToken) {
        let (tx, rx) = tokio::sync::mpsc::channel(Self::QUEUE);
        let ct = CancellationToken::new();
        (
            Self {
                hdl,
                uuid,
                peer,
                mtu,
                tx,
                ct: ct.clone(),
            },
            rx,
            ct,
        )
    }

    /// Returns the characteristic value handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the characteristic value UUID.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the subscribed peer.
    #[inline(always)]
    #[must_use]
    pub const fn peer(&self) -> Addr {
        self.peer
    }

    /// Calls `f` to provide the updated characteristic value and queues it
    /// for transmission. The value is dropped if the session is closed or the
    /// queue is full.
    pub fn notify(&self, f: impl FnOnce(&mut Packer)) -> IoResult {
        if self.is_closed() {
            return Err(ErrorCode::UnlikelyError);
        }
        let mut val = StructBuf::new(usize::from(self.mtu) - 3);
        f(&mut val.append());
        if let Err(e) = self.tx.try_send(NotifyVal { hdl: self.hdl, val }) {
            debug!("Notification dropped for {} {}: {e}", self.uuid, self.hdl);
        }
        Ok(())
    }

    /// Returns whether the notification session is closed.
    #[inline(always)]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ct.is_cancelled()
    }
}

impl Drop for NotifyReq {
    fn drop(&mut self) {
        if !self.ct.is_cancelled() {
            debug!(
                "Service cancelled notify request for {} {}",
                self.uuid.typ(),
                self.hdl
            );
            self.ct.cancel();
        }
    }
}

/// Queued characteristic notification value.
#[derive(Debug)]
pub struct NotifyVal {
    hdl: Handle,
    val: StructBuf,
}

impl NotifyVal {
    /// Returns the characteristic value handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }
}

impl AsRef<[u8]> for NotifyVal {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.val.as_ref()
    }
}
