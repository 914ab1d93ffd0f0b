//! Coordinated Set Identification Service (\[CSIS\]).
//!
//! Identifies this device as a member of a coordinated set and arbitrates an
//! exclusive, timed set lock between clients. Bonded peers that miss a lock
//! change while disconnected are renotified after their next security
//! elevation.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_const::{Characteristic, Service};
use murmur_crypto::{Key, Psri, Sirk};

use crate::att::{Access, ErrorCode};
use crate::gatt::{Builder, Db, Io, IoReq, IoResult, NotifyReq, Prop};
use crate::le::Addr;
use crate::sec::BondStore;
use crate::{Error, Result, SyncMutex};

/// Resolvable Set Identifier advertising data type.
pub const RSI_AD_TYPE: u8 = 0x2E;

/// Inactivity timeout after which a held lock is force-released.
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Key used to derive set keys from a shared seed. It must be identical for
/// every device in the set.
const SIRK_GEN_KEY: Key = Key::from_le_bytes([
    0x92, 0x5f, 0xcb, 0xcb, 0x8a, 0xa8, 0x96, 0xe9, 0x3e, 0x62, 0x01, 0x54, 0xf9, 0xad, 0xef,
    0x54,
]);

/// Set Member Lock characteristic values (\[CSIS\] Section 2.4).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum SetLock {
    Released = 0x01,
    Locked = 0x02,
}

/// Service error codes sent over ATT (\[CSIS\] Section 1.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum LockError {
    LockDenied = 0x82,
    LockReleaseDenied = 0x83,
    InvalidLockValue = 0x84,
}

impl From<LockError> for ErrorCode {
    #[inline(always)]
    fn from(e: LockError) -> Self {
        Self::Application(e.into())
    }
}

crate::impl_display_via_debug! { SetLock, LockError }

/// Service configuration.
#[derive(Clone, Debug)]
pub struct CoordinatedSetConfig {
    /// Seed shared by the set; the set key is derived from it.
    pub seed: u32,
    /// Explicit set key, overriding `seed`. Used for interoperability test
    /// vectors.
    pub sirk: Option<Sirk>,
    /// Number of devices in the set.
    pub set_size: u8,
    /// This device's rank within the set.
    pub rank: u8,
    /// Resolvable private address rotation period. Advertising rounds are
    /// kept shorter so the identifier rotates with the address.
    pub rpa_timeout: Duration,
    /// Evict the least recently bonded peer when the notification table is
    /// full. When disabled, new bonds are silently dropped from the table.
    pub overwrite_oldest: bool,
    /// Capacity of the bonded-peer notification table.
    pub max_bonded: usize,
    /// Whether the host accepts new bonds. A non-bondable device requires an
    /// authenticated link to read the set key.
    pub bondable: bool,
}

impl Default for CoordinatedSetConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            sirk: None,
            set_size: 2,
            rank: 1,
            rpa_timeout: Duration::from_secs(900),
            overwrite_oldest: true,
            max_bonded: 8,
            bondable: true,
        }
    }
}

/// Advertising payload and timing for one advertising round.
#[derive(Clone, Debug)]
pub struct Advertisement {
    /// Complete advertising data: flags followed by the resolvable set
    /// identifier.
    pub data: Vec<u8>,
    /// Advertising duration before the identifier must be regenerated.
    pub duration: Duration,
}

/// Coordinated Set Identification service.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct CoordinatedSetService(Arc<SyncMutex<Inst>>);

impl CoordinatedSetService {
    /// Creates the service.
    #[must_use]
    pub fn new(c: &CoordinatedSetConfig, bonds: Arc<dyn BondStore>) -> Self {
        let sirk = (c.sirk.clone()).unwrap_or_else(|| Sirk::derive(&SIRK_GEN_KEY, c.seed));
        let (locked_w, _) = watch::channel(false);
        Self(Arc::new_cyclic(|weak| {
            SyncMutex::new(Inst {
                weak: Weak::clone(weak),
                sirk,
                set_size: c.set_size,
                rank: c.rank,
                lock: SetLock::Released,
                holder: None,
                timer: None,
                pend: Vec::with_capacity(c.max_bonded),
                cap: c.max_bonded,
                age_counter: 0,
                overwrite_oldest: c.overwrite_oldest,
                rpa_timeout: c.rpa_timeout,
                bondable: c.bondable,
                bonds,
                ntf: BTreeMap::new(),
                locked_w,
            })
        }))
    }

    /// Defines the service structure.
    pub fn define(&self, db: &mut Builder<Db>) {
        const RO: Access = Access::READ.encrypt();
        const WO: Access = Access::WRITE.encrypt();
        let ccc = Access::READ | WO;
        let inst = self.0.lock();
        let sirk_perm = if inst.bondable { RO } else { RO.authn() };
        let (sirk, set_size, rank) = (inst.sirk.to_bytes(), inst.set_size, inst.rank);
        drop(inst);
        db.primary_service(Service::CoordinatedSetIdentification, [], |db| {
            use Characteristic::*;
            db.ro_characteristic(SetIdentityResolvingKey, sirk_perm, sirk, |_| {});
            db.ro_characteristic(CoordinatedSetSize, RO, [set_size], |_| {});
            db.characteristic(
                SetMemberLock,
                Prop::READ | Prop::WRITE | Prop::NOTIFY,
                RO | WO,
                Io::with(&self.0, |t, req| t.lock().lock_io(req)),
                |db| {
                    db.cccd(ccc);
                },
            );
            db.ro_characteristic(SetMemberRank, RO, [rank], |_| {});
        });
    }

    /// Returns a watch receiver reflecting the lock state.
    #[inline]
    #[must_use]
    pub fn locked(&self) -> watch::Receiver<bool> {
        self.0.lock().locked_w.subscribe()
    }

    /// Returns the set key.
    #[inline]
    #[must_use]
    pub fn sirk(&self) -> Sirk {
        self.0.lock().sirk.clone()
    }

    /// Returns whether `psri` identifies a member of the set with the
    /// specified key.
    #[inline]
    #[must_use]
    pub fn matches(sirk: &Sirk, psri: Psri) -> bool {
        psri.resolve(sirk)
    }

    /// Builds the advertising payload for the next round with a freshly
    /// generated set identifier.
    #[must_use]
    pub fn advertisement(&self) -> Advertisement {
        let inst = self.0.lock();
        let psri = Psri::new(&inst.sirk);
        let mut data = Vec::with_capacity(3 + 2 + Psri::BYTES);
        // Flags: LE General Discoverable, BR/EDR Not Supported
        data.extend_from_slice(&[0x02, 0x01, 0x06]);
        #[allow(clippy::cast_possible_truncation)]
        data.push(1 + Psri::BYTES as u8);
        data.push(RSI_AD_TYPE);
        data.extend_from_slice(psri.as_ref());
        Advertisement {
            data,
            // Rotate ahead of the private address
            duration: inst.rpa_timeout * 9 / 10,
        }
    }

    /// Takes the set lock locally through the same path as a client write.
    pub fn lock(&self) -> Result<()> {
        (self.0.lock().write_lock(None, 0, &[SetLock::Locked.into()])).map_err(Error::Att)
    }

    /// Releases the set lock. A forced release succeeds regardless of which
    /// peer holds the lock and notifies every subscribed peer.
    pub fn release(&self, force: bool) -> Result<()> {
        let mut inst = self.0.lock();
        if force {
            inst.cancel_timer();
            if inst.lock == SetLock::Locked {
                inst.holder = None;
                inst.force_release();
            }
            Ok(())
        } else {
            (inst.write_lock(None, 0, &[SetLock::Released.into()])).map_err(Error::Att)
        }
    }

    /// Handles a peer disconnect. A lock held by a non-bonded peer is
    /// released so the set is not stranded.
    pub fn disconnected(&self, peer: Addr) {
        let mut inst = self.0.lock();
        inst.ntf.remove(&peer);
        if inst.bonds.is_bonded(peer) {
            return;
        }
        debug!("Non-bonded {peer} disconnected");
        if inst.lock == SetLock::Locked && inst.holder == Some(peer) {
            inst.cancel_timer();
            inst.holder = None;
            inst.force_release();
        }
        // Forget a previously tracked bond for this address
        if let Some(e) = inst.pend.iter_mut().find(|e| e.addr == peer) {
            *e = PendEntry::default();
        }
    }

    /// Handles a security elevation, delivering a lock notification that the
    /// peer missed while disconnected.
    pub fn security_changed(&self, peer: Addr) {
        let mut inst = self.0.lock();
        if !inst.bonds.is_bonded(peer) {
            return;
        }
        let Some(i) = (inst.pend.iter()).position(|e| e.pending && e.addr == peer) else {
            return;
        };
        let lock = inst.lock;
        if let Some(n) = inst.ntf.get(&peer) {
            let _ = n.notify(|p| {
                p.u8(lock);
            });
        }
        inst.pend[i].pending = false;
    }

    /// Tracks a completed pairing so future lock changes reach the peer even
    /// across disconnects.
    pub fn pairing_complete(&self, peer: Addr, bonded: bool) {
        if !bonded {
            return;
        }
        let mut inst = self.0.lock();
        let age = inst.next_age();
        // Refresh an existing entry
        if let Some(e) = (inst.pend.iter_mut()).find(|e| e.active && e.addr == peer) {
            e.age = age;
            return;
        }
        let entry = PendEntry {
            addr: peer,
            pending: false,
            active: true,
            age,
        };
        // Fill a free slot
        if let Some(e) = inst.pend.iter_mut().find(|e| !e.active) {
            *e = entry;
            return;
        }
        if inst.pend.len() < inst.cap {
            inst.pend.push(entry);
            return;
        }
        if inst.overwrite_oldest {
            // The security database overwrites the oldest keys, so the
            // notification table follows
            if let Some(e) = inst.pend.iter_mut().min_by_key(|e| e.age) {
                *e = entry;
            }
        } else {
            warn!("Could not add {peer} to the pending notification table");
        }
    }
}

/// Bonded-peer notification table entry.
#[derive(Clone, Copy, Debug, Default)]
struct PendEntry {
    addr: Addr,
    pending: bool,
    active: bool,
    age: u32,
}

#[derive(Debug)]
struct Inst {
    weak: Weak<SyncMutex<Inst>>,
    sirk: Sirk,
    set_size: u8,
    rank: u8,
    lock: SetLock,
    holder: Option<Addr>,
    timer: Option<JoinHandle<()>>,
    pend: Vec<PendEntry>,
    cap: usize,
    age_counter: u32,
    overwrite_oldest: bool,
    rpa_timeout: Duration,
    bondable: bool,
    bonds: Arc<dyn BondStore>,
    ntf: BTreeMap<Addr, NotifyReq>,
    locked_w: watch::Sender<bool>,
}

impl Inst {
    fn lock_io(&mut self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => {
                debug!("Lock {}", self.lock);
                r.complete([u8::from(self.lock)])
            }
            IoReq::Write(w) => self.write_lock(w.peer(), w.offset(), w.value()),
            IoReq::Notify(n) => {
                self.ntf.retain(|_, n| !n.is_closed());
                self.ntf.insert(n.peer(), n);
                Ok(())
            }
        }
    }

    /// Lock handler shared by client writes and the local API.
    fn write_lock(&mut self, peer: Option<Addr>, off: usize, val: &[u8]) -> IoResult {
        if off != 0 {
            return Err(ErrorCode::InvalidOffset);
        }
        let &[v] = val else {
            return Err(ErrorCode::InvalidAttributeValueLength);
        };
        let Ok(new) = SetLock::try_from(v) else {
            return Err(LockError::InvalidLockValue.into());
        };
        if self.lock == SetLock::Locked {
            if new == SetLock::Locked {
                return Err(LockError::LockDenied.into());
            } else if peer != self.holder {
                return Err(LockError::LockReleaseDenied.into());
            }
        }
        let notify = self.lock != new;
        self.lock = new;
        if new == SetLock::Locked {
            self.holder = peer;
            self.arm_timer();
        } else {
            self.holder = None;
            self.cancel_timer();
        }
        debug!("Lock {}", self.lock);
        if notify {
            // Every client except the writer is notified
            self.fan_out(peer);
            self.locked_w.send_replace(new == SetLock::Locked);
        }
        Ok(())
    }

    /// Marks every tracked bond pending and notifies the connected
    /// subscribers, clearing the flag for each peer reached.
    fn fan_out(&mut self, exclude: Option<Addr>) {
        for e in &mut self.pend {
            if e.active && Some(e.addr) != exclude {
                e.pending = true;
            }
        }
        self.ntf.retain(|_, n| !n.is_closed());
        let lock = self.lock;
        for (&peer, n) in &self.ntf {
            if Some(peer) == exclude {
                continue;
            }
            let _ = n.notify(|p| {
                p.u8(lock);
            });
            if let Some(e) = self.pend.iter_mut().find(|e| e.pending && e.addr == peer) {
                e.pending = false;
            }
        }
    }

    /// Timeout and stranded-lock path: release and notify everyone.
    fn force_release(&mut self) {
        self.lock = SetLock::Released;
        self.fan_out(None);
        self.locked_w.send_replace(false);
    }

    fn arm_timer(&mut self) {
        self.cancel_timer();
        let weak = Weak::clone(&self.weak);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(LOCK_TIMEOUT).await;
            let Some(this) = weak.upgrade() else { return };
            let mut inst = this.lock();
            debug!("Lock timeout, releasing");
            inst.timer = None;
            inst.holder = None;
            inst.force_release();
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }

    fn next_age(&mut self) -> u32 {
        let age = self.age_counter;
        self.age_counter = self.age_counter.wrapping_add(1);
        age
    }
}
