//! LE audio-control services.
//!
//! Each service follows the same shape: a cheaply cloneable handle around
//! shared state, a `define` method that declares the attributes into a
//! database builder, I/O callbacks that validate and commit writes, and
//! retained notification sessions that fan out committed changes to
//! subscribed peers.

use std::collections::BTreeMap;

use structbuf::Packer;

use crate::att::ErrorCode;
use crate::gatt::NotifyReq;
use crate::le::Addr;

pub mod aics;
pub mod ascs;
pub mod csis;
pub mod vcs;
pub mod vocs;

/// Parsed control-point request. Every control point shares the same frame:
/// an opcode, the change counter, and an opcode-specific operand.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ControlReq<'a> {
    pub opcode: u8,
    pub counter: u8,
    pub operand: &'a [u8],
}

/// Validates the offset, opcode, and length of a control-point write.
/// `operand_len` maps a valid opcode to its operand length; unknown opcodes
/// fail with `not_supported` before the length is considered. The handler
/// stays pure on `(off, val)` so the local API can re-enter it with a
/// synthesized request.
pub(crate) fn control_req<'a>(
    off: usize,
    val: &'a [u8],
    operand_len: impl FnOnce(u8) -> Option<usize>,
    not_supported: ErrorCode,
) -> std::result::Result<ControlReq<'a>, ErrorCode> {
    if off != 0 {
        return Err(ErrorCode::InvalidOffset);
    }
    let &[opcode, ..] = val else {
        return Err(ErrorCode::InvalidAttributeValueLength);
    };
    // Opcode is checked before the length
    let Some(n) = operand_len(opcode) else {
        return Err(not_supported);
    };
    if val.len() != 2 + n {
        return Err(ErrorCode::InvalidAttributeValueLength);
    }
    Ok(ControlReq {
        opcode,
        counter: val[1],
        operand: &val[2..],
    })
}

/// Notification sessions retained by a service, keyed by characteristic
/// selector and peer address. Closed sessions are swept on every use.
#[derive(Debug)]
pub(crate) struct Sessions<K>(BTreeMap<(K, Addr), NotifyReq>);

impl<K: Copy + Ord> Sessions<K> {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Retains a new session, replacing any prior one for the same
    /// characteristic and peer.
    pub fn insert(&mut self, k: K, n: NotifyReq) {
        self.sweep();
        self.0.insert((k, n.peer()), n);
    }

    /// Queues a notification for every subscribed peer except `exclude`.
    pub fn notify(&mut self, k: K, exclude: Option<Addr>, f: impl Fn(&mut Packer)) {
        self.sweep();
        for ((sel, peer), n) in &self.0 {
            if *sel == k && Some(*peer) != exclude {
                let _ = n.notify(|p| f(p));
            }
        }
    }

    /// Queues a notification for one peer. Returns whether the peer has a
    /// live session.
    pub fn notify_peer(&mut self, k: K, peer: Addr, f: impl FnOnce(&mut Packer)) -> bool {
        self.sweep();
        (self.0.get(&(k, peer))).map_or(false, |n| n.notify(f).is_ok())
    }

    /// Drops all sessions for the peer.
    pub fn drop_peer(&mut self, peer: Addr) {
        self.0.retain(|&(_, p), _| p != peer);
    }

    fn sweep(&mut self) {
        self.0.retain(|_, n| !n.is_closed());
    }
}

impl<K> Default for Sessions<K> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

/// Compares a written value against a stored description the way a NUL-padded
/// fixed buffer would: bytes past the end of the stored value compare as 0.
pub(crate) fn desc_eq(stored: &str, raw: &[u8]) -> bool {
    (raw.iter().enumerate())
        .all(|(i, &b)| stored.as_bytes().get(i).copied().unwrap_or(0) == b)
}

/// Converts a written description to its stored form: clipped to `max` bytes
/// and truncated at the first NUL.
pub(crate) fn desc_store(raw: &[u8], max: usize) -> String {
    let raw = &raw[..raw.len().min(max)];
    let raw = raw.iter().position(|&b| b == 0).map_or(raw, |i| &raw[..i]);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_padding() {
        assert!(desc_eq("ab", b"ab"));
        assert!(desc_eq("ab", b"ab\0\0"));
        assert!(desc_eq("abc", b"ab")); // Prefix writes compare as unchanged
        assert!(!desc_eq("ab", b"abc"));
        assert!(!desc_eq("ab", b"ax"));
    }

    #[test]
    fn desc_clipping() {
        assert_eq!(desc_store(b"hello", 32), "hello");
        assert_eq!(desc_store(b"hello", 4), "hell");
        assert_eq!(desc_store(b"he\0llo", 32), "he");
        assert_eq!(desc_store("héllo".as_bytes(), 2), "h\u{fffd}");
    }
}
