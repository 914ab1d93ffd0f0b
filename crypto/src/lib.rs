//! Bluetooth LE cryptographic toolbox for coordinated set identification
//! ([Vol 3] Part H, Section 2.2 and \[CSIS\] Section 4.8).

#![warn(missing_debug_implementations)]
#![warn(non_ascii_idents)]
#![warn(single_use_lifetimes)]
#![warn(unused_crate_dependencies)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_qualifications)]
#![warn(clippy::pedantic)]
#![allow(clippy::enum_glob_use)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]

use std::fmt::{Debug, Formatter};

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use subtle::{Choice, ConstantTimeEq};

/// 128-bit secret key for the AES-128 security function `e`.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
#[must_use]
#[repr(transparent)]
pub struct Key([u8; 16]);

impl Key {
    /// Creates a key from the specified value.
    #[inline(always)]
    pub const fn new(k: u128) -> Self {
        Self(k.to_be_bytes())
    }

    /// Creates a key from a little-endian byte array.
    #[inline(always)]
    pub const fn from_le_bytes(mut k: [u8; 16]) -> Self {
        let mut i = 0;
        while i < 8 {
            let (a, b) = (k[i], k[15 - i]);
            k[i] = b;
            k[15 - i] = a;
            i += 1;
        }
        Self(k)
    }

    /// Security function `e`: AES-128 encryption of one block
    /// ([Vol 3] Part H, Section 2.2.1). Input and output are little-endian.
    #[must_use]
    pub fn encrypt(&self, b: [u8; 16]) -> [u8; 16] {
        let mut block = aes::Block::default();
        for (d, s) in block.iter_mut().zip(b.iter().rev()) {
            *d = *s;
        }
        Aes128::new(&self.0.into()).encrypt_block(&mut block);
        let mut out = [0; 16];
        for (d, s) in out.iter_mut().zip(block.iter().rev()) {
            *d = *s;
        }
        out
    }
}

impl Debug for Key {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Key").field(&"<secret key>").finish()
    }
}

/// 16-byte Set Identity Resolving Key shared by all members of a coordinated
/// set (\[CSIS\] Section 4.8).
#[derive(Clone, Eq, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
#[must_use]
#[repr(transparent)]
pub struct Sirk([u8; 16]);

impl Sirk {
    /// Wraps an existing key value in little-endian byte order.
    #[inline(always)]
    pub const fn new(v: [u8; 16]) -> Self {
        Self(v)
    }

    /// Derives a set key from a generation key and a seed value shared by the
    /// set: `sirk = e(k, padding || seed)`.
    pub fn derive(k: &Key, seed: u32) -> Self {
        let mut b = [0; 16];
        b[..4].copy_from_slice(&seed.to_le_bytes());
        Self(k.encrypt(b))
    }

    /// Returns the key in little-endian byte order for the SIRK
    /// characteristic value.
    #[inline(always)]
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl Debug for Sirk {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Sirk").field(&"<secret key>").finish()
    }
}

impl ConstantTimeEq for Sirk {
    #[inline(always)]
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0.ct_eq(&other.0)
    }
}

impl PartialEq for Sirk {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.ct_eq(other))
    }
}

impl AsRef<[u8]> for Sirk {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Set Identity Hash function `sih(k, r) = e(k, r') mod 2^24`
/// (\[CSIS\] Section 4.8.1). The result is the least significant 24 bits.
#[must_use]
pub fn sih(sirk: &Sirk, r: u32) -> u32 {
    // r' = padding || r
    let mut b = [0; 16];
    b[..3].copy_from_slice(&r.to_le_bytes()[..3]);
    let e = Key::from_le_bytes(sirk.0).encrypt(b);
    u32::from_le_bytes([e[0], e[1], e[2], 0])
}

/// 24-bit random part of a resolvable set identifier. Bit 23 is always 0 and
/// bit 22 is always 1, leaving 22 random bits that must contain at least one
/// 0 and one 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
#[repr(transparent)]
pub struct Prand(u32);

impl Prand {
    const MASK: u32 = 0x3F_FFFF;
    const FIXED: u32 = 1 << 22;

    /// Generates a new random value from the OS CSPRNG.
    pub fn new() -> Self {
        let mut b = [0; 4];
        loop {
            getrandom::getrandom(&mut b[..3]).expect("OS CSPRNG error");
            let v = u32::from_le_bytes(b) & Self::MASK;
            // The random part must contain both a 1 and a 0
            if v != 0 && v != Self::MASK {
                return Self(v | Self::FIXED);
            }
        }
    }

    /// Wraps a raw 24-bit value, forcing the two fixed type bits.
    #[inline(always)]
    pub const fn from_raw(v: u32) -> Self {
        Self(v & Self::MASK | Self::FIXED)
    }

    /// Returns the 24-bit value with the type bits included.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl Default for Prand {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

/// 6-byte Private Set Random Identifier `hash || prand`, broadcast in
/// advertising data and resolvable only by peers that know the set key
/// (\[CSIS\] Section 4.8).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
#[repr(transparent)]
pub struct Psri([u8; 6]);

impl Psri {
    /// Identifier size in bytes.
    pub const BYTES: usize = 6;

    /// Generates a fresh identifier for the set key.
    #[inline]
    pub fn new(sirk: &Sirk) -> Self {
        Self::with_prand(sirk, Prand::new())
    }

    /// Generates an identifier from a fixed random part.
    pub fn with_prand(sirk: &Sirk, prand: Prand) -> Self {
        let hash = sih(sirk, prand.raw());
        let mut v = [0; 6];
        v[..3].copy_from_slice(&hash.to_le_bytes()[..3]);
        v[3..].copy_from_slice(&prand.raw().to_le_bytes()[..3]);
        Self(v)
    }

    /// Returns the 24-bit hash part.
    #[inline]
    #[must_use]
    pub const fn hash(self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], 0])
    }

    /// Returns the 24-bit random part.
    #[inline]
    pub const fn prand(self) -> Prand {
        Prand(u32::from_le_bytes([self.0[3], self.0[4], self.0[5], 0]))
    }

    /// Returns whether the identifier was generated from the specified set
    /// key.
    #[must_use]
    pub fn resolve(self, sirk: &Sirk) -> bool {
        sih(sirk, self.prand().raw()) == self.hash()
    }
}

impl From<[u8; 6]> for Psri {
    #[inline(always)]
    fn from(v: [u8; 6]) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for Psri {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// FIPS-197 Appendix C.1 vector, byte-reversed for the little-endian
    /// security function interface.
    #[test]
    fn security_function_e() {
        let k = Key::new(0x00010203_04050607_08090a0b_0c0d0e0f);
        let mut p = 0x00112233_44556677_8899aabb_ccddeeff_u128.to_be_bytes();
        p.reverse();
        let mut want = 0x69c4e0d8_6a7b0430_d8cdb780_70b4c55a_u128.to_be_bytes();
        want.reverse();
        assert_eq!(k.encrypt(p), want);
    }

    #[test]
    fn key_byte_order() {
        let k = Key::new(0x00010203_04050607_08090a0b_0c0d0e0f);
        let mut le = 0x00010203_04050607_08090a0b_0c0d0e0f_u128.to_be_bytes();
        le.reverse();
        let p = [0x42; 16];
        assert_eq!(k.encrypt(p), Key::from_le_bytes(le).encrypt(p));
    }

    #[test]
    fn prand_type_bits() {
        for _ in 0..64 {
            let r = Prand::new().raw();
            assert_eq!(r & 0xC0_0000, 0x40_0000);
            assert_ne!(r & 0x3F_FFFF, 0);
            assert_ne!(r & 0x3F_FFFF, 0x3F_FFFF);
        }
    }

    #[test]
    fn psri_resolve() {
        let sirk = Sirk::derive(&Key::new(0x925fcbcb_8aa896e9_3e620154_f9adef54), 1);
        let other = Sirk::derive(&Key::new(0x925fcbcb_8aa896e9_3e620154_f9adef54), 2);
        for _ in 0..16 {
            let psri = Psri::new(&sirk);
            assert!(psri.resolve(&sirk));
            assert!(!psri.resolve(&other));
            assert_eq!(psri, Psri::from(<[u8; 6]>::try_from(psri.as_ref()).unwrap()));
        }
    }

    #[test]
    fn sirk_eq() {
        let k = Key::new(0x925fcbcb_8aa896e9_3e620154_f9adef54);
        assert_eq!(Sirk::derive(&k, 7), Sirk::derive(&k, 7));
        assert_ne!(Sirk::derive(&k, 7), Sirk::derive(&k, 8));
    }

    #[test]
    fn sih_truncates() {
        let sirk = Sirk::new([0x55; 16]);
        for r in [0x45_1234_u32, 0x7F_FFFE, 0x40_0001] {
            assert!(sih(&sirk, r) <= 0xFF_FFFF);
        }
    }
}
