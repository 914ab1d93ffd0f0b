//! Attribute Protocol vocabulary ([Vol 3] Part F).
//!
//! The transport itself is provided by the host stack. This module defines
//! the handle space, permission model, and error codes that the GATT layer
//! and the audio-control services share with it.

pub use {consts::*, handle::*, perm::*};

mod consts;
mod handle;
mod perm;
