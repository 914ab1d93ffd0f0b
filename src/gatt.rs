//! Generic Attribute Profile ([Vol 3] Part G).
//!
//! Local services are defined into a read-only [`Db`] with I/O callbacks for
//! dynamic values. The host's ATT server routes reads and writes through the
//! [`IoMap`] and hands notification sessions to services when a client
//! configures its CCC descriptor. [`client`] defines the remote-operation
//! interface used by the profile clients.

pub use {consts::*, db::*, io::*};

use crate::att::*;

pub mod client;
pub mod service;

mod consts;
mod db;
mod io;
