//! Bluetooth LE audio-control GATT services.
//!
//! Server and client state machines for the Volume Control Service and its
//! included Volume Offset and Audio Input Control secondary services, the
//! Coordinated Set Identification Service, and the Audio Stream Control
//! Service. The host stack provides the ATT transport; services plug into a
//! local [`gatt::Db`] and handle reads, writes, and notification sessions
//! through [`gatt::Io`] callbacks.

#![warn(missing_debug_implementations)]
#![warn(non_ascii_idents)]
#![warn(single_use_lifetimes)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_qualifications)]
#![warn(clippy::cargo)]
#![warn(clippy::pedantic)]
#![allow(clippy::enum_glob_use)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::exit)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![warn(clippy::rc_mutex)]
#![warn(clippy::str_to_string)]
#![warn(clippy::string_add)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unnecessary_self_imports)]
#![warn(clippy::unseparated_literal_suffix)]

pub mod att;
pub mod gatt;
pub mod le;
pub mod sec;

pub(crate) use util::*;

mod util;

/// Synchronous mutex type used for service state.
pub(crate) type SyncMutex<T> = parking_lot::Mutex<T>;

/// Error type returned by the service and client APIs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Operation requires a connection to a remote peer.
    #[error("not connected")]
    NotConnected,
    /// A parameter is outside its valid range.
    #[error("invalid argument")]
    InvalidArgument,
    /// Another transaction is outstanding on the same instance.
    #[error("busy")]
    Busy,
    /// The operation is not supported by the local or remote configuration.
    #[error("not supported")]
    NotSupported,
    /// The remote service does not permit the operation.
    #[error("not permitted")]
    NotPermitted,
    /// The instance was already initialized.
    #[error("already initialized")]
    AlreadyInitialized,
    /// An instance index is out of range.
    #[error("index out of range")]
    OutOfRange,
    /// No free instances remain.
    #[error("no memory")]
    NoMemory,
    /// The peer returned an ATT error response.
    #[error("ATT error: {0}")]
    Att(att::ErrorCode),
}

impl From<att::ErrorCode> for Error {
    #[inline(always)]
    fn from(e: att::ErrorCode) -> Self {
        Self::Att(e)
    }
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;
