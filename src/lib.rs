//! ByteValve: encrypted single-file transfer between two hosts on a LAN,
//! with UDP broadcast peer discovery.

pub mod config;
pub mod crypto;
pub mod error;
pub mod networking;
pub mod progress;

pub use config::Config;
pub use error::{ErrorKind, TransferError};
