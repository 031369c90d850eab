pub mod discovery;
pub mod interface;
pub mod file_transfer;

// Re-export key components for easier access
pub use discovery::{DiscoveryRequester, DiscoveryResponder, Neighbor};
pub use interface::{InterfaceType, NetworkInterface};
pub use file_transfer::{TransferClient, TransferReport, TransferServer};
