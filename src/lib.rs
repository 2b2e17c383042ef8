//! swapscan - cross-chain swap scanner
//!
//! Walks the block history of an EVM compatible chain, identifies
//! transactions that constitute bridge or router swap events, and
//! registers each discovered swap with a swap server over JSON-RPC.
//! Registrations that cannot complete immediately are kept in a durable
//! pending queue and continually retried.

pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod pending;
pub mod rpc;
pub mod scanner;
pub mod store;
pub mod types;
pub mod verify;

// Re-export the main types for convenience
pub use config::{Config, TokenRegistry, TokenRule};
pub use dispatch::{Dispatcher, SwapPost};
pub use scanner::{ScanSettings, Scanner, SyncState};
pub use store::SwapStore;
pub use verify::Verifier;
