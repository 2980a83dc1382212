//! TCP transport for fabload.
//!
//! Every connection carries length-prefixed CBOR frames. The first client
//! frame selects the service (endorser, broadcast or deliver); endorser
//! connections multiplex many in-flight calls by correlation id.

pub mod client;
pub mod frame;
pub mod server;

pub use client::TcpConnector;
pub use frame::{read_frame, write_frame, ClientFrame, ServerFrame, Service, MAX_FRAME_LEN};
pub use server::LedgerServer;
