//! TCP transport
//!
//! [`TcpServer`] serves the repository protocol to remote clients;
//! [`TcpChannel`] is the client end, usable wherever a
//! [`Channel`](crate::protocol::Channel) is expected.

pub mod client;
pub mod frame;
pub mod server;

pub use client::TcpChannel;
pub use frame::{Frame, FRAME_HEADER_LEN};
pub use server::TcpServer;
