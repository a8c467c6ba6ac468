//! Local IPC binding: broker sessions over a Unix socket.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientError, IpcClient};
pub use protocol::{Operation, Reply, Request};
pub use server::IpcServer;
