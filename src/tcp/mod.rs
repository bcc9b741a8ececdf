//! TCP client and server built on [`crate::session::Session`].

pub mod client;
pub mod server;

pub use client::{Client, ClientState};
pub use server::Server;
