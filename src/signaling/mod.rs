//! WebRTC signaling over HTTP

pub mod handlers;
pub mod peer;
pub mod server;

pub use server::{router, AppState};
