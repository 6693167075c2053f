//! Read-only HTTP view of a running session.

mod handlers;
mod server;

pub use server::{DiagnosticsServer, DiagnosticsServerBuilder};
