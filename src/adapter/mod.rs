//! Reference adapter: feeds newline-delimited JSON request contexts through
//! the admission controller and writes one JSON outcome per line.

mod server;
mod service;

pub use server::{ReplayServer, ReplayStats};
pub use service::{InboundRequest, Outcome, ReplayService};
