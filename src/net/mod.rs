//! The connection objects built on top of the dispatch layer.
//!
//! - [`client`]: [`AsyncClient`], the per-connection state machine
//! - [`server`]: [`AsyncServer`], the listening socket that manufactures
//!   clients on accept
//! - [`queue`]: the outbound write queue with partial-write accounting
//!
//! [`AsyncClient`]: client::AsyncClient
//! [`AsyncServer`]: server::AsyncServer

pub(crate) mod client;
pub(crate) mod queue;
pub(crate) mod server;
