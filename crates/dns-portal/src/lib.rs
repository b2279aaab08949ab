//! A small DNS responder for captive portals.
//!
//! Queries for the portal's domain (or for every domain, if the
//! domain is `*`) are answered with a fixed IPv4 address.  Anything
//! else is either refused with a configurable error code or, if an
//! upstream nameserver is configured, forwarded to it with the reply
//! relayed back to the original client.
//!
//! Everything runs to completion on the caller's thread: the host
//! application calls [`server::Server::process_next_request`] from its
//! own event loop whenever the socket may be readable.

pub mod classify;
pub mod dispatch;
pub mod forwarder;
pub mod reply;
pub mod server;
pub mod settings;
pub mod stats;
pub mod transport;
