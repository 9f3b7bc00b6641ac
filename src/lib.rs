//! A RESP (Redis serialization protocol) client and server.
//!
//! Requests and replies are never buffered whole: arguments are decoded one value at a time
//! straight from the connection through [`Args`], and replies are written one value at a time
//! through [`ResponseWriter`]. On the client side a shared [`Transport`] pools pipelined
//! connections per address.

pub mod args;
pub mod client;
pub mod codec;
pub(crate) mod connection;
pub mod context;
pub mod error;
pub mod handler;
pub mod response;
pub mod server;
pub mod transport;
pub mod value;

pub use args::{Args, Dest};
pub use client::{Client, Reply};
pub use context::Context;
pub use error::Error;
pub use handler::{Handler, Request};
pub use response::ResponseWriter;
pub use server::{Listener, Server, ServerConfig};
pub use transport::{Transport, TransportConfig};
pub use value::Value;

pub type Result<T> = std::result::Result<T, Error>;
