//! MCP (Model Context Protocol) client support for Rosiwit.
//!
//! - [`transport`]: stdio and SSE adapters behind one `Transport` trait
//! - [`client`]: one server connection with handshake and tool discovery
//! - [`registry`]: the named set of servers, catalog aggregation and routing

pub mod client;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use client::{ClientOptions, McpClient};
pub use registry::{ClientRegistry, Connectivity, ServerStatus};
pub use transport::{Connector, Transport, TransportConnector};
