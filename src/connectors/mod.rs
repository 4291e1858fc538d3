//! Built-in [`Connector`](crate::Connector) implementations.
//!
//! | Feature | Connector        | Schemes          |
//! |---------|------------------|------------------|
//! | (none)  | [`TcpConnector`] | `ws://`          |
//! | `tls`   | [`TcpConnector`] | `ws://`, `wss://` |

pub mod tcp;

pub use tcp::TcpConnector;
