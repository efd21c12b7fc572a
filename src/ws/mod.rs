//! WebSocket 传输层 / WebSocket transport

pub mod connection;

pub use connection::handle_connection;
