#![warn(rust_2018_idioms)]

//! WebSocket transport building block: TCP, optional TLS, HTTP/1.1 upgrade,
//! and RFC 6455 framing, in both client and server mode.

pub mod frame;
pub mod http;
pub mod server;
pub(crate) mod tls;
pub mod websocket;

pub use http::Headers;
pub use server::{OnClientHdlrFn, WebSocketServer, WebSocketServerConfiguration};
pub use websocket::{
    OnCloseHdlrFn, OnErrorHdlrFn, OnMessageHdlrFn, OnOpenHdlrFn, WebSocket,
    WebSocketConfiguration, WebSocketMessage, WebSocketState,
};
