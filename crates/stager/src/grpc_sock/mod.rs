//! gRPC over UNIX domain sockets for tonic. Socket transports are not built
//! into tonic, so the server side wraps a `UnixListener` in a connection
//! stream and the client side dials through a custom connector.

pub mod client;
pub mod server;
