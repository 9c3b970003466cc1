//! Node-to-node coordination.
//!
//! Small JSON messages travel over an MQTT-style [`bus`]. Files travel as
//! chunked gzip tar archives ([`archive`]) over an HTTP side channel
//! ([`file_server`], [`transfer`]). [`central`] and [`outer`] hold the two
//! halves of the protocol.

pub mod archive;
pub mod bus;
pub mod central;
pub mod file_server;
pub mod mqtt;
pub mod outer;
pub mod transfer;
