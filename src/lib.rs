//! Media-server control plane for WebRTC conferencing.
//!
//! This crate owns a pool of native SFU worker processes, multiplexes
//! request/reply and event traffic with them over pipe-based IPC, and
//! maintains the graph of conferencing resources on top: workers own
//! routers, routers own transports and RTP observers, transports carry
//! producers and consumers, and rooms with their members drive all of it
//! on behalf of WebSocket clients.
//!
//! The SFU worker binary, the HTTP/WebSocket server and the document
//! store live outside this crate; the latter two are reached through the
//! [`ws::WsSocket`] and [`kv::Kv`] seams.

#[macro_use]
mod macros;

mod messages;
pub mod ortc;

pub mod data_structures;
pub mod events;
pub mod kv;
pub mod prelude;
pub mod registry;
pub mod room;
pub mod router;
pub mod rtp_parameters;
pub mod scalability_modes;
pub mod sctp_parameters;
pub mod srtp_parameters;
pub mod supported_rtp_capabilities;
pub mod worker;
pub mod worker_manager;
pub mod ws;

pub use router::{
    consumer, data_consumer, data_producer, direct_transport, pipe_transport, plain_transport,
    producer, rtp_observer, transport, webrtc_transport,
};
