//! RTMP connection engine of a multi-protocol streaming relay.
//!
//! The engine terminates RTMP/1.0 connections, classifies each peer as a
//! publisher or a reader, authenticates it against a named path, and runs
//! a bidirectional media pump between RTMP's FLV-style packets and the
//! internal RTP-based stream bus.

pub mod api;
pub mod codec;
pub mod core;
pub mod externalcmd;
pub mod observability;
pub mod path;
pub mod rtmp;
