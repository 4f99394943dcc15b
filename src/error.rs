//! Crate-level error type for link-level and I/O failures.
//!
//! Module-internal functions mostly return `std::io::Result` directly;
//! `TunnelError` exists for the boundary where the binaries need one error
//! type to match against (reconnect vs. exit).

use std::io;
use thiserror::Error;

use crate::frame::FrameError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("link closed by peer")]
    LinkClosed,

    #[error("no inbound frame for over two minutes, peer presumed dead")]
    KeepaliveTimeout,

    #[error("malformed frame on the wire: {0}")]
    Frame(#[from] FrameError),

    #[error("local CONNECT request was rejected: {0}")]
    HandshakeRejected(&'static str),

    #[error("no free slot available within the acquisition deadline")]
    SlotsExhausted,
}

pub type Result<T> = std::result::Result<T, TunnelError>;
