//! Role Adapters: the thin, endpoint-specific layer that decides what an
//! inbound frame means — route it to an existing stream, or (acceptor only)
//! originate one — and how a local accept event becomes a `Connect` request
//! (initiator only).

pub mod acceptor;
pub mod initiator;

pub use acceptor::AcceptorHandler;
pub use initiator::{accept_local, InitiatorHandler};
