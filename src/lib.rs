//! cmdhub: a hub that accepts connections from remote agents, tracks them in
//! an ordered registry, dispatches operator commands to one agent at a time,
//! and streams their output back to an observer.

pub mod client;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod events;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown;
