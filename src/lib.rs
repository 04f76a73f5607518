//! Keeps a streaming helper process alive and parameterised by the host's
//! current NAT situation: STUN-based NAT-type discovery, local network
//! probing, and child-process supervision.

pub mod config;
pub mod logging;
pub mod netprobe;
pub mod stun;
pub mod supervisor;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
