//! Miner-facing side of the validator: wire payloads, transport and fan-out.

pub mod client;
pub mod gateway;
pub mod roster;
pub mod synapse;

pub use client::{HttpPeerClient, PeerClient};
pub use gateway::MinerQueryGateway;
pub use roster::{JsonRosterDirectory, MinerDirectory};
