//! chainhead-evm: EVM support for ChainHead.
//!
//! - [`EvmHead`]: block header parsed from `eth_getBlockByNumber` / `newHeads`
//! - [`WsHeadClient`]: WebSocket JSON-RPC [`HeadClient`](chainhead_core::HeadClient)
//!   with auto-reconnect

pub mod client;
pub mod head;

pub use client::{WsClientConfig, WsHeadClient};
pub use head::{parse_hex_u64, EvmHead};
