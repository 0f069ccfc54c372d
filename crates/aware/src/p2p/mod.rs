//! 局域网传输
//!
//! [`P2pTransport`] 用 libp2p 实现 [`DiscoveryTransport`](crate::DiscoveryTransport)：
//! mDNS 负责节点发现，request-response 协议负责服务查询和数据报。

mod codec;
mod config;
mod transport;

pub use codec::{ServiceAdvert, ServiceQuery, DATAGRAM_PROTOCOL, SERVICE_INFO_PROTOCOL};
pub use config::{P2pConfig, DEFAULT_MAX_DATAGRAM_SIZE};
pub use transport::P2pTransport;
