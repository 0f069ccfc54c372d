//! 局域网传输配置

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// 数据报负载默认上限（64 KiB）
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// libp2p 传输配置
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// 监听地址列表
    pub listen_addresses: Vec<Multiaddr>,

    /// mDNS 查询间隔
    pub query_interval: Duration,

    /// 空闲连接超时
    pub idle_connection_timeout: Duration,

    /// 单次请求（服务查询、数据报）超时
    pub request_timeout: Duration,

    /// 数据报负载上限
    pub max_datagram_size: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![
                Multiaddr::empty()
                    .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                    .with(Protocol::Tcp(0)),
                Multiaddr::empty()
                    .with(Protocol::Ip6(Ipv6Addr::UNSPECIFIED))
                    .with(Protocol::Tcp(0)),
            ],
            query_interval: Duration::from_secs(5),
            idle_connection_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

impl P2pConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn with_listen_addresses(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.listen_addresses = addrs;
        self
    }

    /// 设置 mDNS 查询间隔
    pub fn with_query_interval(mut self, interval: Duration) -> Self {
        self.query_interval = interval;
        self
    }

    /// 设置空闲连接超时
    pub fn with_idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = timeout;
        self
    }

    /// 设置请求超时
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 设置数据报负载上限
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }
}
