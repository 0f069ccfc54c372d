//! 会话配置模块

use std::time::Duration;

/// 默认服务名称
pub const DEFAULT_SERVICE_NAME: &str = "lchat";

/// 默认预共享口令
pub const DEFAULT_PASSPHRASE: &str = "lchat-secure-key";

/// 主机端承载网络端口
pub const DEFAULT_PORT: u16 = 8888;

/// 会话协调器配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 发布/订阅使用的服务名称
    pub service_name: String,

    /// 承载网络的预共享口令
    pub passphrase: String,

    /// 主机端接受承载网络的端口
    pub port: u16,

    /// 客户端发送 CONNECT_REQUEST 后，请求承载网络前的等待时间
    pub settle_delay: Duration,

    /// 承载网络请求的超时上限
    pub bearer_timeout: Duration,

    /// 心跳配置
    pub keep_alive: KeepAliveConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            passphrase: DEFAULT_PASSPHRASE.to_string(),
            port: DEFAULT_PORT,
            settle_delay: Duration::from_millis(500),
            bearer_timeout: Duration::from_secs(30),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl SessionConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置服务名称
    pub fn with_service_name(mut self, name: String) -> Self {
        self.service_name = name;
        self
    }

    /// 设置预共享口令
    pub fn with_passphrase(mut self, passphrase: String) -> Self {
        self.passphrase = passphrase;
        self
    }

    /// 设置主机端口
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 设置客户端等待时间
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// 设置承载网络超时
    pub fn with_bearer_timeout(mut self, timeout: Duration) -> Self {
        self.bearer_timeout = timeout;
        self
    }

    /// 设置心跳配置
    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// 心跳配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// 心跳间隔
    pub interval: Duration,

    /// 超时时间（超过此时间没有任何流量的对端会被剔除）
    pub timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30),
        }
    }
}

impl KeepAliveConfig {
    /// 创建新的心跳配置
    ///
    /// 超时时间会被提升到至少两倍心跳间隔，保证丢失一次心跳不会误判离线。
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }.validate()
    }

    /// 校正超时时间
    pub fn validate(mut self) -> Self {
        let floor = self.interval * 2;
        if self.timeout < floor {
            tracing::warn!(
                "心跳超时 {:?} 小于两倍心跳间隔，调整为 {:?}",
                self.timeout,
                floor
            );
            self.timeout = floor;
        }
        self
    }
}

/// 门面层连接活跃检测配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    /// 无流量多久后判定断开
    pub timeout: Duration,

    /// 检查间隔
    pub check_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
        }
    }
}

impl LivenessConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置超时时间
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 设置检查间隔
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.service_name, "lchat");
        assert_eq!(config.passphrase, "lchat-secure-key");
        assert_eq!(config.port, 8888);
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.bearer_timeout, Duration::from_secs(30));
        assert_eq!(config.keep_alive.interval, Duration::from_secs(15));
        assert_eq!(config.keep_alive.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_keep_alive_timeout_floor() {
        let config = KeepAliveConfig::new(Duration::from_secs(10), Duration::from_secs(12));
        assert_eq!(config.timeout, Duration::from_secs(20));

        let config = KeepAliveConfig::new(Duration::from_secs(10), Duration::from_secs(45));
        assert_eq!(config.timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::new()
            .with_service_name("room-svc".to_string())
            .with_port(9000)
            .with_settle_delay(Duration::from_millis(100));

        assert_eq!(config.service_name, "room-svc");
        assert_eq!(config.port, 9000);
        assert_eq!(config.settle_delay, Duration::from_millis(100));

        let liveness = LivenessConfig::new().with_timeout(Duration::from_secs(60));
        assert_eq!(liveness.timeout, Duration::from_secs(60));
        assert_eq!(liveness.check_interval, Duration::from_secs(5));
    }
}
