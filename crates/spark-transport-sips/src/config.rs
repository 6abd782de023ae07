use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;

use crate::error::SipsError;

/// 监听队列深度，固定值，不开放配置。
pub const LISTEN_BACKLOG: i32 = 1000;

const DEFAULT_BIND: &str = "0.0.0.0:5061";
const DEFAULT_CHANNEL_NAME: &str = "sips";
const DEFAULT_INBOUND_IO_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_INBOUND_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
const DEFAULT_CLOSE_NOTIFY_GRACE_MS: u64 = 200;

/// 出站握手对服务端证书的校验策略。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 历史部署中的出站连接在证书校验失败时仍然接受连接，只输出告警；该行为被下游互通
///   场景依赖，因此作为显式策略保留，而非静默“修复”；
/// - 把选择权交给运维配置，默认值的安全缺陷在文档与日志中公开。
///
/// ## 契约（What）
/// - `Permissive`（默认）：证书链或名称校验失败时记录 WARN 并继续握手，握手签名仍然严格校验；
/// - `Strict`：任何证书校验失败都会终止握手。
///
/// ## 风险与权衡（Trade-offs）
/// - `Permissive` 意味着中间人可以伪装对端，属于已知弱点，是否切换默认值需要产品决策。
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerValidationPolicy {
    #[default]
    Permissive,
    Strict,
}

/// SIPS 通道配置。
///
/// 字段均带默认值，可以从 TOML 片段加载（缺省键取默认），也可以通过 `with_*` 方法在代码中装配：
///
/// ```toml
/// bind_address = "0.0.0.0:5061"
/// channel_name = "edge-tls"
/// inbound_io_timeout_ms = 5000
/// inbound_read_timeout_ms = 5000
/// peer_validation = "strict"
/// ```
///
/// 入站连接带读写截止时间：握手与写入受 `inbound_io_timeout_ms` 约束，每次读取受
/// `inbound_read_timeout_ms` 约束，静默超过该时长的入站连接按读失败断开。出站连接默认既无
/// 写截止时间也无读截止时间。两者刻意不对称，均可单独调整；需要容忍长时间静默的入站连接时，
/// 通过 [`ChannelConfig::with_inbound_read_timeout`] 传入 `None` 关闭读截止时间。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    bind_address: SocketAddr,
    channel_name: String,
    inbound_io_timeout_ms: Option<u64>,
    inbound_read_timeout_ms: Option<u64>,
    outbound_io_timeout_ms: Option<u64>,
    peer_validation: PeerValidationPolicy,
    read_buffer_size: usize,
    max_message_size: usize,
    close_notify_grace_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 5061))),
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
            inbound_io_timeout_ms: Some(DEFAULT_INBOUND_IO_TIMEOUT_MS),
            inbound_read_timeout_ms: Some(DEFAULT_INBOUND_READ_TIMEOUT_MS),
            outbound_io_timeout_ms: None,
            peer_validation: PeerValidationPolicy::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            close_notify_grace_ms: DEFAULT_CLOSE_NOTIFY_GRACE_MS,
        }
    }
}

impl ChannelConfig {
    /// 以监听地址创建配置，其余字段取默认值。
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Self::default()
        }
    }

    /// 从 TOML 文本加载并校验配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, SipsError> {
        let config: Self = toml::from_str(raw).map_err(|err| SipsError::InvalidConfig {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值是否自洽。
    pub fn validate(&self) -> Result<(), SipsError> {
        if self.channel_name.trim().is_empty() {
            return Err(invalid("channel_name must not be empty"));
        }
        if self.read_buffer_size == 0 {
            return Err(invalid("read_buffer_size must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(invalid("max_message_size must be positive"));
        }
        if [
            self.inbound_io_timeout_ms,
            self.inbound_read_timeout_ms,
            self.outbound_io_timeout_ms,
        ]
        .contains(&Some(0))
        {
            return Err(invalid("io timeouts must be positive when set"));
        }
        Ok(())
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn with_inbound_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inbound_io_timeout_ms = timeout.map(duration_to_ms);
        self
    }

    /// 入站连接单次读取的截止时间，`None` 表示不限。
    pub fn with_inbound_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inbound_read_timeout_ms = timeout.map(duration_to_ms);
        self
    }

    pub fn with_outbound_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.outbound_io_timeout_ms = timeout.map(duration_to_ms);
        self
    }

    pub fn with_peer_validation(mut self, policy: PeerValidationPolicy) -> Self {
        self.peer_validation = policy;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_close_notify_grace(mut self, grace: Duration) -> Self {
        self.close_notify_grace_ms = duration_to_ms(grace);
        self
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn inbound_io_timeout(&self) -> Option<Duration> {
        self.inbound_io_timeout_ms.map(Duration::from_millis)
    }

    pub fn inbound_read_timeout(&self) -> Option<Duration> {
        self.inbound_read_timeout_ms.map(Duration::from_millis)
    }

    pub fn outbound_io_timeout(&self) -> Option<Duration> {
        self.outbound_io_timeout_ms.map(Duration::from_millis)
    }

    pub fn peer_validation(&self) -> PeerValidationPolicy {
        self.peer_validation
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn close_notify_grace(&self) -> Duration {
        Duration::from_millis(self.close_notify_grace_ms)
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(detail: &str) -> SipsError {
    SipsError::InvalidConfig {
        detail: detail.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_asymmetric_deadlines() {
        let config = ChannelConfig::default();
        assert_eq!(config.inbound_io_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.inbound_read_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.outbound_io_timeout(), None);
        assert_eq!(config.peer_validation(), PeerValidationPolicy::Permissive);
        assert_eq!(config.bind_address().port(), 5061);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn toml_overrides_only_named_keys() {
        let config = ChannelConfig::from_toml_str(
            r#"
            bind_address = "127.0.0.1:15061"
            channel_name = "edge-tls"
            peer_validation = "strict"
            outbound_io_timeout_ms = 2500
            "#,
        )
        .expect("parse config");

        assert_eq!(config.channel_name(), "edge-tls");
        assert_eq!(config.bind_address().port(), 15061);
        assert_eq!(config.peer_validation(), PeerValidationPolicy::Strict);
        assert_eq!(config.outbound_io_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.inbound_io_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn toml_rejects_unknown_keys_and_bad_values() {
        let unknown = ChannelConfig::from_toml_str("backlog = 5").expect_err("unknown key");
        assert_eq!(unknown.code(), "spark.transport.sips.invalid_config");

        let empty_name = ChannelConfig::from_toml_str("channel_name = \"  \"")
            .expect_err("empty channel name");
        assert!(empty_name.to_string().contains("channel_name"));

        let zero_timeout =
            ChannelConfig::from_toml_str("inbound_io_timeout_ms = 0").expect_err("zero timeout");
        assert!(zero_timeout.to_string().contains("timeouts"));

        let zero_read =
            ChannelConfig::from_toml_str("inbound_read_timeout_ms = 0").expect_err("zero read");
        assert_eq!(zero_read.code(), "spark.transport.sips.invalid_config");
    }

    #[test]
    fn inbound_read_deadline_can_be_tuned_or_disabled() {
        let config = ChannelConfig::from_toml_str("inbound_read_timeout_ms = 30000").expect("parse");
        assert_eq!(config.inbound_read_timeout(), Some(Duration::from_secs(30)));

        let idle_tolerant = config.with_inbound_read_timeout(None);
        assert_eq!(idle_tolerant.inbound_read_timeout(), None);
        assert_eq!(idle_tolerant.inbound_io_timeout(), Some(Duration::from_secs(5)));
        idle_tolerant.validate().expect("valid");
    }
}
