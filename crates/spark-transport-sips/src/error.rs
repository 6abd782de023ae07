use std::{borrow::Cow, io, net::SocketAddr, sync::Arc};

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

use crate::connection::ConnectionRole;

/// SIPS 传输错误域。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“握手 / 接受 / 写入 / 关闭”等失败归档为稳定的错误码，使日志聚合与告警无需解析
///   `rustls` 或操作系统的原始文案；
/// - 区分**调用方可见**的失败（参数校验、生命周期）与**仅记录日志**的失败（单连接故障），
///   与通道“单连接故障不外溢”的传播策略保持一致。
///
/// ## 契约（What）
/// - `Configuration`：首次联系对端时缺少或提供了非法的期望证书名，同步返回给 `send` 调用方；
/// - `Handshake`：任一角色的 TLS 协商失败，仅丢弃该次连接尝试；
/// - `Transport`：接受循环或出站 TCP 建连失败；
/// - `Write`：向已注册连接写入失败，调用方会移除陈旧条目；
/// - `Shutdown`：`close()` 期间关闭监听器或单个连接失败，记录后跳过；
/// - `ChannelClosed`：通道关闭后的任何调用；
/// - `Bind`、`Credentials`、`InvalidConfig`：启动与构造阶段的错误，直接返回调用方；
/// - `Framing`：分帧缓冲越界或头部损坏，连接按断开处理。
///
/// ## 风险与权衡（Trade-offs）
/// - `io::Error` 以 `#[source]` 保存，`Display` 只拼接一层文案，避免日志重复；
/// - 超时统一折叠为 `io::ErrorKind::TimedOut`，不再单独设立变体。
#[derive(Debug, Error)]
pub enum SipsError {
    /// 首次联系对端所需的证书名缺失或非法。
    #[error("peer identity required to reach {peer}: {detail}")]
    Configuration {
        peer: SocketAddr,
        detail: Cow<'static, str>,
    },

    /// TLS 握手失败。
    #[error("tls handshake as {role} with {peer} failed: {source}")]
    Handshake {
        peer: SocketAddr,
        role: ConnectionRole,
        #[source]
        source: io::Error,
    },

    /// 接受循环或出站建连失败。
    #[error("{operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// 已注册连接写入失败。
    #[error("write to {peer} failed: {source}")]
    Write {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 关闭监听器或连接失败。
    #[error("closing {target} failed: {source}")]
    Shutdown {
        target: Cow<'static, str>,
        #[source]
        source: io::Error,
    },

    /// 通道已经关闭。
    #[error("channel `{channel}` is closed")]
    ChannelClosed { channel: Arc<str> },

    /// 监听地址绑定或 `listen` 失败。
    #[error("binding {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 证书或信任根无法装配为 TLS 配置。
    #[error("tls credentials rejected: {source}")]
    Credentials {
        #[source]
        source: RustlsError,
    },

    /// 通道配置非法。
    #[error("invalid channel configuration: {detail}")]
    InvalidConfig { detail: String },

    /// 分帧失败。
    #[error(transparent)]
    Framing(#[from] FramingError),
}

impl SipsError {
    /// 返回稳定错误码，供日志字段与告警规则引用。
    pub fn code(&self) -> &'static str {
        match self {
            SipsError::Configuration { .. } => "spark.transport.sips.configuration",
            SipsError::Handshake { .. } => "spark.transport.sips.handshake_failed",
            SipsError::Transport { .. } => "spark.transport.sips.transport_failed",
            SipsError::Write { .. } => "spark.transport.sips.write_failed",
            SipsError::Shutdown { .. } => "spark.transport.sips.shutdown_failed",
            SipsError::ChannelClosed { .. } => "spark.transport.sips.channel_closed",
            SipsError::Bind { .. } => "spark.transport.sips.bind_failed",
            SipsError::Credentials { .. } => "spark.transport.sips.credentials_rejected",
            SipsError::InvalidConfig { .. } => "spark.transport.sips.invalid_config",
            SipsError::Framing(err) => err.code(),
        }
    }

    /// 判断错误是否只影响单个连接或单次尝试。
    ///
    /// 返回 `true` 的错误在通道内部消化（记录日志后继续运行）；返回 `false` 的错误
    /// 需要调用方修正参数或生命周期。
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SipsError::Handshake { .. }
                | SipsError::Transport { .. }
                | SipsError::Write { .. }
                | SipsError::Shutdown { .. }
                | SipsError::Framing(_)
        )
    }

    pub(crate) fn missing_identity(peer: SocketAddr) -> Self {
        SipsError::Configuration {
            peer,
            detail: Cow::Borrowed("no registered connection and no expected peer name supplied"),
        }
    }
}

/// 分帧阶段错误。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// 单条消息（或尚未结束的头部）超过接收缓冲上限。
    #[error("message exceeds receive limit of {limit} bytes")]
    MessageTooLarge { limit: usize },

    /// 头部缺少合法的 `Content-Length` 数值。
    #[error("malformed Content-Length header: {value}")]
    InvalidContentLength { value: String },
}

impl FramingError {
    pub fn code(&self) -> &'static str {
        match self {
            FramingError::MessageTooLarge { .. } => "spark.transport.sips.framing.too_large",
            FramingError::InvalidContentLength { .. } => {
                "spark.transport.sips.framing.content_length"
            }
        }
    }
}

/// 描述一次底层操作的名称与稳定错误码。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.sips.accept_failed",
    message: "tcp accept",
};

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.sips.connect_failed",
    message: "tcp connect",
};

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.transport.sips.handshake_failed",
    message: "tls handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.sips.read_failed",
    message: "tls read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.sips.write_failed",
    message: "tls write",
};

pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.sips.shutdown_failed",
    message: "tls close_notify",
};

/// 握手失败的粗粒度成因，仅用于日志字段。
///
/// 对照 `rustls` 错误与 TLS Alert 区分证书问题、协议违规、超时与普通 I/O 故障，
/// 让运维可以直接按 `cause` 聚合。未穷举的错误统一视为 `io`。
pub(crate) fn handshake_cause(error: &io::Error) -> &'static str {
    if error.kind() == io::ErrorKind::TimedOut {
        return "timeout";
    }
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return rustls_cause(rustls_error);
    }
    match error.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => "peer_aborted",
        _ => "io",
    }
}

fn rustls_cause(error: &RustlsError) -> &'static str {
    use RustlsError::*;
    match error {
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => "certificate",
        AlertReceived(alert) => alert_cause(alert),
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | PeerIncompatible(_)
        | DecryptError
        | PeerSentOversizedRecord => "protocol",
        _ => "tls",
    }
}

fn alert_cause(alert: &AlertDescription) -> &'static str {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | CertificateRequired => "certificate",
        _ => "protocol",
    }
}
