use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
};

use crate::{
    config::ChannelConfig,
    connection::{BoxedReader, CloseReason, Connection, ConnectionRole, ConnectionSnapshot},
    dispatcher::{self, SendReceipt},
    endpoint::ChannelEndpoint,
    error::SipsError,
    events::ChannelEventHandler,
    framing::{FramerFactory, FramingBuffer, sip_framer_factory},
    listener,
    pump::ReceivePump,
    registry::ConnectionRegistry,
    tls::{ChannelCredentials, TlsContext},
};

/// 监听任务、握手任务、发送路径与接收泵共享的通道状态。
pub(crate) struct ChannelShared {
    name: Arc<str>,
    config: ChannelConfig,
    tls: TlsContext,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ChannelEventHandler>,
    framer_factory: FramerFactory,
    endpoint: OnceLock<ChannelEndpoint>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ChannelShared {
    pub(crate) fn new(
        config: ChannelConfig,
        credentials: ChannelCredentials,
        handler: Arc<dyn ChannelEventHandler>,
        framer_factory: FramerFactory,
    ) -> Result<Arc<Self>, SipsError> {
        config.validate()?;
        let tls = TlsContext::build(credentials, config.peer_validation())?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            name: Arc::from(config.channel_name()),
            config,
            tls,
            registry: Arc::new(ConnectionRegistry::new()),
            handler,
            framer_factory,
            endpoint: OnceLock::new(),
            closed: AtomicBool::new(false),
            shutdown,
        }))
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn tls(&self) -> &TlsContext {
        &self.tls
    }

    pub(crate) fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// 启动前返回配置的监听地址，启动后返回实际绑定地址。
    pub(crate) fn local_endpoint(&self) -> ChannelEndpoint {
        self.endpoint
            .get()
            .copied()
            .unwrap_or_else(|| ChannelEndpoint::new(self.config.bind_address()))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), SipsError> {
        if self.is_closed() {
            return Err(SipsError::ChannelClosed {
                channel: Arc::clone(&self.name),
            });
        }
        Ok(())
    }

    /// `false → true` 的唯一迁移；返回 `true` 表示本次调用完成了迁移。
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 注册握手完成的连接并启动其接收泵。
    ///
    /// 与 `close()` 并发时，插入后再次检查关闭标志：若通道已关闭则撤回注册并关闭连接，
    /// 保证关闭之后注册表中不会残留连接。
    pub(crate) fn activate(&self, connection: Arc<Connection>, reader: BoxedReader) {
        if let Some(displaced) = self.registry.insert(Arc::clone(&connection)) {
            tracing::debug!(
                channel = %self.name,
                peer = %connection.peer(),
                displaced = %displaced.id(),
                connection_id = %connection.id(),
                "existing connection for peer replaced"
            );
        }
        tracing::debug!(
            channel = %self.name,
            peer = %connection.peer(),
            connection_id = %connection.id(),
            role = %connection.role(),
            "connection registered"
        );

        let framing = FramingBuffer::new((self.framer_factory)());
        // 读截止时间只作用于入站连接。
        let read_timeout = match connection.role() {
            ConnectionRole::Accepted => self.config.inbound_read_timeout(),
            ConnectionRole::Initiated => None,
        };
        ReceivePump::new(
            Arc::clone(&self.name),
            Arc::clone(&connection),
            reader,
            framing,
            self.config.read_buffer_size(),
            read_timeout,
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
        )
        .spawn();

        if self.is_closed() && self.registry.remove_connection(&connection) {
            connection.request_close(CloseReason::LocalShutdown);
        }
    }
}

/// SIP over TLS 传输通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对上层协议引擎隐藏连接生命周期：上层只按对端地址发送字节并接收成帧消息，
///   入站接受、出站建连、连接复用与断开清理都在通道内部完成；
///
/// ## 逻辑（How）
/// - `start`：`socket2` 绑定（地址复用、backlog 1000）后启动常驻接受循环；没有服务端身份时跳过监听；
/// - `send*`：交由发送路由，优先排入已注册连接的写队列，否则在后台建立出站连接；
///   调用本身从不等待网络 I/O；
/// - `close`：一次性置位关闭标志，停止监听并释放套接字，清空注册表并尽力发送 `close_notify`。
///
/// ## 契约（What）
/// - 只有参数与生命周期错误返回给调用方，单连接故障记录日志后消化；
/// - 关闭不可逆，关闭后的 `send*` 与 `start` 返回 [`SipsError::ChannelClosed`]；
/// - 消息顺序只在单条连接内保证。
///
/// ## 风险与权衡（Trade-offs）
/// - 发送没有背压，停止读取的对端会让其写队列无限累积；
/// - `close` 不等待在途读写完成。
pub struct SipsChannel {
    shared: Arc<ChannelShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SipsChannel {
    /// 以默认 SIP 分帧器构造通道。
    pub fn new(
        config: ChannelConfig,
        credentials: ChannelCredentials,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> Result<Self, SipsError> {
        let framer = sip_framer_factory(config.max_message_size());
        Self::with_framer(config, credentials, handler, framer)
    }

    /// 以自定义分帧器构造通道。
    pub fn with_framer(
        config: ChannelConfig,
        credentials: ChannelCredentials,
        handler: Arc<dyn ChannelEventHandler>,
        framer_factory: FramerFactory,
    ) -> Result<Self, SipsError> {
        let shared = ChannelShared::new(config, credentials, handler, framer_factory)?;
        Ok(Self {
            shared,
            listener: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 绑定监听地址并启动接受循环，返回实际绑定的端点。
    pub async fn start(&self) -> Result<ChannelEndpoint, SipsError> {
        self.shared.ensure_open()?;
        if self.shared.endpoint.get().is_some() {
            return Err(SipsError::InvalidConfig {
                detail: format!("channel `{}` already started", self.shared.name),
            });
        }

        let Some(acceptor) = self.shared.tls.acceptor().cloned() else {
            let endpoint = ChannelEndpoint::new(self.shared.config.bind_address());
            let _ = self.shared.endpoint.set(endpoint);
            tracing::info!(
                channel = %self.shared.name,
                "no server identity configured; listener disabled"
            );
            return Ok(endpoint);
        };

        let bind_address = self.shared.config.bind_address();
        let listener = listener::bind(bind_address)?;
        let local = listener
            .local_addr()
            .map_err(|source| SipsError::Bind {
                addr: bind_address,
                source,
            })?;
        let endpoint = ChannelEndpoint::new(local);
        if self.shared.endpoint.set(endpoint).is_err() {
            return Err(SipsError::InvalidConfig {
                detail: format!("channel `{}` already started", self.shared.name),
            });
        }

        let handle = listener::spawn_accept_loop(
            Arc::clone(&self.shared),
            acceptor,
            listener,
            self.shared.shutdown.subscribe(),
        );
        *self.listener.lock() = Some(handle);
        tracing::info!(channel = %self.shared.name, endpoint = %endpoint, "listening");
        Ok(endpoint)
    }

    /// 向已注册连接发送；没有连接时返回 [`SipsError::Configuration`]。
    pub async fn send(&self, peer: SocketAddr, message: impl Into<Bytes>) -> Result<(), SipsError> {
        dispatcher::dispatch(&self.shared, peer, message.into(), None, None)
    }

    /// 发送并在需要时以 `peer_name` 为期望证书名建立出站连接。
    pub async fn send_with_peer_name(
        &self,
        peer: SocketAddr,
        message: impl Into<Bytes>,
        peer_name: &str,
    ) -> Result<(), SipsError> {
        dispatcher::dispatch(&self.shared, peer, message.into(), Some(peer_name), None)
    }

    /// 与 `send_with_peer_name` 相同，但返回可等待最终结果的回执。
    pub async fn send_tracked(
        &self,
        peer: SocketAddr,
        message: impl Into<Bytes>,
        peer_name: Option<&str>,
    ) -> Result<SendReceipt, SipsError> {
        let (sender, receipt) = dispatcher::receipt_pair(Arc::clone(&self.shared.name));
        dispatcher::dispatch(&self.shared, peer, message.into(), peer_name, Some(sender))?;
        Ok(receipt)
    }

    /// 关闭通道。幂等：只有首次调用执行关闭流程。
    pub async fn close(&self) {
        if !self.shared.mark_closed() {
            return;
        }
        tracing::info!(channel = %self.shared.name, "closing channel");
        self.shared.shutdown.send_replace(true);

        let accept_loop = self.listener.lock().take();
        if let Some(handle) = accept_loop
            && let Err(join_error) = handle.await
        {
            let error = SipsError::Shutdown {
                target: "listener".into(),
                source: io::Error::other(join_error),
            };
            tracing::warn!(channel = %self.shared.name, code = error.code(), error = %error, "listener shutdown failed");
        }

        let grace = self.shared.config.close_notify_grace();
        let mut closing = JoinSet::new();
        for connection in self.shared.registry.drain() {
            connection.request_close(CloseReason::LocalShutdown);
            closing.spawn(async move { connection.close_notify(grace).await });
        }
        while let Some(joined) = closing.join_next().await {
            let result = joined.map_err(|join_error| SipsError::Shutdown {
                target: "connection".into(),
                source: io::Error::other(join_error),
            });
            if let Err(error) = result.and_then(|closed| closed) {
                tracing::warn!(
                    channel = %self.shared.name,
                    code = error.code(),
                    error = %error,
                    "connection shutdown failed; skipped"
                );
            }
        }
        tracing::info!(channel = %self.shared.name, "channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn local_endpoint(&self) -> ChannelEndpoint {
        self.shared.local_endpoint()
    }

    /// 已注册连接的诊断快照。
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.shared
            .registry
            .snapshot()
            .iter()
            .map(|connection| connection.snapshot())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }
}

impl std::fmt::Debug for SipsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipsChannel")
            .field("name", &self.shared.name)
            .field("endpoint", &self.shared.local_endpoint())
            .field("connections", &self.shared.registry.len())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
