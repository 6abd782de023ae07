use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, Notify, mpsc, watch},
};

use crate::{
    dispatcher::QueuedWrite,
    error::{self, SipsError},
    util::run_with_deadline,
};

/// 握手完成后的读半部，交给接收泵独占。
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// 握手完成后的写半部，由连接记录持有并以互斥锁串行化写入。
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// 连接实例标识。
///
/// 同一对端地址可能先后对应多条连接，移除注册表条目时以该标识区分新旧实例。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sips-conn-{}", self.0)
    }
}

/// 连接由哪一侧发起。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// 监听器接受的入站连接，本端扮演 TLS 服务端。
    Accepted,
    /// 出站连接器建立的连接，本端扮演 TLS 客户端。
    Initiated,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionRole::Accepted => "server",
            ConnectionRole::Initiated => "client",
        })
    }
}

/// 单连接生命周期状态机。
///
/// ```text
/// Handshaking ──► Active ──► Closing ──► Closed
///                   └───────────────────────▲
/// ```
///
/// `Handshaking` 由 [`Handshake`] 类型承载，连接记录只在握手成功后出现，因此记录本身从
/// `Active` 开始；后续迁移均为单向，`Closed` 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Handshaking => 0,
            ConnectionState::Active => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }
}

/// 连接结束的原因，随 `ConnectionClosed` 事件上报。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端发送 EOF。
    PeerClosed,
    /// 读取失败（复位、TLS 错误等）。
    ReadFailed,
    /// 写入失败后由发送路径摘除。
    WriteFailed,
    /// 接收数据违反分帧约束。
    FramingViolation,
    /// 本端调用 `close()`。
    LocalShutdown,
}

/// 握手阶段的连接尝试。
///
/// 持有对端地址、角色与起始时间；握手成功后通过 [`Handshake::establish`] 转换为
/// `Active` 的 [`Connection`]，失败时直接丢弃。
#[derive(Debug)]
pub(crate) struct Handshake {
    peer: SocketAddr,
    role: ConnectionRole,
    started_at: Instant,
}

impl Handshake {
    pub(crate) fn begin(peer: SocketAddr, role: ConnectionRole) -> Self {
        Self {
            peer,
            role,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::Handshaking
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn role(&self) -> ConnectionRole {
        self.role
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn establish(
        self,
        writer: BoxedWriter,
        io_timeout: Option<Duration>,
        server_name: Option<String>,
    ) -> Arc<Connection> {
        let (write_queue, pending) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);
        Arc::new(Connection {
            id: ConnectionId::next(),
            peer: self.peer,
            role: self.role,
            state: AtomicU8::new(ConnectionState::Active.as_u8()),
            writer: AsyncMutex::new(writer),
            io_timeout,
            created_at: self.started_at,
            last_activity: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            server_name,
            shutdown: Notify::new(),
            closing,
            write_queue,
            pending_queue: Mutex::new(Some(pending)),
        })
    }
}

/// 已建立的 TLS 连接记录。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 注册表、发送路径与接收泵共享同一条连接，需要一个既能串行化写入、又能跨任务通知
///   关闭的载体；
/// - 读半部交由接收泵独占，写半部留在记录内，避免读写互相阻塞。
///
/// ## 契约（What）
/// - `queue_write`：发送路径只把消息放入本连接的写队列，由单个写任务按入队顺序写出，
///   发送方从不等待对端；
/// - `write`：串行写入完整消息并刷新，受本连接的写截止时间约束（入站默认 5 秒，出站默认无）；
/// - `request_close`：记录关闭原因，唤醒接收泵并打断在途写入，只有首个原因生效；
/// - `close_notify`：尽力发送 TLS `close_notify`，写锁被在途写入占用时直接跳过；
/// - 状态迁移单向，`Closed` 之后不再变化。
///
/// ## 风险与权衡（Trade-offs）
/// - 写队列没有上限，停止读取的对端会让排队消息无限累积，直到截止时间或 `close()` 介入；
/// - `close_notify` 不等待在途写入完成，关闭是粗暴而非优雅的。
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    role: ConnectionRole,
    state: AtomicU8,
    writer: AsyncMutex<BoxedWriter>,
    io_timeout: Option<Duration>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    close_reason: Mutex<Option<CloseReason>>,
    server_name: Option<String>,
    shutdown: Notify,
    closing: watch::Sender<bool>,
    write_queue: mpsc::UnboundedSender<QueuedWrite>,
    pending_queue: Mutex<Option<mpsc::UnboundedReceiver<QueuedWrite>>>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// 取走写队列的接收端；只有第一次调用返回 `Some`，由调用方启动写任务。
    pub(crate) fn take_write_queue(&self) -> Option<mpsc::UnboundedReceiver<QueuedWrite>> {
        self.pending_queue.lock().take()
    }

    /// 写入排队，不等待 I/O；写任务已退出时原样退回。
    pub(crate) fn queue_write(&self, write: QueuedWrite) -> Result<(), QueuedWrite> {
        self.write_queue
            .send(write)
            .map_err(|rejected| rejected.0)
    }

    /// 写入一条完整消息并刷新 TLS 缓冲。
    pub(crate) async fn write(&self, message: &[u8]) -> Result<(), SipsError> {
        let mut writer = self.writer.lock().await;
        run_with_deadline(error::WRITE, self.io_timeout, async {
            writer.write_all(message).await?;
            writer.flush().await
        })
        .await
        .map_err(|source| SipsError::Write {
            peer: self.peer,
            source,
        })?;
        drop(writer);
        self.touch();
        Ok(())
    }

    /// 请求关闭连接并唤醒接收泵。
    ///
    /// 返回 `true` 表示本次调用完成了 `Active → Closing` 迁移。
    pub(crate) fn request_close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        let transitioned = self
            .state
            .compare_exchange(
                ConnectionState::Active.as_u8(),
                ConnectionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        // `notify_one` 会保留许可，接收泵即使尚未进入等待也不会错过。
        self.shutdown.notify_one();
        self.closing.send_replace(true);
        transitioned
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub(crate) async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    /// 在 `request_close` 之后完成；调用前已请求关闭时立即完成。
    pub(crate) async fn closing(&self) {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|requested| *requested).await;
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
    }

    /// 尽力发送 TLS `close_notify`。
    pub(crate) async fn close_notify(&self, grace: Duration) -> Result<(), SipsError> {
        let Ok(mut writer) = self.writer.try_lock() else {
            tracing::debug!(
                peer = %self.peer,
                connection_id = %self.id,
                "write in flight; skipping close_notify"
            );
            return Ok(());
        };
        run_with_deadline(error::SHUTDOWN, Some(grace), writer.shutdown())
            .await
            .map_err(|source| SipsError::Shutdown {
                target: format!("connection {} ({})", self.id, self.peer).into(),
                source,
            })
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let now = Instant::now();
        ConnectionSnapshot {
            id: self.id,
            peer: self.peer,
            role: self.role,
            state: self.state(),
            age: now.saturating_duration_since(self.created_at),
            idle: now.saturating_duration_since(self.last_activity()),
            server_name: self.server_name.clone(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// 连接的只读诊断视图。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub role: ConnectionRole,
    pub state: ConnectionState,
    pub age: Duration,
    pub idle: Duration,
    /// 入站连接为对端提供的 SNI，出站连接为期望证书名。
    pub server_name: Option<String>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::AsyncWrite;

    use super::*;

    /// 所有写操作都以连接复位失败的写半部。
    pub(crate) struct ResetWriter;

    impl AsyncWrite for ResetWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    pub(crate) fn connection(peer: &str, role: ConnectionRole, writer: BoxedWriter) -> Arc<Connection> {
        let peer: SocketAddr = peer.parse().expect("peer addr");
        Handshake::begin(peer, role).establish(writer, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{ResetWriter, connection};
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn write_reaches_peer_and_refreshes_activity() {
        let (local, mut remote) = tokio::io::duplex(256);
        let (_, writer) = tokio::io::split(local);
        let conn = connection("10.0.0.5:5061", ConnectionRole::Initiated, Box::new(writer));
        let before = conn.last_activity();

        conn.write(b"OPTIONS sip:a SIP/2.0\r\n\r\n")
            .await
            .expect("write");

        let mut received = vec![0u8; 25];
        remote.read_exact(&mut received).await.expect("read");
        assert_eq!(&received, b"OPTIONS sip:a SIP/2.0\r\n\r\n");
        assert!(conn.last_activity() >= before);
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn failed_write_reports_peer() {
        let conn = connection("10.0.0.6:5061", ConnectionRole::Accepted, Box::new(ResetWriter));
        let err = conn.write(b"x").await.expect_err("reset");
        assert!(matches!(err, SipsError::Write { peer, .. } if peer == conn.peer()));
    }

    #[test]
    fn first_close_reason_wins_and_state_is_monotonic() {
        let conn = connection("10.0.0.7:5061", ConnectionRole::Accepted, Box::new(ResetWriter));
        assert!(conn.request_close(CloseReason::WriteFailed));
        assert!(!conn.request_close(CloseReason::LocalShutdown));
        assert_eq!(conn.close_reason(), Some(CloseReason::WriteFailed));
        assert_eq!(conn.state(), ConnectionState::Closing);

        conn.mark_closed();
        assert!(!conn.request_close(CloseReason::PeerClosed));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn handshake_reports_handshaking_until_established() {
        let peer: SocketAddr = "10.0.0.8:5061".parse().expect("addr");
        let attempt = Handshake::begin(peer, ConnectionRole::Initiated);
        assert_eq!(attempt.state(), ConnectionState::Handshaking);
        let conn = attempt.establish(Box::new(ResetWriter), None, Some("sip.example.com".into()));
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Active);
        assert_eq!(snapshot.role, ConnectionRole::Initiated);
        assert_eq!(snapshot.server_name.as_deref(), Some("sip.example.com"));
    }

    #[tokio::test]
    async fn close_request_releases_waiters_even_when_issued_first() {
        let conn = connection("10.0.0.10:5061", ConnectionRole::Accepted, Box::new(ResetWriter));
        let waiter = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.closing().await }
        });
        conn.request_close(CloseReason::LocalShutdown);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("join");
        tokio::time::timeout(Duration::from_secs(1), conn.closing())
            .await
            .expect("already closing");
    }

    #[test]
    fn write_queue_is_handed_out_once() {
        let conn = connection("10.0.0.11:5061", ConnectionRole::Initiated, Box::new(ResetWriter));
        assert!(conn.take_write_queue().is_some());
        assert!(conn.take_write_queue().is_none());
    }

    #[tokio::test]
    async fn close_notify_failure_is_a_shutdown_error() {
        let conn = connection("10.0.0.9:5061", ConnectionRole::Accepted, Box::new(ResetWriter));
        let err = conn
            .close_notify(Duration::from_millis(50))
            .await
            .expect_err("reset");
        assert_eq!(err.code(), "spark.transport.sips.shutdown_failed");
    }
}
