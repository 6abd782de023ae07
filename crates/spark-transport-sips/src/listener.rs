use std::{io, net::SocketAddr, sync::Arc};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    channel::ChannelShared,
    config::LISTEN_BACKLOG,
    connection::{ConnectionRole, Handshake},
    error::{self, SipsError},
    util::run_with_deadline,
};

/// 以地址复用与固定队列深度绑定监听套接字。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `TcpListener::bind` 无法设置 `SO_REUSEADDR` 与 backlog，这里经由 `socket2` 手工完成
///   `socket → setsockopt → bind → listen`，再交给 Tokio；
///
/// ## 契约（What）
/// - 任一步骤失败都返回 [`SipsError::Bind`]，携带目标地址；
/// - **前置条件**：调用方位于 Tokio 运行时内（`from_std` 需要反应器）。
pub(crate) fn bind(addr: SocketAddr) -> Result<TcpListener, SipsError> {
    let bind_error = move |source: io::Error| SipsError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
    TcpListener::from_std(socket.into()).map_err(bind_error)
}

/// 启动常驻接受循环。
///
/// 循环在 `shutdown` 置位（或发送端被丢弃）时退出并释放监听套接字；接受失败同样终止循环，
/// 已建立的连接不受影响。每个入站套接字在独立任务中完成握手。
pub(crate) fn spawn_accept_loop(
    shared: Arc<ChannelShared>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handshake_inbound(
                            Arc::clone(&shared),
                            acceptor.clone(),
                            stream,
                            peer,
                        ));
                    }
                    Err(source) => {
                        let error = SipsError::Transport {
                            operation: error::ACCEPT.message,
                            source,
                        };
                        tracing::error!(
                            channel = %shared.name(),
                            code = error::ACCEPT.code,
                            error = %error,
                            "accept loop terminated; existing connections stay usable"
                        );
                        break;
                    }
                },
            }
        }
        drop(listener);
        tracing::info!(channel = %shared.name(), "listener stopped");
    })
}

async fn handshake_inbound(
    shared: Arc<ChannelShared>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let attempt = Handshake::begin(peer, ConnectionRole::Accepted);
    let deadline = shared.config().inbound_io_timeout();
    tracing::debug!(
        channel = %shared.name(),
        peer = %peer,
        state = ?attempt.state(),
        "inbound tls handshake started"
    );

    match run_with_deadline(error::HANDSHAKE, deadline, acceptor.accept(stream)).await {
        Ok(tls) => {
            let server_name = tls.get_ref().1.server_name().map(str::to_owned);
            tracing::debug!(
                channel = %shared.name(),
                peer = %peer,
                sni = server_name.as_deref().unwrap_or("-"),
                elapsed = ?attempt.elapsed(),
                "inbound tls handshake completed"
            );
            let (reader, writer) = tokio::io::split(tls);
            let connection = attempt.establish(Box::new(writer), deadline, server_name);
            shared.activate(connection, Box::new(reader));
        }
        Err(source) => {
            let cause = error::handshake_cause(&source);
            let error = SipsError::Handshake {
                peer: attempt.peer(),
                role: attempt.role(),
                source,
            };
            tracing::warn!(
                channel = %shared.name(),
                peer = %peer,
                code = error::HANDSHAKE.code,
                cause,
                error = %error,
                "inbound tls handshake failed; socket dropped"
            );
        }
    }
}
