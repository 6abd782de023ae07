use std::{io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{
    net::{TcpSocket, TcpStream},
    sync::oneshot,
};

use crate::{
    channel::ChannelShared,
    connection::{CloseReason, Connection, ConnectionRole, Handshake},
    dispatcher::SendOutcome,
    error::{self, SipsError},
    tls::ExpectedPeerName,
    util::run_with_deadline,
};

pub(crate) type ReceiptSender = oneshot::Sender<Result<SendOutcome, SipsError>>;

/// 在后台建立出站连接并发送首条消息。
///
/// 调用方已完成同步校验（通道未关闭、期望证书名合法）；此后的任何失败只记录日志，
/// 若调用方要求回执则通过 `receipt` 交付。
pub(crate) fn spawn_connect_and_send(
    shared: Arc<ChannelShared>,
    peer: SocketAddr,
    message: Bytes,
    expected: ExpectedPeerName,
    receipt: Option<ReceiptSender>,
) {
    tokio::spawn(async move {
        let result = connect_and_send(&shared, peer, &message, expected).await;
        if let Err(error) = &result {
            tracing::warn!(
                channel = %shared.name(),
                peer = %peer,
                code = error.code(),
                error = %error,
                bytes = message.len(),
                "outbound send failed; message dropped"
            );
        }
        if let Some(receipt) = receipt {
            let _ = receipt.send(result);
        }
    });
}

/// 建连 → 握手 → 注册 → 启动接收泵 → 写入，严格按此顺序。
pub(crate) async fn connect_and_send(
    shared: &Arc<ChannelShared>,
    peer: SocketAddr,
    message: &[u8],
    expected: ExpectedPeerName,
) -> Result<SendOutcome, SipsError> {
    let connection = connect(shared, peer, expected).await?;
    if let Err(error) = connection.write(message).await {
        shared.registry().remove_connection(&connection);
        connection.request_close(CloseReason::WriteFailed);
        return Err(error);
    }
    Ok(SendOutcome::Established)
}

async fn connect(
    shared: &Arc<ChannelShared>,
    peer: SocketAddr,
    expected: ExpectedPeerName,
) -> Result<Arc<Connection>, SipsError> {
    let deadline = shared.config().outbound_io_timeout();
    let stream = run_with_deadline(error::CONNECT, deadline, open_tcp(shared, peer))
        .await
        .map_err(|source| {
            tracing::debug!(peer = %peer, code = error::CONNECT.code, "tcp connect failed");
            SipsError::Transport {
                operation: error::CONNECT.message,
                source,
            }
        })?;

    let attempt = Handshake::begin(peer, ConnectionRole::Initiated);
    let ExpectedPeerName { name, server_name } = expected;
    tracing::debug!(
        channel = %shared.name(),
        peer = %peer,
        server_name = %name,
        state = ?attempt.state(),
        "outbound tls handshake started"
    );
    let tls = run_with_deadline(
        error::HANDSHAKE,
        deadline,
        shared.tls().connector().connect(server_name, stream),
    )
    .await
    .map_err(|source| {
        tracing::debug!(
            peer = %peer,
            code = error::HANDSHAKE.code,
            cause = error::handshake_cause(&source),
            "outbound tls handshake failed"
        );
        SipsError::Handshake {
            peer: attempt.peer(),
            role: attempt.role(),
            source,
        }
    })?;
    tracing::debug!(
        channel = %shared.name(),
        peer = %peer,
        elapsed = ?attempt.elapsed(),
        "outbound tls handshake completed"
    );

    let (reader, writer) = tokio::io::split(tls);
    let connection = attempt.establish(Box::new(writer), deadline, Some(name));
    shared.activate(Arc::clone(&connection), Box::new(reader));
    Ok(connection)
}

/// 从本地端点 IP 发起 TCP 连接，端口由内核分配。
///
/// 监听端口已被占用，Linux 在未启用 `SO_REUSEPORT` 时不允许再次绑定同一端口。
async fn open_tcp(shared: &ChannelShared, peer: SocketAddr) -> io::Result<TcpStream> {
    let socket = if peer.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(source) = shared.local_endpoint().outbound_source(peer) {
        socket.bind(source)?;
    }
    let stream = socket.connect(peer).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
