use std::{future::Future, io, time::Duration};

use crate::error::OperationKind;

/// 为单次 I/O 操作施加可选截止时间。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 入站连接的握手、读取与写入需要固定截止时间，出站连接默认没有；两条路径共用同一入口，
///   只通过 `deadline` 是否为 `None` 区分，避免在各处手写 `tokio::time::timeout`；
///
/// ## 契约（What）
/// - `deadline = None`：直接等待 `future` 完成；
/// - `deadline = Some(limit)`：超时后返回 `io::ErrorKind::TimedOut`，文案携带操作名与时长，
///   被丢弃的 `future` 负责释放自身资源；
/// - 成功或失败都原样返回 `future` 的 `io::Result`。
pub(crate) async fn run_with_deadline<F, T>(
    kind: OperationKind,
    deadline: Option<Duration>,
    future: F,
) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(kind, limit)),
        },
        None => future.await,
    }
}

fn timeout_error(kind: OperationKind, limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out after {:?}", kind.message, limit),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WRITE;

    #[tokio::test]
    async fn deadline_turns_stalled_future_into_timeout() {
        let stalled = std::future::pending::<io::Result<()>>();
        let err = run_with_deadline(WRITE, Some(Duration::from_millis(20)), stalled)
            .await
            .expect_err("pending future must time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(err.to_string().contains("tls write"));
    }

    #[tokio::test]
    async fn absent_deadline_waits_for_completion() {
        let value = run_with_deadline(WRITE, None, async { Ok::<_, io::Error>(7) })
            .await
            .expect("ready future");
        assert_eq!(value, 7);
    }
}
