//! Capability interface over the container runtime
//!
//! The controller and the status reporter only talk to the runtime through
//! [`RuntimeClient`]. [`crate::docker::DockerRuntime`] binds it to a Docker
//! daemon; `testing::FakeRuntime` keeps everything in memory.

use crate::error::{Error, Result};
use crate::nginx::BuildContext;
use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Observed state of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Runtime status string (`running`, `exited`, `created`, ...)
    pub state: String,
    pub running: bool,
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Observed state of a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    /// Number of attached containers
    pub containers: usize,
}

/// Parameters for creating and starting a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    /// Host ports, each bound to the same port inside the container
    pub port_bindings: Vec<u16>,
    /// The first network is the primary one; the rest are connected after create
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// List all containers, optionally filtered by a case-insensitive name substring
    async fn list_containers(&self, filter: Option<&str>) -> Result<Vec<ContainerInfo>>;

    /// Fails with `NotFound` when the container does not exist
    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo>;

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;

    /// Create the network if absent; returns its id
    async fn ensure_network(&self, name: &str) -> Result<String>;

    /// Attach a container to a network; no-op when already attached
    async fn connect(&self, container: &str, network: &str) -> Result<()>;

    /// Build an image from a generated context; returns the image id
    async fn build_image(&self, tag: &str, context: &BuildContext) -> Result<String>;

    /// Create and start a container; returns the container id
    async fn run_container(&self, spec: &RunSpec) -> Result<String>;

    /// Start an existing, stopped container
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Absent container is success
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Absent container is success
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<()>;

    /// Whether something inside the running container listens on `port`
    async fn accepts_connections(&self, name: &str, port: u16) -> Result<bool>;

    /// Finite unless `follow`; cancel or drop the stream to stop it
    async fn stream_logs(&self, name: &str, follow: bool, tail: usize) -> Result<LogStream>;
}

/// Shared runtime handle, safe for concurrent use by read and write paths
pub type DynRuntime = Arc<dyn RuntimeClient>;

/// Run a runtime call with an upper bound. Timeout is reported as
/// `RuntimeUnavailable`.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::unavailable(
            operation,
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}

/// Map `NotFound` to `None`
pub fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// A lazy, cancellable sequence of log lines.
///
/// Lines are produced by a background task; [`LogStream::cancel`] or dropping
/// the stream signals the producer to stop and release its connection.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<Result<String>>,
    cancel: watch::Sender<bool>,
}

/// Producer half of a [`LogStream`]
#[derive(Debug)]
pub struct LogSink {
    tx: mpsc::Sender<Result<String>>,
    cancelled: watch::Receiver<bool>,
}

impl LogStream {
    pub fn channel(buffer: usize) -> (LogSink, LogStream) {
        let (tx, rx) = mpsc::channel(buffer);
        let (cancel, cancelled) = watch::channel(false);
        (LogSink { tx, cancelled }, LogStream { rx, cancel })
    }

    /// A finite stream over already collected lines
    pub fn from_lines<I>(lines: I) -> LogStream
    where
        I: IntoIterator<Item = String>,
    {
        let lines: Vec<String> = lines.into_iter().collect();
        let (sink, stream) = LogStream::channel(lines.len().max(1));
        for line in lines {
            // capacity covers every line
            let _ = sink.tx.try_send(Ok(line));
        }
        stream
    }

    pub async fn next_line(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }

    /// Stop the producer. Lines already buffered can still be read.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

impl Stream for LogStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl LogSink {
    /// Send one line, waiting for buffer space. Returns false once the
    /// consumer is gone or cancelled, including while blocked on a full buffer.
    pub async fn send(&self, line: Result<String>) -> bool {
        if *self.cancelled.borrow() {
            return false;
        }
        tokio::select! {
            _ = self.cancelled() => false,
            sent = self.tx.send(line) => sent.is_ok(),
        }
    }

    /// Resolves when the consumer cancels or drops the stream
    pub async fn cancelled(&self) {
        let mut cancelled = self.cancelled.clone();
        loop {
            if *cancelled.borrow() || self.tx.is_closed() {
                return;
            }
            tokio::select! {
                changed = cancelled.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.tx.closed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_from_lines_is_finite() {
        let mut stream = LogStream::from_lines(vec!["a".to_string(), "b".to_string()]);

        assert_eq!(stream.next_line().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
        assert!(stream.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_producer() {
        let (sink, stream) = LogStream::channel(4);

        let producer = tokio::spawn(async move {
            let mut sent = 0;
            loop {
                tokio::select! {
                    _ = sink.cancelled() => break,
                    ok = sink.send(Ok(format!("line {sent}"))) => {
                        if !ok {
                            break;
                        }
                        sent += 1;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            }
            sent
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.cancel();
        assert!(stream.is_cancelled());

        let result = tokio::time::timeout(Duration::from_secs(1), producer).await;
        assert!(result.is_ok(), "producer did not stop after cancel");
    }

    #[tokio::test]
    async fn test_cancel_releases_producer_blocked_on_full_buffer() {
        let (sink, stream) = LogStream::channel(1);
        assert!(sink.send(Ok("fills the buffer".to_string())).await);

        let producer = tokio::spawn(async move { sink.send(Ok("blocked".to_string())).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        stream.cancel();
        let sent = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer still blocked after cancel")
            .unwrap();
        assert!(!sent);
        drop(stream);
    }

    #[tokio::test]
    async fn test_drop_stops_producer() {
        let (sink, stream) = LogStream::channel(1);
        drop(stream);

        let result = tokio::time::timeout(Duration::from_secs(1), sink.cancelled()).await;
        assert!(result.is_ok());
        assert!(!sink.send(Ok("late".to_string())).await);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_to_unavailable() {
        let result: Result<()> = with_timeout("inspect_container", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::RuntimeUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_found_maps_not_found_to_none() {
        assert_eq!(found::<u8>(Err(Error::not_found("container", "x"))).unwrap(), None);
        assert_eq!(found(Ok(3u8)).unwrap(), Some(3));
        assert!(found::<u8>(Err(Error::Validation("bad".to_string()))).is_err());
    }
}
