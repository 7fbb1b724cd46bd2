use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tonic::transport::server::{Connected, TcpConnectInfo};
use tracing::{debug, warn};

use crate::server::registry::NodeRegistry;

/// Transport-level connection hook.
///
/// Sees sockets open and close independently of any stream's own read
/// errors, so a node whose socket dies without a clean stream error is
/// still taken down. Racing the read loop is fine: `node_down` fires once.
#[derive(Debug, Clone)]
pub struct ConnectionObserver {
    registry: Arc<NodeRegistry>,
}

impl ConnectionObserver {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    pub fn on_open(&self, remote: SocketAddr) {
        debug!(address = %remote, "Connection opened");
    }

    pub fn on_close(&self, remote: SocketAddr) {
        let address = remote.to_string();
        if self.registry.node_down(&address) {
            debug!(address = %address, "Connection closed, node removed");
        } else {
            debug!(address = %address, "Connection closed");
        }
    }
}

/// An accepted TCP connection that reports its close to a
/// [`ConnectionObserver`] when tonic drops it.
pub struct ObservedConnection {
    inner: TcpStream,
    remote: SocketAddr,
    observer: ConnectionObserver,
}

impl ObservedConnection {
    fn new(inner: TcpStream, remote: SocketAddr, observer: ConnectionObserver) -> Self {
        observer.on_open(remote);
        Self {
            inner,
            remote,
            observer,
        }
    }
}

impl Drop for ObservedConnection {
    fn drop(&mut self) {
        self.observer.on_close(self.remote);
    }
}

impl Connected for ObservedConnection {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

impl AsyncRead for ObservedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ObservedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Accept loop handed to tonic. Accept errors (e.g. running out of file
/// descriptors) are logged and retried instead of ending the server.
pub(crate) fn incoming(
    listener: TcpListener,
    observer: ConnectionObserver,
) -> impl Stream<Item = io::Result<ObservedConnection>> {
    async_stream::stream! {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(address = %remote, error = %e, "Failed to set TCP_NODELAY");
                    }
                    yield Ok(ObservedConnection::new(stream, remote, observer.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::NodeIdentity;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_close_takes_node_down_once() {
        let registry = Arc::new(NodeRegistry::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.set_down_observer(Arc::new(move |_: &str, address: &str| {
            let _ = tx.send(address.to_owned());
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let mut accepted = Box::pin(incoming(
            listener,
            ConnectionObserver::new(Arc::clone(&registry)),
        ));

        let client = TcpStream::connect(local).await.unwrap();
        let conn = accepted.next().await.unwrap().unwrap();
        let address = client.local_addr().unwrap().to_string();
        assert_eq!(conn.connect_info().remote_addr(), Some(client.local_addr().unwrap()));

        let (sink, _sink_rx) = mpsc::channel(1);
        registry.node_up(&address, NodeIdentity::default(), sink).unwrap();

        drop(conn);
        // A second trigger for the same disconnect is a no-op.
        assert!(!registry.node_down(&address));

        assert_eq!(rx.recv().await.unwrap(), address);
        assert!(registry.get_by_address(&address).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_observer_debug_shows_registry() {
        let observer = ConnectionObserver::new(Arc::new(NodeRegistry::default()));
        let printed = format!("{observer:?}");
        assert!(printed.contains("NodeRegistry"));
        assert!(printed.contains("nodes: 0"));
    }
}
