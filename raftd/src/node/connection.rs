use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use raftd_api::{frame_body_len, FrameError, Message, FRAME_HEADER_SIZE};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

use super::acceptor::Acceptor;
use super::Node;
use crate::sync::Synchronized;
use crate::task::spawn_guarded;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("node is gone")]
    NodeGone,
}

impl ConnectionError {
    /// The peer just closed the connection
    pub fn is_eof(&self) -> bool {
        matches!(self, ConnectionError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

#[derive(TypedBuilder, Debug, Clone)]
pub struct ConnectionParameters {
    /// Delay before dialing a disconnected neighbour again
    #[builder(default = ConnectionParameters::DEFAULT_RETRY)]
    pub retry: Duration,

    /// How long a single connect attempt may take
    #[builder(default = ConnectionParameters::DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
}

impl ConnectionParameters {
    pub const DEFAULT_RETRY: Duration = Duration::from_millis(100);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Dialed by us; carries our requests and the peer's responses
#[derive(Debug)]
pub struct Outgoing {
    endpoint: SocketAddr,
    outbox_tx: flume::Sender<Message>,
    outbox_rx: flume::Receiver<Message>,
    /// Closes when the node is dropped
    node_alive: watch::Receiver<()>,
}

/// Accepted by us; carries the peer's requests and our responses
#[derive(Debug)]
pub struct Incoming {
    acceptor: Weak<Acceptor>,
    /// Set once accepted, cleared when torn down
    remote: Synchronized<Option<SocketAddr>>,
}

/// One peer link
///
/// The spawned task owns the connection; the node's tables only keep weak
/// references to it. An established incoming link keeps the node alive
/// while it serves requests. An outgoing link only refers to the node
/// weakly and is torn down once the node is gone.
#[derive(Debug)]
pub struct Connection<D> {
    node: Weak<Node>,
    params: ConnectionParameters,
    direction: D,
}

impl<D> Connection<D> {
    fn node(&self) -> ConnectionResult<Arc<Node>> {
        self.node.upgrade().ok_or(ConnectionError::NodeGone)
    }
}

impl Connection<Outgoing> {
    /// Start dialing `endpoint`
    ///
    /// The outcome is reported to the node through `on_connected`
    /// and `on_disconnected`, never to the caller.
    pub fn create(node: &Node, endpoint: SocketAddr) -> Arc<Self> {
        let (outbox_tx, outbox_rx) = flume::unbounded();
        let conn = Arc::new(Self {
            node: node.weak_self.clone(),
            params: node.params.connection.clone(),
            direction: Outgoing {
                endpoint,
                outbox_tx,
                outbox_rx,
                node_alive: node.alive_tx.subscribe(),
            },
        });

        spawn_guarded(
            &node.rt,
            "connection-outgoing",
            node.is_shutting_down.clone(),
            conn.clone().run(),
        );

        conn
    }

    pub fn get_endpoint(&self) -> Option<SocketAddr> {
        Some(self.direction.endpoint)
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.direction.endpoint
    }

    /// Queue `msg` to be sent to the peer
    pub fn send(&self, msg: Message) {
        // can't fail: we hold the receiving side ourselves
        let _ = self.direction.outbox_tx.send(msg);
    }

    async fn run(self: Arc<Self>) {
        let endpoint = self.direction.endpoint;
        debug!(%endpoint, "Connecting to peer");

        let stream = match timeout(self.params.connect_timeout, TcpStream::connect(endpoint)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%endpoint, "Failed to connect to peer: {e}");
                self.disconnected();
                return;
            }
            Err(_e) => {
                warn!(%endpoint, "Failed to connect to peer: timeout");
                self.disconnected();
                return;
            }
        };

        match self.node() {
            Ok(node) => node.on_connected(&self),
            Err(_) => return,
        }

        match self.exchange(stream).await {
            Ok(()) => {}
            Err(e) if e.is_eof() => info!(%endpoint, "Peer closed the connection"),
            Err(ConnectionError::NodeGone) => {
                debug!(%endpoint, "Node is gone, closing peer connection");
                return;
            }
            Err(e) => warn!(%endpoint, "Peer connection error: {e}"),
        }
        self.disconnected();
    }

    fn disconnected(self: &Arc<Self>) {
        if let Some(node) = self.node.upgrade() {
            node.on_disconnected(self);
        }
    }

    async fn exchange(&self, stream: TcpStream) -> ConnectionResult<()> {
        // frames are written whole
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let mut node_alive = self.direction.node_alive.clone();
        tokio::select! {
            res = self.read_responses(reader) => res,
            res = self.write_requests(writer) => res,
            // nothing is ever sent, so this only returns once the node is dropped
            _ = node_alive.changed() => Err(ConnectionError::NodeGone),
        }
    }

    async fn read_responses(&self, mut reader: OwnedReadHalf) -> ConnectionResult<()> {
        loop {
            let msg = read_message(&mut reader).await?;
            trace!(endpoint = %self.direction.endpoint, kind = %msg.kind(), "Received");
            self.node()?.handle_response(self.direction.endpoint, msg);
        }
    }

    async fn write_requests(&self, mut writer: OwnedWriteHalf) -> ConnectionResult<()> {
        loop {
            let Ok(msg) = self.direction.outbox_rx.recv_async().await else {
                return Ok(());
            };
            trace!(endpoint = %self.direction.endpoint, kind = %msg.kind(), "Sending");
            write_message(&mut writer, &msg).await?;
        }
    }
}

impl Connection<Incoming> {
    /// Start waiting for the next connection on the node's acceptor
    ///
    /// Once a connection is accepted, another incoming connection is
    /// created right away, so accepting continues without the caller.
    /// Both the pending accept and the established link keep the node alive.
    pub fn create(node: &Arc<Node>) -> Arc<Self> {
        let conn = Arc::new(Self {
            node: Arc::downgrade(node),
            params: node.params.connection.clone(),
            direction: Incoming {
                acceptor: Arc::downgrade(&node.acceptor),
                remote: Synchronized::new(None),
            },
        });

        spawn_guarded(
            &node.rt,
            "connection-incoming",
            node.is_shutting_down.clone(),
            conn.clone().run(node.clone()),
        );

        conn
    }

    /// Remote address, if still connected
    pub fn get_endpoint(&self) -> Option<SocketAddr> {
        self.direction.remote.read_copy()
    }

    async fn run(self: Arc<Self>, node: Arc<Node>) {
        let Some(acceptor) = self.direction.acceptor.upgrade() else {
            return;
        };

        let (stream, remote) = match acceptor.accept().await {
            Ok(Some(accepted)) => accepted,
            Ok(None) => {
                debug!("Acceptor closed");
                return;
            }
            Err(e) => {
                // no re-arming; accepting stays stopped
                warn!("Accept failed: {e}");
                return;
            }
        };
        drop(acceptor);

        Connection::<Incoming>::create(&node);

        info!(%remote, "New peer connection");
        self.direction.remote.apply(|r| *r = Some(remote));
        let _guard = scopeguard::guard((), |_| {
            self.direction.remote.apply(|r| *r = None);
            debug!(%remote, "Incoming connection is done");
        });

        match Self::serve(&node, stream).await {
            Ok(()) => {}
            Err(e) if e.is_eof() => debug!(%remote, "Peer closed the connection"),
            Err(e) => warn!(%remote, "Peer connection error: {e}"),
        }
    }

    async fn serve(node: &Arc<Node>, mut stream: TcpStream) -> ConnectionResult<()> {
        stream.set_nodelay(true)?;

        loop {
            let msg = read_message(&mut stream).await?;
            let response = node.handle_request(msg);
            if let Some(response) = response {
                write_message(&mut stream, &response).await?;
            }
        }
    }
}

pub async fn read_message<R>(reader: &mut R) -> ConnectionResult<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = frame_body_len(header)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Message::from_frame_body(&body)?)
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> ConnectionResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = msg.to_frame()?;
    writer.write_all(&frame).await?;
    Ok(())
}
