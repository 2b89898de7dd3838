use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::sync::Synchronized;

/// Listening socket of the node
///
/// Accepting is done one connection at a time; whoever gets a connection
/// out of [`Acceptor::accept`] is responsible for asking for the next one.
#[derive(Debug)]
pub struct Acceptor {
    local_addr: SocketAddr,
    /// `None` once closed
    listener: Synchronized<Option<Arc<TcpListener>>>,
    closed_tx: watch::Sender<bool>,
}

impl Acceptor {
    pub const BACKLOG: u32 = 1024;

    /// Bind and start listening
    ///
    /// Must be called from within a runtime context.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(Self::BACKLOG)?;
        let local_addr = listener.local_addr()?;

        info!(%local_addr, "Listening");

        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            listener: Synchronized::new(Some(Arc::new(listener))),
            closed_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next incoming connection
    ///
    /// Returns `Ok(None)` if the acceptor is (or gets) closed while waiting.
    pub async fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        // subscribe before looking at the listener, so a concurrent `close`
        // is either seen here or wakes up the `select!` below
        let mut closed_rx = self.closed_tx.subscribe();
        let Some(listener) = self.listener.apply(|l| l.clone()) else {
            return Ok(None);
        };

        tokio::select! {
            res = listener.accept() => res.map(Some),
            _ = closed_rx.changed() => Ok(None),
        }
    }

    /// Stop accepting; returns `false` if already closed
    ///
    /// The socket gets closed as soon as pending `accept` calls notice.
    pub fn close(&self) -> bool {
        let was_open = self.listener.apply(|l| l.take()).is_some();
        if was_open {
            debug!(local_addr = %self.local_addr, "Closing acceptor");
            self.closed_tx.send_replace(true);
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}
