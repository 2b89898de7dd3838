#![allow(unused)]

use anyhow::{bail, Result};
use raftd::{
    ConnectionParameters, MemoryStorage, Node, NodeCtrl, NodeStatus, Parameters, StateParameters,
};
use raftd_api::NodeId;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// Long enough not to fire during a test
pub const NEVER: Duration = Duration::from_secs(3600);

pub struct TestNode {
    ctrl: NodeCtrl,
    id: NodeId,
    storage: Arc<MemoryStorage>,
}

impl TestNode {
    pub fn new(
        bind: SocketAddr,
        neighbours: impl IntoIterator<Item = SocketAddr>,
        connection: ConnectionParameters,
        state: StateParameters,
    ) -> Result<Self> {
        let storage = Arc::new(MemoryStorage::default());
        let id = state.uuid;
        let params = Parameters::builder()
            .bind(bind)
            .neighbours(neighbours.into_iter().collect::<BTreeSet<_>>())
            .connection(connection)
            .state(state)
            .storage(storage.clone())
            .build();
        let ctrl = Node::create(&Handle::current(), params)?;
        Ok(Self { ctrl, id, storage })
    }

    /// A node that never starts an election on its own
    pub fn idle(neighbours: impl IntoIterator<Item = SocketAddr>) -> Result<Self> {
        Self::new(
            localhost(0),
            neighbours,
            ConnectionParameters::builder()
                .retry(Duration::from_millis(100))
                .build(),
            StateParameters::builder()
                .election_timeout(NEVER)
                .election_start_min(NEVER)
                .election_start_max(NEVER)
                .build(),
        )
    }

    pub fn ctrl(&self) -> &NodeCtrl {
        &self.ctrl
    }

    pub fn node(&self) -> Arc<Node> {
        self.ctrl.node().expect("node is gone")
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.ctrl.local_addr()
    }

    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    pub fn status(&self) -> NodeStatus {
        self.ctrl.status()
    }

    /// Wait until the published status satisfies `f`
    pub async fn wait_for_status(&self, f: impl Fn(&NodeStatus) -> bool) -> Result<NodeStatus> {
        let mut rx = self.ctrl.status_rx();
        let res = timeout(WAIT, async {
            loop {
                let status = *rx.borrow_and_update();
                if f(&status) {
                    return Ok::<_, anyhow::Error>(status);
                }
                rx.changed().await?;
            }
        })
        .await;
        match res {
            Ok(res) => res,
            Err(_) => bail!("timeout; last status: {:?}", self.status()),
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.ctrl.stop();
    }
}

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// An address nothing listens on (yet)
pub fn unused_addr() -> Result<SocketAddr> {
    let listener = std::net::TcpListener::bind(localhost(0))?;
    Ok(listener.local_addr()?)
}

/// Poll `f` until it returns `true`
pub async fn wait_until(mut f: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !f() {
        if WAIT < start.elapsed() {
            bail!("timeout");
        }
        sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
