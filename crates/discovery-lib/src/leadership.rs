//! Leader election gating for cluster scoped discovery
//!
//! Services and the API server are cluster scoped: with one agent per node
//! only the elected leader discovers them. Outside daemon mode there is a
//! single agent and it always leads.

use crate::observability::{DiscoveryMetrics, StructuredLogger};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

/// Read side of leader election
pub trait LeadershipGate: Send + Sync {
    /// Whether this agent currently leads
    fn leading(&self) -> bool;
    /// Identity of the current leader, empty when unknown
    fn leader(&self) -> String;
    /// Receive leadership transitions
    fn subscribe(&self, name: &str) -> watch::Receiver<bool>;
    fn unsubscribe(&self, name: &str);
}

/// Drives leader election, reporting transitions to a [`Leadership`]
#[async_trait]
pub trait Elector: Send + Sync {
    /// Run until shutdown. An error disables cluster scoped discovery.
    async fn run(
        &self,
        leadership: Arc<Leadership>,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()>;
}

struct LeadershipState {
    leading: bool,
    leader: String,
    failed: bool,
    subscribers: BTreeSet<String>,
}

/// Leadership state shared by the elector and its subscribers
pub struct Leadership {
    daemon: bool,
    state: Mutex<LeadershipState>,
    tx: watch::Sender<bool>,
    metrics: DiscoveryMetrics,
    logger: StructuredLogger,
}

impl Leadership {
    /// `daemon` is true when an agent runs on every node and must be elected
    pub fn new(daemon: bool, logger: StructuredLogger) -> Arc<Self> {
        let leading = !daemon;
        let (tx, _) = watch::channel(leading);
        let metrics = DiscoveryMetrics::new();
        metrics.set_leading(leading);
        Arc::new(Self {
            daemon,
            state: Mutex::new(LeadershipState {
                leading,
                leader: String::new(),
                failed: false,
                subscribers: BTreeSet::new(),
            }),
            tx,
            metrics,
            logger,
        })
    }

    pub fn daemon(&self) -> bool {
        self.daemon
    }

    /// Whether an elector failure disabled cluster scoped discovery
    pub fn failed(&self) -> bool {
        self.lock().failed
    }

    /// Record a leadership transition and notify subscribers
    pub fn set_leading(&self, leading: bool, leader: impl Into<String>) {
        let leader = leader.into();
        let changed = {
            let mut state = self.lock();
            if state.failed || !self.daemon {
                return;
            }
            let changed = state.leading != leading;
            state.leading = leading;
            state.leader = leader.clone();
            changed
        };
        if changed {
            self.metrics.set_leading(leading);
            self.logger.log_leadership(leading, &leader);
            // published outside the state lock
            self.tx.send_replace(leading);
        }
    }

    /// Permanently disable cluster scoped discovery after an election failure
    pub fn fail(&self, err: &anyhow::Error) {
        let was_leading = {
            let mut state = self.lock();
            if state.failed {
                return;
            }
            state.failed = true;
            std::mem::replace(&mut state.leading, false)
        };
        error!(error = %err, "leader election failed, cluster level discovery disabled");
        self.metrics.inc_leader_election_errors();
        self.metrics.set_leading(false);
        if was_leading {
            self.tx.send_replace(false);
        }
    }

    /// Subscriber names, sorted
    pub fn subscribers(&self) -> Vec<String> {
        self.lock().subscribers.iter().cloned().collect()
    }

    /// Run an elector in the background until shutdown
    pub fn start_elector(
        self: &Arc<Self>,
        elector: Arc<dyn Elector>,
        shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let leadership = Arc::clone(self);
        tokio::spawn(async move {
            info!("starting leader election");
            match elector.run(Arc::clone(&leadership), shutdown).await {
                Ok(()) => debug!("leader election stopped"),
                Err(e) => leadership.fail(&e),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, LeadershipState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LeadershipGate for Leadership {
    fn leading(&self) -> bool {
        !self.daemon || self.lock().leading
    }

    fn leader(&self) -> String {
        self.lock().leader.clone()
    }

    fn subscribe(&self, name: &str) -> watch::Receiver<bool> {
        debug!(subscriber = %name, "leadership subscribed");
        self.lock().subscribers.insert(name.to_string());
        self.tx.subscribe()
    }

    fn unsubscribe(&self, name: &str) {
        debug!(subscriber = %name, "leadership unsubscribed");
        self.lock().subscribers.remove(name);
    }
}
