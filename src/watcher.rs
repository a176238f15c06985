//! Client runtime watcher
//!
//! For every runtime that uses this node as its key manager (and is allowed
//! to by policy), a watcher tracks the runtime's executor committee and
//! keeps the worker's access list in step with it. The watcher never touches
//! worker state directly: it pushes [`AccessListUpdate`]s through a narrow
//! channel capability and the worker loop applies them, preserving the
//! single-writer discipline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::api::{Namespace, PublicKey};
use crate::backend::{CommitteeKind, Node, Registry, Scheduler};
use crate::error::WorkerError;

/// A replacement peer set for one runtime, to be applied by the worker loop.
#[derive(Debug)]
pub struct AccessListUpdate {
    pub runtime_id: Namespace,
    pub nodes: Vec<Node>,
}

/// Handle the worker loop keeps per watched runtime.
pub(crate) struct WatcherHandle {
    epoch_tx: mpsc::Sender<()>,
}

impl WatcherHandle {
    /// Signals an epoch transition; coalesces when one is already pending.
    pub fn epoch_transition(&self) {
        let _ = self.epoch_tx.try_send(());
    }
}

/// Watches one client runtime's executor committee.
pub(crate) struct ClientRuntimeWatcher {
    runtime_id: Namespace,
    registry: Arc<dyn Registry>,
    scheduler: Arc<dyn Scheduler>,
    updates: mpsc::Sender<AccessListUpdate>,

    /// Committee member IDs, frozen until the next epoch transition.
    member_ids: HashSet<PublicKey>,
    /// Latest descriptor seen per tracked member.
    tracked: HashMap<PublicKey, Node>,
}

impl ClientRuntimeWatcher {
    /// Starts the watcher task and returns its handle.
    pub fn spawn(
        runtime_id: Namespace,
        registry: Arc<dyn Registry>,
        scheduler: Arc<dyn Scheduler>,
        updates: mpsc::Sender<AccessListUpdate>,
        cancel: CancellationToken,
    ) -> WatcherHandle {
        let (epoch_tx, epoch_rx) = mpsc::channel(1);
        let watcher = Self {
            runtime_id,
            registry,
            scheduler,
            updates,
            member_ids: HashSet::new(),
            tracked: HashMap::new(),
        };
        tokio::spawn(watcher.run(epoch_rx, cancel));
        WatcherHandle { epoch_tx }
    }

    async fn run(mut self, mut epoch_rx: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut node_updates = self.registry.watch_node_updates();

        // Pick up the current committee right away.
        self.epoch_transition().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                Some(()) = epoch_rx.recv() => self.epoch_transition().await,
                maybe_node = node_updates.recv() => match maybe_node {
                    Some(node) => self.node_updated(node).await,
                    None => return,
                },
            }
        }
    }

    /// Re-elects the tracked member set from the scheduler and installs the
    /// nodes that already have descriptors. Members without one are picked
    /// up through node updates as they register.
    async fn epoch_transition(&mut self) {
        self.member_ids.clear();
        self.tracked.clear();

        let committees = match self.scheduler.get_committees(&self.runtime_id).await {
            Ok(committees) => committees,
            Err(err) => {
                error!(
                    runtime_id = %self.runtime_id,
                    error = %err,
                    "failed to fetch client runtime committee"
                );
                return;
            }
        };

        for committee in committees
            .iter()
            .filter(|c| c.kind == CommitteeKind::ComputeExecutor)
        {
            for member in &committee.members {
                self.member_ids.insert(member.public_key);
                match self.registry.get_node(&member.public_key).await {
                    Ok(node) => {
                        self.tracked.insert(node.id, node);
                    }
                    Err(WorkerError::NoSuchNode) => continue,
                    Err(err) => {
                        warn!(
                            runtime_id = %self.runtime_id,
                            node_id = %member.public_key,
                            error = %err,
                            "failed to fetch committee member descriptor"
                        );
                    }
                }
            }
        }

        self.push_update().await;
    }

    async fn node_updated(&mut self, node: Node) {
        if !self.member_ids.contains(&node.id) {
            return;
        }
        self.tracked.insert(node.id, node);
        self.push_update().await;
    }

    async fn push_update(&self) {
        let update = AccessListUpdate {
            runtime_id: self.runtime_id,
            nodes: self.tracked.values().cloned().collect(),
        };
        let _ = self.updates.send(update).await;
    }
}
