//! Receive loop and applier pool.
//!
//! One thread pulls actions off the group layer in total order. Ordered
//! write-sets fan out to a small applier pool; the monitors re-impose
//! the global order on the workers. State requests are served inline on
//! the receive thread, which is safe because the appliers make drain
//! progress independently.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::core::WriteSet;
use crate::group::{Action, GroupError};

use super::{Replicator, ReplicatorError};

impl Replicator {
    /// Drive the node until the group connection closes.
    pub fn run(self: &Arc<Self>) -> Result<(), ReplicatorError> {
        let pool = ApplierPool::spawn(self, self.config.applier_threads);
        let result = loop {
            match self.group.recv() {
                Ok(action) => {
                    if let Err(err) = self.dispatch(action, &pool) {
                        tracing::error!("action processing failed: {err}");
                        break Err(err);
                    }
                }
                Err(GroupError::Closed) => break Ok(()),
                Err(err) => {
                    tracing::warn!("group receive failed: {err}");
                    if self.is_closing() {
                        break Ok(());
                    }
                }
            }
        };
        pool.shutdown();
        result
    }

    fn dispatch(self: &Arc<Self>, action: Action, pool: &ApplierPool) -> Result<(), ReplicatorError> {
        match action {
            Action::Ordered(ws) => {
                pool.submit(ws);
                Ok(())
            }
            Action::StateRequest {
                request,
                local_seqno,
                donor_seqno,
                requestor,
            } => self.process_state_request(&request, local_seqno, donor_seqno, &requestor),
            Action::Conf(view) => self.process_view(view),
            Action::Joined { status } => self.process_joined(status),
            Action::Synced => self.process_synced(),
        }
    }
}

struct ApplierPool {
    tx: Sender<WriteSet>,
    handles: Vec<JoinHandle<()>>,
}

impl ApplierPool {
    fn spawn(repl: &Arc<Replicator>, workers: usize) -> Self {
        let (tx, rx) = unbounded::<WriteSet>();
        let handles = (0..workers.max(1))
            .map(|index| {
                let rx: Receiver<WriteSet> = rx.clone();
                let repl = Arc::clone(repl);
                thread::spawn(move || {
                    while let Ok(ws) = rx.recv() {
                        if let Err(err) = repl.apply_writeset(&ws) {
                            tracing::error!("applier {index}: {err}");
                        }
                    }
                })
            })
            .collect();
        Self { tx, handles }
    }

    fn submit(&self, ws: WriteSet) {
        let _ = self.tx.send(ws);
    }

    fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
