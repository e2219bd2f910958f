//! Best-effort audit funnel.
//!
//! Audit records are queued on an unbounded channel and written by a
//! dedicated task, so the protocol path never waits on the store for audit
//! and never observes an audit failure. Records can be lost if the process
//! dies with the queue non-empty; that is the accepted trade.

use crate::fix::store::{AuditRecord, MessageStore};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Clone)]
pub(crate) struct Auditor {
    sender: mpsc::UnboundedSender<AuditRecord>,
}

impl Auditor {
    pub(crate) fn spawn(store: Arc<dyn MessageStore>) -> Auditor {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AuditRecord>();
        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(e) = store.append_audit(record).await {
                    warn!(error = %e, "dropping audit record");
                }
            }
        });
        Auditor { sender }
    }

    pub(crate) fn record(&self, record: AuditRecord) {
        let _ = self.sender.send(record);
    }
}
