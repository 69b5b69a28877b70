//! Membership repair.
//!
//! Walks every stage set and makes it agree with the lead records: members
//! without a record are dropped, members whose record says another stage are
//! moved there. The record is always the source of truth.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::campaign::engine::StageEngine;
use crate::campaign::keys::stage_set_key;
use crate::campaign::model::LeadStage;
use crate::error::StoreError;
use crate::store::KvStore;

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Memberships examined across all stage sets.
    pub scanned: usize,
    /// Members with no lead record, removed.
    pub orphans_removed: usize,
    /// Stale memberships removed because the record is elsewhere.
    pub relocated: usize,
}

/// Repair stage-set membership for every lead reachable from a set.
pub async fn reconcile(
    store: &Arc<dyn KvStore>,
    engine: &StageEngine,
) -> Result<ReconcileReport, StoreError> {
    let mut report = ReconcileReport::default();

    for stage in LeadStage::ALL {
        let set_key = stage_set_key(stage);
        for email in store.set_members(&set_key).await? {
            report.scanned += 1;
            match engine.leads().get(&email).await? {
                None => {
                    if store.remove_from_set(&set_key, &email).await? {
                        warn!(email = %email, stage = %stage, "Removed member with no lead record");
                        report.orphans_removed += 1;
                    }
                }
                Some(lead) => {
                    if engine.reindex(&lead, stage).await? {
                        report.relocated += 1;
                    }
                }
            }
        }
    }

    info!(
        scanned = report.scanned,
        orphans_removed = report.orphans_removed,
        relocated = report.relocated,
        "Reconcile finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::leads::NewLead;
    use crate::clock::ManualClock;
    use crate::config::WindowPolicy;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<dyn KvStore>, StageEngine) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new("2026-03-02T09:00:00Z".parse().unwrap()));
        let engine = StageEngine::new(Arc::clone(&store), clock, WindowPolicy::Exact, None);
        (store, engine)
    }

    #[tokio::test]
    async fn consistent_store_is_untouched() {
        let (store, engine) = setup();
        engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        engine.leads().submit(NewLead::new("b@x.com")).await.unwrap();

        let report = reconcile(&store, &engine).await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                scanned: 2,
                orphans_removed: 0,
                relocated: 0
            }
        );
    }

    #[tokio::test]
    async fn repairs_duplicates_and_orphans() {
        let (store, engine) = setup();
        engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();
        // Interrupted move left a duplicate, and a record was deleted by hand.
        store.add_to_set("stage:queued", "a@x.com").await.unwrap();
        store.add_to_set("stage:queued", "ghost@x.com").await.unwrap();

        let report = reconcile(&store, &engine).await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.relocated, 1);
        assert_eq!(store.set_cardinality("stage:queued").await.unwrap(), 0);
        assert_eq!(
            store.set_members("stage:email1_sent").await.unwrap(),
            vec!["a@x.com"]
        );

        let again = reconcile(&store, &engine).await.unwrap();
        assert_eq!((again.orphans_removed, again.relocated), (0, 0));
    }

    #[tokio::test]
    async fn restores_missing_membership_for_record_stage() {
        let (store, engine) = setup();
        engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        let mut lead = engine.leads().get("a@x.com").await.unwrap().unwrap();
        lead.stage = LeadStage::Email1Sent;
        engine.leads().put(&lead).await.unwrap();

        reconcile(&store, &engine).await.unwrap();
        assert_eq!(store.set_cardinality("stage:queued").await.unwrap(), 0);
        assert_eq!(store.set_cardinality("stage:email1_sent").await.unwrap(), 1);
    }
}
