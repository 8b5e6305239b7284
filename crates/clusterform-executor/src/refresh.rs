//! Refresh and intent repair: reconciling recorded state with what the
//! provider actually has.

use crate::error::ExecResult;
use crate::retry::{retry_with_backoff, RetryConfig};
use clusterform_core::{
    Action, Attributes, Drift, DriftKind, ResourceAddress, StateRecord, StateSnapshot,
};
use clusterform_provider::{LiveResource, Provider};
use clusterform_state::StateStore;
use futures::StreamExt;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A snapshot brought up to date with the provider, and what differed.
#[derive(Clone, Debug, Default)]
pub struct Refreshed {
    pub snapshot: StateSnapshot,
    pub drift: Vec<Drift>,
}

/// The argument subset of a live object's attributes.
fn live_arguments(provider: &dyn Provider, kind: &str, attributes: &Attributes) -> Attributes {
    let Some(schema) = provider.schemas().get(kind) else {
        return Attributes::new();
    };
    attributes
        .iter()
        .filter(|(name, _)| schema.is_argument(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn modified_arguments(provider: &dyn Provider, record: &StateRecord, live: &LiveResource) -> Vec<String> {
    let Some(schema) = provider.schemas().get(&record.address.kind) else {
        return Vec::new();
    };
    schema
        .arguments()
        .filter(|(name, _)| record.inputs.get(*name) != live.attributes.get(*name))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Read every recorded object back from the provider. Objects that are gone
/// drop out of the snapshot; changed arguments replace the recorded inputs so
/// the next plan shows the correction. Computed attributes are always
/// refreshed and are not reported.
pub async fn refresh(
    provider: &dyn Provider,
    snapshot: &StateSnapshot,
    retry: &RetryConfig,
    concurrency: usize,
) -> ExecResult<Refreshed> {
    let reads = futures::stream::iter(snapshot.records())
        .map(|record| async move {
            let kind = record.address.kind.as_str();
            let id = record.id.as_str();
            let label = format!("read {}", record.address);
            let (result, _) = retry_with_backoff(retry, &label, || provider.read(kind, id)).await;
            (record, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut live: BTreeMap<&ResourceAddress, (&StateRecord, Option<LiveResource>)> = BTreeMap::new();
    for (record, result) in reads {
        live.insert(&record.address, (record, result?));
    }

    let mut refreshed = Refreshed::default();
    for (address, (record, current)) in live {
        let Some(current) = current else {
            warn!(address = %address, id = %record.id, "object deleted outside of clusterform");
            refreshed.drift.push(Drift {
                address: address.clone(),
                kind: DriftKind::Deleted,
            });
            continue;
        };
        let modified = modified_arguments(provider, record, &current);
        let mut updated = record.clone();
        if !modified.is_empty() {
            warn!(address = %address, attributes = ?modified, "object modified outside of clusterform");
            updated.inputs = live_arguments(provider, &address.kind, &current.attributes);
            refreshed.drift.push(Drift {
                address: address.clone(),
                kind: DriftKind::Modified {
                    attributes: modified,
                },
            });
        }
        updated.outputs = current.attributes;
        refreshed.snapshot.insert(updated);
    }
    info!(
        records = snapshot.len(),
        drifted = refreshed.drift.len(),
        "refresh complete"
    );
    Ok(refreshed)
}

/// Resolve intents left behind by an interrupted run.
///
/// - create: the object is looked up by address. If the store has no record
///   for the address it is adopted. If the store already records a different
///   object (an interrupted create-before-destroy) the stray is deleted so
///   the replacement is planned again.
/// - update: the object is read back and its record refreshed, or dropped if
///   the object is gone.
/// - delete: the record is dropped if the object is gone.
pub async fn repair_intents(
    provider: &dyn Provider,
    store: &StateStore,
    retry: &RetryConfig,
) -> ExecResult<Vec<Drift>> {
    let mut drift = Vec::new();
    for intent in store.pending_intents().await? {
        let address = &intent.address;
        let kind = address.kind.as_str();
        let label = format!("repair {address}");
        let _guard = store.lock(address).await;
        let recorded = store.get(address);

        let adopted = match (intent.action, intent.prior_id.as_deref()) {
            (Action::Create, _) => {
                let (found, _) = retry_with_backoff(retry, &label, || provider.find(address)).await;
                match (found?, recorded) {
                    (Some(live), Some(record)) if live.id == record.id => None,
                    (Some(live), Some(record)) => {
                        warn!(address = %address, stray = %live.id, recorded = %record.id, "deleting object from interrupted replacement");
                        let id = live.id.as_str();
                        let (deleted, _) =
                            retry_with_backoff(retry, &label, || provider.delete(kind, id)).await;
                        deleted?;
                        Some(false)
                    }
                    (Some(live), None) => {
                        let inputs = live_arguments(provider, kind, &live.attributes);
                        let record =
                            StateRecord::new(address.clone(), live.id, inputs, live.attributes, vec![]);
                        let committed = store.commit(record).await?;
                        info!(address = %address, id = %committed.id, "adopted object from interrupted create");
                        Some(true)
                    }
                    (None, _) => Some(false),
                }
            }
            (Action::Update, Some(prior)) => {
                let (read, _) = retry_with_backoff(retry, &label, || provider.read(kind, prior)).await;
                match (read?, recorded) {
                    (Some(live), Some(mut record)) if record.id == prior => {
                        record.inputs = live_arguments(provider, kind, &live.attributes);
                        record.outputs = live.attributes;
                        store.commit(record).await?;
                        Some(true)
                    }
                    (Some(_), _) => None,
                    (None, _) => {
                        store.remove_if_id(address, prior).await?;
                        Some(false)
                    }
                }
            }
            (Action::Delete, Some(prior)) => {
                let (read, _) = retry_with_backoff(retry, &label, || provider.read(kind, prior)).await;
                match read? {
                    Some(_) => Some(true),
                    None => {
                        store.remove_if_id(address, prior).await?;
                        Some(false)
                    }
                }
            }
            (action, None) => {
                warn!(address = %address, action = %action, "intent without prior id");
                None
            }
        };

        store.finish(address).await?;
        if let Some(adopted) = adopted {
            drift.push(Drift {
                address: address.clone(),
                kind: DriftKind::Recovered {
                    action: intent.action,
                    adopted,
                },
            });
        }
    }
    Ok(drift)
}
