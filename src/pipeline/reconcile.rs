//! Entity reconciliation: last-writer-wins by update timestamp, with a
//! deduplicated history of superseded attribute values.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::pipeline::error::PipelineError;
use crate::pipeline::model::{Entity, EntityPatch, EntityStatus, EntityUpdate};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// At least one attribute or the identifier changed.
    Updated { changed: Vec<String> },
    /// Nothing changed except the update timestamp.
    Refreshed,
    /// Incoming timestamp is older than the stored one; nothing written.
    Stale,
}

/// Merge rule for an existing entity. `Ok(None)` means the update is stale.
pub fn plan_upsert(
    stored: &Entity,
    update: &EntityUpdate,
) -> Result<Option<EntityPatch>, PipelineError> {
    if let (Some(stored_id), Some(incoming_id)) = (stored.external_id, update.external_id) {
        if stored_id != incoming_id {
            return Err(PipelineError::IdentifierConflict {
                kind: stored.kind.clone(),
                key: stored.key.clone(),
                stored: stored_id,
                incoming: incoming_id,
            });
        }
    }
    if update.updated_at < stored.updated_at {
        return Ok(None);
    }

    let mut patch = EntityPatch {
        updated_at: Some(update.updated_at),
        ..EntityPatch::default()
    };
    if stored.external_id.is_none() {
        patch.external_id = update.external_id;
    }
    for (name, incoming) in &update.attrs {
        match stored.attr(name) {
            None => {
                patch.set_attrs.insert(name.clone(), incoming.clone());
            }
            Some(current) if current.trim().is_empty() => {
                patch.set_attrs.insert(name.clone(), incoming.clone());
            }
            Some(current) if current != incoming => {
                if !stored.history_of(name).iter().any(|h| h == current) {
                    patch.push_history.push((name.clone(), current.to_string()));
                }
                patch.set_attrs.insert(name.clone(), incoming.clone());
            }
            Some(_) => {}
        }
    }
    // A fresh sighting means the entity is reachable again.
    if stored.status == EntityStatus::Inaccessible {
        patch.status = Some(EntityStatus::Normal);
    }
    Ok(Some(patch))
}

pub struct Reconciler {
    store: Arc<dyn Store>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, update), fields(kind = %update.kind, key = %update.key))]
    pub async fn upsert(&self, update: &EntityUpdate) -> Result<UpsertOutcome, PipelineError> {
        match self.store.get_entity(&update.kind, &update.key).await? {
            Some(stored) => self.merge(&stored, update).await,
            None => match self.store.insert_entity(&Entity::from_update(update)).await {
                Ok(()) => {
                    debug!("inserted entity");
                    Ok(UpsertOutcome::Inserted)
                }
                // Lost an insert race to a concurrent run; merge into the winner.
                Err(StoreError::DuplicateKey(_)) => {
                    let stored = self
                        .store
                        .get_entity(&update.kind, &update.key)
                        .await?
                        .ok_or_else(|| {
                            StoreError::NotFound(format!("{}/{}", update.kind, update.key))
                        })?;
                    self.merge(&stored, update).await
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn merge(
        &self,
        stored: &Entity,
        update: &EntityUpdate,
    ) -> Result<UpsertOutcome, PipelineError> {
        let Some(patch) = plan_upsert(stored, update)? else {
            debug!(
                stored_at = %stored.updated_at,
                incoming_at = %update.updated_at,
                "stale entity update discarded"
            );
            return Ok(UpsertOutcome::Stale);
        };
        self.store
            .update_entity(&stored.kind, &stored.key, &patch)
            .await?;

        let mut changed = patch.changed_attrs();
        if patch.external_id.is_some() {
            changed.push("external_id".to_string());
        }
        if changed.is_empty() {
            Ok(UpsertOutcome::Refreshed)
        } else {
            Ok(UpsertOutcome::Updated { changed })
        }
    }

    /// Flag an existing entity as unreachable upstream. Attributes, history
    /// and the update timestamp are left alone. Returns whether a write happened.
    pub async fn mark_inaccessible(&self, kind: &str, key: &str) -> Result<bool, PipelineError> {
        match self.store.get_entity(kind, key).await? {
            Some(entity) if entity.status != EntityStatus::Inaccessible => {
                let patch = EntityPatch {
                    status: Some(EntityStatus::Inaccessible),
                    ..EntityPatch::default()
                };
                self.store.update_entity(kind, key, &patch).await?;
                warn!(kind, key, "entity marked inaccessible");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
