// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::api_server::ApiServer;
use crate::common::*;
use crate::dataflowengine_types::*;
use crate::error::{APIError, Error};
use crate::reconciler::resource_builder::update_with_retry;
use crate::reconciler::subsystem::Subsystem;
use crate::resource::workload::{released_retention_policy, volumes_released_on_delete};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Resource;
use kube::ResourceExt;
use tracing::*;

/// Where a DataflowEngine is in its deletion flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    NotDeleting,
    /// Deletion was requested and the storage protection finalizer is still set.
    PendingCleanup,
    /// Nothing left for this controller to do; the platform reclaims the engine.
    FinalizerRemoved,
}

impl FinalizerState {
    pub fn of(de: &DataflowEngine) -> FinalizerState {
        if de.meta().deletion_timestamp.is_none() {
            FinalizerState::NotDeleting
        } else if has_pv_finalizer(de) {
            FinalizerState::PendingCleanup
        } else {
            FinalizerState::FinalizerRemoved
        }
    }
}

fn has_pv_finalizer(de: &DataflowEngine) -> bool {
    de.finalizers().iter().any(|f| f == PV_FINALIZER)
}

// ensure_finalizer adds the storage protection finalizer to a live engine.
// It returns the engine as stored afterwards.
pub async fn ensure_finalizer<A: ApiServer>(
    api: &A,
    de: &DataflowEngine,
) -> Result<DataflowEngine, Error> {
    if has_pv_finalizer(de) || de.meta().deletion_timestamp.is_some() {
        return Ok(de.clone());
    }
    let namespace = engine_namespace(de)?;
    let name = engine_name(de)?;
    info!(engine = %name, finalizer = PV_FINALIZER, "Add finalizer");
    match api.update(namespace, &with_pv_finalizer(de)).await {
        Err(APIError::Conflict) => {
            let latest = api
                .get::<DataflowEngine>(namespace, name)
                .await
                .map_err(Error::FinalizerUpdateFailed)?;
            // Finalizers are never added once deletion has begun.
            if has_pv_finalizer(&latest) || latest.meta().deletion_timestamp.is_some() {
                return Ok(latest);
            }
            api.update(namespace, &with_pv_finalizer(&latest))
                .await
                .map_err(Error::FinalizerUpdateFailed)
        }
        result => result.map_err(Error::FinalizerUpdateFailed),
    }
}

fn with_pv_finalizer(de: &DataflowEngine) -> DataflowEngine {
    let mut updated = de.clone();
    updated
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(PV_FINALIZER.to_string());
    updated
}

fn without_pv_finalizer(de: &DataflowEngine) -> DataflowEngine {
    let mut updated = de.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != PV_FINALIZER);
    }
    updated
}

// cleanup_and_release makes sure the volume claims of every storage subsystem go
// away with their StatefulSet, then removes the storage protection finalizer and
// no other. Running it again after it succeeded is a no-op.
pub async fn cleanup_and_release<A: ApiServer>(api: &A, de: &DataflowEngine) -> Result<(), Error> {
    let namespace = engine_namespace(de)?;
    let name = engine_name(de)?;
    if FinalizerState::of(de) != FinalizerState::PendingCleanup {
        debug!(engine = %name, "No finalizer to remove");
        return Ok(());
    }
    for subsystem in Subsystem::STORAGE {
        release_storage(api, de, subsystem).await?;
    }

    info!(engine = %name, finalizer = PV_FINALIZER, "Remove finalizer");
    match api.update(namespace, &without_pv_finalizer(de)).await {
        Ok(_) | Err(APIError::ObjectNotFound) => Ok(()),
        Err(APIError::Conflict) => {
            info!(engine = %name, "Conflict on finalizer removal, refetch and retry");
            let latest = match api.get::<DataflowEngine>(namespace, name).await {
                Ok(latest) => latest,
                Err(APIError::ObjectNotFound) => return Ok(()),
                Err(e) => return Err(Error::FinalizerUpdateFailed(e)),
            };
            if !has_pv_finalizer(&latest) {
                return Ok(());
            }
            match api.update(namespace, &without_pv_finalizer(&latest)).await {
                Ok(_) | Err(APIError::ObjectNotFound) => Ok(()),
                Err(e) => Err(Error::FinalizerUpdateFailed(e)),
            }
        }
        Err(e) => Err(Error::FinalizerUpdateFailed(e)),
    }
}

// release_storage switches the claim retention of the subsystem's StatefulSet to
// whenDeleted: Delete. Standalone storage keeps its data in an emptyDir and has
// no claims to release.
async fn release_storage<A: ApiServer>(
    api: &A,
    de: &DataflowEngine,
    subsystem: Subsystem,
) -> Result<(), Error> {
    let namespace = engine_namespace(de)?;
    let owner = make_owner_reference(de)?;
    let sts_name = child_name(engine_name(de)?, subsystem);
    let found = match api.get::<StatefulSet>(namespace, &sts_name).await {
        Ok(found) => found,
        Err(APIError::ObjectNotFound) => return Ok(()),
        Err(e) => return Err(Error::child("StatefulSet", &sts_name, e)),
    };
    if !is_controlled_by(&found, &owner) || volumes_released_on_delete(&found) {
        return Ok(());
    }
    info!(subsystem = %subsystem, name = %sts_name, "Release volume claims");
    let stored = update_with_retry(api, namespace, &owner, found, |current: &StatefulSet| {
        if volumes_released_on_delete(current) {
            return None;
        }
        let mut updated = current.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.persistent_volume_claim_retention_policy = Some(released_retention_policy());
        }
        Some(updated)
    })
    .await?;
    if !volumes_released_on_delete(&stored) {
        warn!(
            subsystem = %subsystem,
            name = %sts_name,
            "Retention policy was not stored, is StatefulSetAutoDeletePVC enabled?"
        );
        return Err(Error::StorageNotReleased { name: sts_name });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable_model::ExecutableApiServer;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn engine(finalizers: Vec<&str>) -> DataflowEngine {
        let mut de = DataflowEngine::new("de", DataflowEngineSpec::default());
        de.metadata = ObjectMeta {
            name: Some("de".to_string()),
            namespace: Some("default".to_string()),
            finalizers: Some(finalizers.into_iter().map(String::from).collect()),
            ..ObjectMeta::default()
        };
        de
    }

    #[test]
    fn test_state_transitions() {
        let mut de = engine(vec![PV_FINALIZER]);
        assert_eq!(FinalizerState::of(&de), FinalizerState::NotDeleting);
        de.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(FinalizerState::of(&de), FinalizerState::PendingCleanup);
        de.metadata.finalizers = Some(vec!["other".to_string()]);
        assert_eq!(FinalizerState::of(&de), FinalizerState::FinalizerRemoved);
    }

    #[tokio::test]
    async fn test_ensure_finalizer_is_idempotent() {
        let api = ExecutableApiServer::new();
        let de = api.create("default", &engine(vec![])).await.unwrap();
        let de = ensure_finalizer(&api, &de).await.unwrap();
        assert_eq!(de.finalizers(), &[PV_FINALIZER.to_string()]);
        let writes = api.write_count().await;
        ensure_finalizer(&api, &de).await.unwrap();
        assert_eq!(api.write_count().await, writes);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_pv_finalizer() {
        let api = ExecutableApiServer::new();
        api.create("default", &engine(vec!["example.com/keep", PV_FINALIZER]))
            .await
            .unwrap();
        api.delete::<DataflowEngine>("default", "de").await.unwrap();
        let de = api.get::<DataflowEngine>("default", "de").await.unwrap();

        cleanup_and_release(&api, &de).await.unwrap();
        let de = api.get::<DataflowEngine>("default", "de").await.unwrap();
        assert_eq!(de.finalizers(), &["example.com/keep".to_string()]);

        // Retrying after success writes nothing.
        let writes = api.write_count().await;
        cleanup_and_release(&api, &de).await.unwrap();
        assert_eq!(api.write_count().await, writes);
    }

    #[tokio::test]
    async fn test_cleanup_retries_on_conflict() {
        let api = ExecutableApiServer::new();
        api.create("default", &engine(vec![PV_FINALIZER])).await.unwrap();
        api.delete::<DataflowEngine>("default", "de").await.unwrap();
        let de = api.get::<DataflowEngine>("default", "de").await.unwrap();
        api.bump_resource_version::<DataflowEngine>("default", "de")
            .await
            .unwrap();

        cleanup_and_release(&api, &de).await.unwrap();
        // The last finalizer is gone, so the engine has been reclaimed.
        assert_eq!(
            api.get::<DataflowEngine>("default", "de").await.unwrap_err(),
            APIError::ObjectNotFound
        );
    }
}
