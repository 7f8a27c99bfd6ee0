// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::api_server::{kind_of, ApiServer, Object};
use crate::common::is_controlled_by;
use crate::error::{APIError, Error};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::*;

/// Describes one child object of a DataflowEngine: where it lives, what it
/// should look like, and how to bring a found copy back in line.
pub trait ResourceBuilder {
    type Output: Object;

    /// Deterministic name of the child, so a later pass finds the same object.
    fn name(&self) -> String;

    fn make(&self) -> Self::Output;

    /// Whether the found object already has the desired shape.
    fn matches(&self, found: &Self::Output) -> bool;

    /// Applies the desired shape to the found object in place, keeping its
    /// identity and resource version.
    fn update(&self, found: Self::Output) -> Self::Output;
}

/// What a pass may do to the children it visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Create missing children and update drifted ones.
    Converge,
    /// Only read. Used while the DataflowEngine is being deleted.
    Observe,
}

// reconcile_resource fetches the child by its deterministic name and
// creates or updates it. It returns the child as stored after the pass,
// or None if it does not exist and the intent forbids creating it.
pub async fn reconcile_resource<A, B>(
    api: &A,
    namespace: &str,
    owner: &OwnerReference,
    builder: &B,
    intent: Intent,
) -> Result<Option<B::Output>, Error>
where
    A: ApiServer,
    B: ResourceBuilder,
{
    let name = builder.name();
    let kind = kind_of::<B::Output>();
    match api.get::<B::Output>(namespace, &name).await {
        Ok(found) => match intent {
            Intent::Observe => Ok(Some(found)),
            Intent::Converge => converge_found(api, namespace, owner, builder, found)
                .await
                .map(Some),
        },
        Err(APIError::ObjectNotFound) => match intent {
            Intent::Observe => {
                debug!(kind = %kind, name = %name, "Not found, skip");
                Ok(None)
            }
            Intent::Converge => {
                info!(kind = %kind, name = %name, "Create");
                match api.create(namespace, &builder.make()).await {
                    Ok(created) => Ok(Some(created)),
                    Err(APIError::ObjectAlreadyExists) => {
                        // Created concurrently, take the update path with the winner's copy.
                        let found = api
                            .get::<B::Output>(namespace, &name)
                            .await
                            .map_err(|e| Error::child(&kind, &name, e))?;
                        converge_found(api, namespace, owner, builder, found)
                            .await
                            .map(Some)
                    }
                    Err(e) => Err(Error::child(&kind, &name, e)),
                }
            }
        },
        Err(e) => Err(Error::child(&kind, &name, e)),
    }
}

async fn converge_found<A, B>(
    api: &A,
    namespace: &str,
    owner: &OwnerReference,
    builder: &B,
    found: B::Output,
) -> Result<B::Output, Error>
where
    A: ApiServer,
    B: ResourceBuilder,
{
    update_with_retry(api, namespace, owner, found, |current: &B::Output| {
        if builder.matches(current) {
            None
        } else {
            Some(builder.update(current.clone()))
        }
    })
    .await
}

// update_with_retry writes change(found) if it is Some. A resource version
// conflict refetches the object and tries once more within the pass.
pub async fn update_with_retry<A, K, F>(
    api: &A,
    namespace: &str,
    owner: &OwnerReference,
    found: K,
    change: F,
) -> Result<K, Error>
where
    A: ApiServer,
    K: Object,
    F: Fn(&K) -> Option<K>,
{
    let kind = kind_of::<K>();
    let name = found.meta().name.clone().unwrap_or_default();
    match apply_change(api, namespace, owner, found, &change).await {
        Err(Error::ReconcileChildFailed {
            source: APIError::Conflict,
            ..
        }) => {
            info!(kind = %kind, name = %name, "Conflict on update, refetch and retry");
            let latest = api
                .get::<K>(namespace, &name)
                .await
                .map_err(|e| Error::child(&kind, &name, e))?;
            apply_change(api, namespace, owner, latest, &change).await
        }
        result => result,
    }
}

async fn apply_change<A, K, F>(
    api: &A,
    namespace: &str,
    owner: &OwnerReference,
    found: K,
    change: &F,
) -> Result<K, Error>
where
    A: ApiServer,
    K: Object,
    F: Fn(&K) -> Option<K>,
{
    let kind = kind_of::<K>();
    let name = found.meta().name.clone().unwrap_or_default();
    // A same-named object left by a deleted DataflowEngine waits for the garbage collector.
    if !is_controlled_by(&found, owner) {
        return Err(Error::NotOwned { kind, name });
    }
    match change(&found) {
        None => Ok(found),
        Some(desired) => {
            info!(kind = %kind, name = %name, "Update");
            api.update(namespace, &desired)
                .await
                .map_err(|e| Error::child(&kind, &name, e))
        }
    }
}

// remove_stale deletes the object of kind K named `name` if this DataflowEngine
// controls it. Returns whether a delete was issued.
pub async fn remove_stale<A, K>(
    api: &A,
    namespace: &str,
    owner: &OwnerReference,
    name: &str,
) -> Result<bool, Error>
where
    A: ApiServer,
    K: Object,
{
    let kind = kind_of::<K>();
    match api.get::<K>(namespace, name).await {
        Err(APIError::ObjectNotFound) => Ok(false),
        Err(e) => Err(Error::child(&kind, name, e)),
        Ok(found) => {
            if !is_controlled_by(&found, owner) || found.meta().deletion_timestamp.is_some() {
                return Ok(false);
            }
            info!(kind = %kind, name = %name, "Delete");
            match api.delete::<K>(namespace, name).await {
                Ok(()) | Err(APIError::ObjectNotFound) => Ok(true),
                Err(e) => Err(Error::child(&kind, name, e)),
            }
        }
    }
}
