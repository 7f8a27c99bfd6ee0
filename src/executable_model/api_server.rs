// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::api_server::{kind_of, ApiServer, Object};
use crate::error::APIError;
use crate::executable_model::object_map::*;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl Verb {
    pub fn is_write(self) -> bool {
        !matches!(self, Verb::Get)
    }
}

/// One request received by the model, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Default)]
struct ApiServerState {
    resources: ObjectMap,
    resource_version_counter: u64,
    uid_counter: u64,
    requests: Vec<Request>,
    injected_failures: HashMap<(Verb, String), APIError>,
    dropped_fields: HashMap<String, Vec<Vec<String>>>,
    concurrent_creates: HashMap<ObjectMapKey, Value>,
}

// ExecutableApiServer is an in-memory version of the Kubernetes API server.
// It models the behavior the controller relies on: server-assigned uids and
// resource versions, optimistic concurrency on every write, status kept apart
// from the rest of the object, finalizers holding back deletion and garbage
// collection of owned objects.
#[derive(Debug, Default)]
pub struct ExecutableApiServer {
    state: Mutex<ApiServerState>,
}

impl ApiServerState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version_counter += 1;
        self.resource_version_counter.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid_counter += 1;
        format!("uid-{}", self.uid_counter)
    }

    // receive logs the request and hands out the failure injected for it, if any.
    fn receive(&mut self, verb: Verb, kind: &str, name: &str) -> Result<(), APIError> {
        self.requests.push(Request {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
        });
        match self.injected_failures.remove(&(verb, kind.to_string())) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    // drop_unknown_fields removes the fields this server does not persist for the kind.
    fn drop_unknown_fields(&self, kind: &str, obj: &mut Value) {
        for path in self.dropped_fields.get(kind).into_iter().flatten() {
            let Some((field, parents)) = path.split_last() else {
                continue;
            };
            let parent = parents
                .iter()
                .try_fold(&mut *obj, |value, segment| value.get_mut(segment.as_str()));
            if let Some(object) = parent.and_then(Value::as_object_mut) {
                object.remove(field);
            }
        }
    }

    fn handle_get(&self, key: &ObjectMapKey) -> Result<Value, APIError> {
        self.resources
            .get(key)
            .cloned()
            .ok_or(APIError::ObjectNotFound)
    }

    fn handle_create(&mut self, key: ObjectMapKey, mut obj: Value) -> Result<Value, APIError> {
        let mut meta = metadata_of(&obj);
        if meta.name.is_none() {
            return Err(APIError::Invalid);
        }
        if meta.namespace.is_some() && meta.namespace.as_deref() != Some(key.namespace.as_str()) {
            return Err(APIError::BadRequest);
        }
        if self.resources.contains_key(&key) {
            return Err(APIError::ObjectAlreadyExists);
        }
        meta.namespace = Some(key.namespace.clone());
        meta.uid = Some(self.next_uid());
        meta.resource_version = Some(self.next_resource_version());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        set_metadata(&mut obj, &meta)?;
        self.drop_unknown_fields(&key.kind, &mut obj);
        self.resources.insert(key, obj.clone());
        Ok(obj)
    }

    // admission_check validates a write against the stored copy and returns it.
    fn admission_check(&self, key: &ObjectMapKey, obj: &Value) -> Result<Value, APIError> {
        let meta = metadata_of(obj);
        if meta.name.as_deref() != Some(key.name.as_str()) {
            return Err(APIError::BadRequest);
        }
        if meta.namespace.is_some() && meta.namespace.as_deref() != Some(key.namespace.as_str()) {
            return Err(APIError::BadRequest);
        }
        let old = self.handle_get(key)?;
        let old_meta = metadata_of(&old);
        if meta.resource_version.is_some() && meta.resource_version != old_meta.resource_version {
            return Err(APIError::Conflict);
        }
        if meta.uid.is_some() && meta.uid != old_meta.uid {
            return Err(APIError::InternalError);
        }
        Ok(old)
    }

    fn handle_update(&mut self, key: ObjectMapKey, mut obj: Value) -> Result<Value, APIError> {
        let old = self.admission_check(&key, &obj)?;
        let old_meta = metadata_of(&old);
        let mut meta = metadata_of(&obj);
        meta.namespace = Some(key.namespace.clone());
        meta.uid = old_meta.uid.clone();
        meta.resource_version = old_meta.resource_version.clone();
        meta.creation_timestamp = old_meta.creation_timestamp.clone();
        meta.deletion_timestamp = old_meta.deletion_timestamp.clone();
        set_metadata(&mut obj, &meta)?;
        set_status_from(&mut obj, &old)?;
        self.drop_unknown_fields(&key.kind, &mut obj);
        if obj == old {
            return Ok(old);
        }

        if old_meta.deletion_timestamp.is_some() {
            let old_finalizers: BTreeSet<String> =
                old_meta.finalizers.unwrap_or_default().into_iter().collect();
            let added = meta
                .finalizers
                .iter()
                .flatten()
                .any(|f| !old_finalizers.contains(f));
            if added {
                return Err(APIError::Forbidden);
            }
        }

        meta.resource_version = Some(self.next_resource_version());
        set_metadata(&mut obj, &meta)?;
        let finalized = meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if meta.deletion_timestamp.is_some() && finalized {
            self.resources.remove(&key);
            self.collect_garbage(meta.uid.unwrap_or_default());
        } else {
            self.resources.insert(key, obj.clone());
        }
        Ok(obj)
    }

    fn handle_update_status(&mut self, key: ObjectMapKey, obj: Value) -> Result<Value, APIError> {
        let old = self.admission_check(&key, &obj)?;
        let mut updated = old.clone();
        set_status_from(&mut updated, &obj)?;
        if updated == old {
            return Ok(old);
        }
        let mut meta = metadata_of(&updated);
        meta.resource_version = Some(self.next_resource_version());
        set_metadata(&mut updated, &meta)?;
        self.resources.insert(key, updated.clone());
        Ok(updated)
    }

    fn handle_delete(&mut self, key: ObjectMapKey) -> Result<(), APIError> {
        let mut obj = self.handle_get(&key)?;
        let mut meta = metadata_of(&obj);
        if meta.finalizers.as_ref().map_or(false, |f| !f.is_empty()) {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(self.next_resource_version());
                set_metadata(&mut obj, &meta)?;
                self.resources.insert(key, obj);
            }
        } else {
            self.resources.remove(&key);
            self.collect_garbage(meta.uid.unwrap_or_default());
        }
        Ok(())
    }

    // collect_garbage deletes everything owned, directly or transitively, by the
    // removed object `uid`. Owned objects with finalizers only get a deletion timestamp.
    fn collect_garbage(&mut self, uid: String) {
        let mut removed = vec![uid];
        while let Some(owner) = removed.pop() {
            for key in self.resources.owned_by(&owner) {
                let Some(mut obj) = self.resources.get(&key).cloned() else {
                    continue;
                };
                let mut meta = metadata_of(&obj);
                if meta.finalizers.as_ref().map_or(false, |f| !f.is_empty()) {
                    if meta.deletion_timestamp.is_none() {
                        meta.deletion_timestamp = Some(Time(Utc::now()));
                        meta.resource_version = Some(self.next_resource_version());
                        if set_metadata(&mut obj, &meta).is_ok() {
                            self.resources.insert(key, obj);
                        }
                    }
                } else {
                    self.resources.remove(&key);
                    removed.extend(meta.uid);
                }
            }
        }
    }
}

fn to_value<K: Object>(obj: &K) -> Result<Value, APIError> {
    serde_json::to_value(obj).map_err(|e| APIError::Other(e.to_string()))
}

fn from_value<K: Object>(value: Value) -> Result<K, APIError> {
    serde_json::from_value(value).map_err(|e| APIError::Other(e.to_string()))
}

fn object_key<K: Object>(namespace: &str, name: &str) -> ObjectMapKey {
    ObjectMapKey {
        kind: kind_of::<K>(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn name_of<K: Object>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

impl ExecutableApiServer {
    pub fn new() -> Self {
        ExecutableApiServer::default()
    }

    /// Every request received so far, in arrival order.
    pub async fn requests(&self) -> Vec<Request> {
        self.state.lock().await.requests.clone()
    }

    /// Number of write requests received so far.
    pub async fn write_count(&self) -> usize {
        self.state
            .lock()
            .await
            .requests
            .iter()
            .filter(|r| r.verb.is_write())
            .count()
    }

    pub async fn clear_requests(&self) {
        self.state.lock().await.requests.clear();
    }

    /// Makes the next `verb` request on `kind` fail with `error`.
    pub async fn fail_next(&self, verb: Verb, kind: &str, error: APIError) {
        self.state
            .lock()
            .await
            .injected_failures
            .insert((verb, kind.to_string()), error);
    }

    /// Applies `change` to the stored object as another writer would: the change
    /// is not logged and the resource version moves on.
    pub async fn mutate<K, F>(&self, namespace: &str, name: &str, change: F) -> Result<K, APIError>
    where
        K: Object,
        F: FnOnce(&mut K),
    {
        let mut state = self.state.lock().await;
        let key = object_key::<K>(namespace, name);
        let mut obj: K = from_value(state.handle_get(&key)?)?;
        change(&mut obj);
        let mut value = to_value(&obj)?;
        let mut meta = metadata_of(&value);
        meta.resource_version = Some(state.next_resource_version());
        set_metadata(&mut value, &meta)?;
        state.resources.insert(key, value.clone());
        from_value(value)
    }

    /// Simulates a concurrent write that changes nothing but the resource version.
    pub async fn bump_resource_version<K: Object>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), APIError> {
        self.mutate::<K, _>(namespace, name, |_| {}).await.map(|_| ())
    }

    /// Makes the model drop the field at `path` from every stored `kind` object,
    /// as an API server does for fields behind a disabled feature gate.
    pub async fn drop_field_on_write(&self, kind: &str, path: &[&str]) {
        self.state
            .lock()
            .await
            .dropped_fields
            .entry(kind.to_string())
            .or_default()
            .push(path.iter().map(|segment| segment.to_string()).collect());
    }

    /// Has another writer create `obj` just before the next create of the same
    /// object reaches the model, so that create fails with ObjectAlreadyExists.
    pub async fn create_concurrently<K: Object>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<(), APIError> {
        let key = object_key::<K>(namespace, &name_of(obj));
        let value = to_value(obj)?;
        self.state.lock().await.concurrent_creates.insert(key, value);
        Ok(())
    }

    pub async fn object_count(&self) -> usize {
        self.state.lock().await.resources.len()
    }
}

impl ApiServer for ExecutableApiServer {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K, APIError> {
        let mut state = self.state.lock().await;
        state.receive(Verb::Get, &kind_of::<K>(), name)?;
        from_value(state.handle_get(&object_key::<K>(namespace, name))?)
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, APIError> {
        let name = name_of(obj);
        let mut state = self.state.lock().await;
        state.receive(Verb::Create, &kind_of::<K>(), &name)?;
        let key = object_key::<K>(namespace, &name);
        if let Some(winner) = state.concurrent_creates.remove(&key) {
            state.handle_create(key.clone(), winner)?;
        }
        from_value(state.handle_create(key, to_value(obj)?)?)
    }

    async fn update<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, APIError> {
        let name = name_of(obj);
        let mut state = self.state.lock().await;
        state.receive(Verb::Update, &kind_of::<K>(), &name)?;
        from_value(state.handle_update(object_key::<K>(namespace, &name), to_value(obj)?)?)
    }

    async fn update_status<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, APIError> {
        let name = name_of(obj);
        let mut state = self.state.lock().await;
        state.receive(Verb::UpdateStatus, &kind_of::<K>(), &name)?;
        from_value(state.handle_update_status(object_key::<K>(namespace, &name), to_value(obj)?)?)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), APIError> {
        let mut state = self.state.lock().await;
        state.receive(Verb::Delete, &kind_of::<K>(), name)?;
        state.handle_delete(object_key::<K>(namespace, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_stale_update() {
        let api = ExecutableApiServer::new();
        let created = api.create("default", &config_map("a")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(
            api.create("default", &config_map("a")).await.unwrap_err(),
            APIError::ObjectAlreadyExists
        );

        let mut changed = created.clone();
        changed.data = Some([("k".to_string(), "v".to_string())].into());
        api.update("default", &changed).await.unwrap();
        assert_eq!(
            api.update("default", &changed).await.unwrap_err(),
            APIError::Conflict
        );
    }

    #[tokio::test]
    async fn test_noop_update_keeps_resource_version() {
        let api = ExecutableApiServer::new();
        let created = api.create("default", &config_map("a")).await.unwrap();
        let updated = api.update("default", &created).await.unwrap();
        assert_eq!(
            updated.metadata.resource_version,
            created.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_finalizers_hold_deletion_and_owned_objects_are_collected() {
        let api = ExecutableApiServer::new();
        let mut owner = config_map("owner");
        owner.metadata.finalizers = Some(vec!["example.com/f".to_string()]);
        let owner = api.create("default", &owner).await.unwrap();
        let mut child = config_map("child");
        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "owner".to_string(),
            uid: owner.metadata.uid.clone().unwrap(),
            controller: Some(true),
            ..OwnerReference::default()
        }]);
        api.create("default", &child).await.unwrap();

        api.delete::<ConfigMap>("default", "owner").await.unwrap();
        let owner = api.get::<ConfigMap>("default", "owner").await.unwrap();
        assert!(owner.metadata.deletion_timestamp.is_some());

        let mut readded = owner.clone();
        readded.metadata.finalizers = Some(vec![
            "example.com/f".to_string(),
            "example.com/g".to_string(),
        ]);
        assert_eq!(
            api.update("default", &readded).await.unwrap_err(),
            APIError::Forbidden
        );

        let mut released = owner.clone();
        released.metadata.finalizers = Some(vec![]);
        api.update("default", &released).await.unwrap();
        assert_eq!(api.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_field_is_not_stored() {
        let api = ExecutableApiServer::new();
        api.drop_field_on_write("ConfigMap", &["data", "k"]).await;
        let mut cm = config_map("a");
        cm.data = Some(
            [
                ("k".to_string(), "v".to_string()),
                ("kept".to_string(), "v".to_string()),
            ]
            .into(),
        );
        let created = api.create("default", &cm).await.unwrap();
        let data = created.data.unwrap();
        assert!(!data.contains_key("k"));
        assert!(data.contains_key("kept"));
    }

    #[tokio::test]
    async fn test_concurrent_create_wins() {
        let api = ExecutableApiServer::new();
        let mut winner = config_map("a");
        winner.data = Some([("by".to_string(), "other".to_string())].into());
        api.create_concurrently("default", &winner).await.unwrap();
        assert_eq!(
            api.create("default", &config_map("a")).await.unwrap_err(),
            APIError::ObjectAlreadyExists
        );
        let stored = api.get::<ConfigMap>("default", "a").await.unwrap();
        assert_eq!(stored.data.unwrap()["by"], "other");
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let api = ExecutableApiServer::new();
        api.fail_next(Verb::Create, "ConfigMap", APIError::Timeout)
            .await;
        assert_eq!(
            api.create("default", &config_map("a")).await.unwrap_err(),
            APIError::Timeout
        );
        api.create("default", &config_map("a")).await.unwrap();
        assert_eq!(api.write_count().await, 2);
    }
}
