// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::error::APIError;
use kube::api::ObjectMeta;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ObjectMapKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

// ObjectMap is the stored state of the model: every object in its serialized
// form, keyed by kind, namespace and name.
#[derive(Debug, Default)]
pub struct ObjectMap {
    inner: BTreeMap<ObjectMapKey, Value>,
}

impl ObjectMap {
    pub fn get(&self, key: &ObjectMapKey) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn contains_key(&self, key: &ObjectMapKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn insert(&mut self, key: ObjectMapKey, value: Value) {
        self.inner.insert(key, value);
    }

    pub fn remove(&mut self, key: &ObjectMapKey) -> Option<Value> {
        self.inner.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Keys of the objects that list `uid` among their owner references.
    pub fn owned_by(&self, uid: &str) -> Vec<ObjectMapKey> {
        self.inner
            .iter()
            .filter(|(_, value)| {
                metadata_of(value)
                    .owner_references
                    .unwrap_or_default()
                    .iter()
                    .any(|r| r.uid == uid)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}

pub fn metadata_of(value: &Value) -> ObjectMeta {
    value
        .get("metadata")
        .cloned()
        .and_then(|meta| serde_json::from_value(meta).ok())
        .unwrap_or_default()
}

pub fn set_metadata(value: &mut Value, meta: &ObjectMeta) -> Result<(), APIError> {
    let meta = serde_json::to_value(meta).map_err(|e| APIError::Other(e.to_string()))?;
    value
        .as_object_mut()
        .ok_or(APIError::BadRequest)?
        .insert("metadata".to_string(), meta);
    Ok(())
}

/// Copies the `status` of `from` into `value`, dropping the one `value` carried.
pub fn set_status_from(value: &mut Value, from: &Value) -> Result<(), APIError> {
    let object = value.as_object_mut().ok_or(APIError::BadRequest)?;
    match from.get("status") {
        Some(status) => {
            object.insert("status".to_string(), status.clone());
        }
        None => {
            object.remove("status");
        }
    }
    Ok(())
}
