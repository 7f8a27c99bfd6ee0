// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::error::APIError;
use core::fmt::Debug;
use kube::api::Resource;
use kube::core::NamespaceResourceScope;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

/// Any namespaced, typed object the controller reads or writes.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

pub fn kind_of<K: Object>() -> String {
    K::kind(&()).to_string()
}

// ApiServer is the store the reconciler converges against.
// Every write carries the resource version of the object it was computed from,
// and a stale version is rejected with APIError::Conflict.
pub trait ApiServer: Send + Sync {
    fn get<K: Object>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<K, APIError>> + Send;

    fn create<K: Object>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> impl Future<Output = Result<K, APIError>> + Send;

    fn update<K: Object>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> impl Future<Output = Result<K, APIError>> + Send;

    fn update_status<K: Object>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> impl Future<Output = Result<K, APIError>> + Send;

    fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), APIError>> + Send;
}
