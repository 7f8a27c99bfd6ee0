// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::dataflowengine_types::*;
use crate::error::Error;
use crate::reconciler::subsystem::Subsystem;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Resource;
use std::collections::BTreeMap;

pub const PV_FINALIZER: &str = "kubernetes.io/pv-protection";

pub const INSTANCE_LABEL_KEY: &str = "app.kubernetes.io/instance";
pub const COMPONENT_LABEL_KEY: &str = "app.kubernetes.io/component";
pub const PLATFORM_LABEL_KEY: &str = "app.kubernetes.io/part-of";
pub const PLATFORM_LABEL_VALUE: &str = "dataflow-engine";

pub const DATA_VOLUME_NAME: &str = "data";
pub const DATA_MOUNT_PATH: &str = "/data";

pub fn engine_name(de: &DataflowEngine) -> Result<&str, Error> {
    de.metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))
}

pub fn engine_namespace(de: &DataflowEngine) -> Result<&str, Error> {
    de.metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

pub fn child_name(engine: &str, subsystem: Subsystem) -> String {
    format!("{}-{}", engine, subsystem.label())
}

pub fn config_map_name(engine: &str, subsystem: Subsystem) -> String {
    format!("{}-config", child_name(engine, subsystem))
}

pub fn member_name(child: &str, ordinal: i32) -> String {
    format!("{}-{}", child, ordinal)
}

pub fn selector_labels(engine: &str, subsystem: Subsystem) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INSTANCE_LABEL_KEY.to_string(), engine.to_string()),
        (COMPONENT_LABEL_KEY.to_string(), subsystem.label().to_string()),
    ])
}

pub fn make_labels(engine: &str, subsystem: Subsystem) -> BTreeMap<String, String> {
    let mut labels = selector_labels(engine, subsystem);
    labels.insert(
        PLATFORM_LABEL_KEY.to_string(),
        PLATFORM_LABEL_VALUE.to_string(),
    );
    labels
}

pub fn make_owner_reference(de: &DataflowEngine) -> Result<OwnerReference, Error> {
    de.controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))
}

/// Whether `obj` carries a controller reference pointing at `owner`.
pub fn is_controlled_by<K: Resource>(obj: &K, owner: &OwnerReference) -> bool {
    obj.meta()
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.uid == owner.uid && r.controller == Some(true))
        })
        .unwrap_or(false)
}
