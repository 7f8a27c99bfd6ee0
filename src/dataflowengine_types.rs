// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "dataflow.pingcap.com", version = "v1", kind = "DataflowEngine")]
#[kube(shortname = "de", namespaced, status = "DataflowEngineStatus")]
#[kube(
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct DataflowEngineSpec {
    /// Image shared by the master and executor components.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub master: ComponentSpec,
    #[serde(default)]
    pub executor: ComponentSpec,
    #[serde(rename = "frameStandalone", alias = "frameStorage", default)]
    pub frame_storage: StorageSpec,
    #[serde(rename = "userStandalone", alias = "userStorage", default)]
    pub user_storage: StorageSpec,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ComponentSpec {
    #[serde(default)]
    pub name: String,
    /// Replica count, only honored in cluster mode. Absent means 1.
    #[serde(rename = "size", alias = "replicas", skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: i32,
    #[serde(rename = "clusterTag", alias = "clusterMode", default)]
    pub cluster_tag: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StorageSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(rename = "size", alias = "replicas", skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    /// Single port, as used by frame storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Ordered ports, as used by user storage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<i32>,
    #[serde(rename = "clusterTag", alias = "clusterMode", default)]
    pub cluster_tag: bool,
    #[serde(alias = "backupCommand", default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl StorageSpec {
    /// All ports of the storage, the single `port` first.
    pub fn all_ports(&self) -> Vec<i32> {
        self.port.iter().chain(self.ports.iter()).copied().collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataflowEngineStatus {
    #[serde(default)]
    pub master_names: Vec<String>,
    #[serde(default)]
    pub executor_names: Vec<String>,
}

impl DataflowEngine {
    /// One-line description of the instance for logs.
    pub fn summary(&self) -> String {
        let spec = &self.spec;
        format!(
            "namespace [{}], frame storage [{} {} ports {:?} cluster {}], user storage [{} {} ports {:?} cluster {}], master [cluster {} size {:?}], executor [cluster {} size {:?}]",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            spec.frame_storage.name,
            spec.frame_storage.image,
            spec.frame_storage.all_ports(),
            spec.frame_storage.cluster_tag,
            spec.user_storage.name,
            spec.user_storage.image,
            spec.user_storage.all_ports(),
            spec.user_storage.cluster_tag,
            spec.master.cluster_tag,
            spec.master.size,
            spec.executor.cluster_tag,
            spec.executor.size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_wire_field_names() {
        let spec: DataflowEngineSpec = serde_json::from_value(json!({
            "image": "dataflow:v1",
            "master": {"name": "server-master", "size": 3, "ports": 10240, "clusterTag": true},
            "executor": {"name": "server-executor", "command": ["./bin/executor"], "ports": 10241, "clusterTag": false},
            "frameStandalone": {"name": "frame", "image": "mysql:5.7", "port": 3306, "clusterTag": false, "backupCommand": ["mysqld"]},
            "userStandalone": {"name": "user", "image": "etcd:3.5", "ports": [2379, 2380], "clusterTag": true, "size": 3}
        }))
        .unwrap();
        assert_eq!(spec.master.size, Some(3));
        assert!(spec.master.cluster_tag);
        assert_eq!(spec.executor.command, vec!["./bin/executor".to_string()]);
        assert_eq!(spec.frame_storage.all_ports(), vec![3306]);
        assert_eq!(spec.frame_storage.command, vec!["mysqld".to_string()]);
        assert_eq!(spec.user_storage.all_ports(), vec![2379, 2380]);
    }

    #[test]
    fn test_status_wire_names() {
        let status = DataflowEngineStatus {
            master_names: vec!["de-master".to_string()],
            executor_names: vec![],
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value, json!({"masterNames": ["de-master"], "executorNames": []}));
    }
}
