// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::api_server::{ApiServer, Object};
use crate::common::*;
use crate::dataflowengine_types::*;
use crate::error::Error;
use crate::reconciler::resource_builder::*;
use crate::reconciler::topology::Topology;
use crate::resource::config_map::ConfigMapBuilder;
use crate::resource::service::ServiceBuilder;
use crate::resource::workload::{DeploymentBuilder, StatefulSetBuilder, Workload};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::fmt;
use tracing::*;

/// Largest member count of a cluster subsystem.
pub const MAX_CLUSTER_REPLICAS: i32 = 1000;

/// Size limit of a ConfigMap accepted by the API server.
pub const MAX_CONFIG_MAP_BYTES: usize = 1024 * 1024;

/// One of the four independently configured parts of a DataflowEngine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    FrameStorage,
    UserStorage,
    Master,
    Executor,
}

impl Subsystem {
    /// Stage order of a pass. Storage converges before the compute that depends on it.
    pub const STAGES: [Subsystem; 4] = [
        Subsystem::FrameStorage,
        Subsystem::UserStorage,
        Subsystem::Master,
        Subsystem::Executor,
    ];

    pub const STORAGE: [Subsystem; 2] = [Subsystem::FrameStorage, Subsystem::UserStorage];

    pub fn label(self) -> &'static str {
        match self {
            Subsystem::FrameStorage => "frame-storage",
            Subsystem::UserStorage => "user-storage",
            Subsystem::Master => "master",
            Subsystem::Executor => "executor",
        }
    }

    pub fn is_storage(self) -> bool {
        matches!(self, Subsystem::FrameStorage | Subsystem::UserStorage)
    }

    /// Key under which the subsystem publishes its member endpoints.
    pub fn endpoints_key(self) -> &'static str {
        match self {
            Subsystem::FrameStorage => "FRAME_STORAGE_ENDPOINTS",
            Subsystem::UserStorage => "USER_STORAGE_ENDPOINTS",
            Subsystem::Master => "MASTER_ENDPOINTS",
            Subsystem::Executor => "EXECUTOR_ENDPOINTS",
        }
    }

    /// Subsystems whose endpoints this subsystem's members consume.
    pub fn dependencies(self) -> &'static [Subsystem] {
        match self {
            Subsystem::FrameStorage | Subsystem::UserStorage => &[],
            Subsystem::Master => &[Subsystem::FrameStorage, Subsystem::UserStorage],
            Subsystem::Executor => &[
                Subsystem::FrameStorage,
                Subsystem::UserStorage,
                Subsystem::Master,
            ],
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Desired state of one subsystem, resolved from the DataflowEngine spec.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemPlan {
    pub subsystem: Subsystem,
    pub topology: Topology,
    pub engine: String,
    pub namespace: String,
    pub container_name: String,
    pub image: String,
    pub replicas: i32,
    pub command: Vec<String>,
    pub ports: Vec<i32>,
    pub owner: OwnerReference,
}

impl SubsystemPlan {
    pub fn from_engine(de: &DataflowEngine, subsystem: Subsystem) -> Result<SubsystemPlan, Error> {
        let engine = engine_name(de)?.to_string();
        let namespace = engine_namespace(de)?.to_string();
        let owner = make_owner_reference(de)?;
        let (name, image, size, command, ports, cluster_tag) = match subsystem {
            Subsystem::FrameStorage | Subsystem::UserStorage => {
                let storage = if subsystem == Subsystem::FrameStorage {
                    &de.spec.frame_storage
                } else {
                    &de.spec.user_storage
                };
                (
                    &storage.name,
                    &storage.image,
                    storage.size,
                    &storage.command,
                    storage.all_ports(),
                    storage.cluster_tag,
                )
            }
            Subsystem::Master | Subsystem::Executor => {
                let component = if subsystem == Subsystem::Master {
                    &de.spec.master
                } else {
                    &de.spec.executor
                };
                (
                    &component.name,
                    &de.spec.image,
                    component.size,
                    &component.command,
                    vec![component.ports],
                    component.cluster_tag,
                )
            }
        };
        let topology = Topology::select(cluster_tag);
        Ok(SubsystemPlan {
            subsystem,
            topology,
            container_name: if name.is_empty() {
                subsystem.label().to_string()
            } else {
                name.clone()
            },
            image: image.clone(),
            replicas: topology.effective_replicas(size),
            command: command.clone(),
            ports,
            engine,
            namespace,
            owner,
        })
    }

    /// Rejects a desired state that cannot be converged.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Error::InvalidSpec {
            subsystem: self.subsystem,
            reason,
        };
        if self.image.trim().is_empty() {
            return Err(invalid("image must be set".to_string()));
        }
        if self.ports.is_empty() {
            return Err(invalid("at least one port is required".to_string()));
        }
        if let Some(port) = self.ports.iter().find(|p| !(1..=65535).contains(*p)) {
            return Err(invalid(format!("port {} is out of range", port)));
        }
        if let Some(port) = self
            .ports
            .iter()
            .enumerate()
            .find_map(|(i, p)| self.ports[..i].contains(p).then_some(p))
        {
            return Err(invalid(format!("port {} is listed more than once", port)));
        }
        if self.replicas < 1 {
            return Err(invalid(format!(
                "replicas must be at least 1, got {}",
                self.replicas
            )));
        }
        if self.replicas > MAX_CLUSTER_REPLICAS {
            return Err(invalid(format!(
                "replicas must be at most {}, got {}",
                MAX_CLUSTER_REPLICAS, self.replicas
            )));
        }
        // Checked after the replica bound, so building the endpoints stays cheap.
        let published = self.endpoints().join(",").len();
        if published > MAX_CONFIG_MAP_BYTES {
            return Err(invalid(format!(
                "endpoints take {} bytes, more than a ConfigMap holds",
                published
            )));
        }
        Ok(())
    }

    pub fn child_name(&self) -> String {
        child_name(&self.engine, self.subsystem)
    }

    pub fn config_map_name(&self) -> String {
        config_map_name(&self.engine, self.subsystem)
    }

    /// Addresses of the desired members on the first port.
    pub fn endpoints(&self) -> Vec<String> {
        let child = self.child_name();
        let port = self.ports.first().copied().unwrap_or_default();
        self.topology
            .member_names(&child, self.replicas)
            .into_iter()
            .map(|member| match self.topology {
                Topology::Standalone => format!("{}.{}.svc:{}", member, self.namespace, port),
                Topology::Cluster => {
                    format!("{}.{}.{}.svc:{}", member, child, self.namespace, port)
                }
            })
            .collect()
    }
}

// reconcile_subsystem converges the config blob, the service and the workload of
// one subsystem, and returns the identities of the workload members it observed.
pub async fn reconcile_subsystem<A: ApiServer>(
    api: &A,
    de: &DataflowEngine,
    subsystem: Subsystem,
    intent: Intent,
) -> Result<Vec<String>, Error> {
    let plan = SubsystemPlan::from_engine(de, subsystem)?;
    if intent == Intent::Converge {
        plan.validate()?;
    }
    info!(
        engine = %plan.engine,
        subsystem = %subsystem,
        topology = %plan.topology,
        replicas = plan.replicas,
        "Reconcile subsystem"
    );

    reconcile_resource(
        api,
        &plan.namespace,
        &plan.owner,
        &ConfigMapBuilder::new(&plan),
        intent,
    )
    .await?;
    reconcile_resource(
        api,
        &plan.namespace,
        &plan.owner,
        &ServiceBuilder::new(&plan),
        intent,
    )
    .await?;
    match plan.topology {
        Topology::Standalone => {
            reconcile_workload::<_, _, StatefulSet>(api, &plan, &DeploymentBuilder::new(&plan), intent)
                .await
        }
        Topology::Cluster => {
            reconcile_workload::<_, _, Deployment>(api, &plan, &StatefulSetBuilder::new(&plan), intent)
                .await
        }
    }
}

// reconcile_workload converges the workload of the selected topology, then removes
// the workload the other topology left behind under the same name.
async fn reconcile_workload<A, B, Stale>(
    api: &A,
    plan: &SubsystemPlan,
    builder: &B,
    intent: Intent,
) -> Result<Vec<String>, Error>
where
    A: ApiServer,
    B: ResourceBuilder,
    B::Output: Workload,
    Stale: Object,
{
    let child = plan.child_name();
    let workload = reconcile_resource(api, &plan.namespace, &plan.owner, builder, intent).await?;
    if intent == Intent::Converge
        && remove_stale::<A, Stale>(api, &plan.namespace, &plan.owner, &child).await?
    {
        info!(
            subsystem = %plan.subsystem,
            name = %child,
            "Removed workload left by the previous topology"
        );
    }
    Ok(workload
        .map(|w| plan.topology.member_names(&child, w.replicas()))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn engine() -> DataflowEngine {
        let mut de = DataflowEngine::new(
            "de-sample",
            DataflowEngineSpec {
                image: "dataflow:v1".to_string(),
                master: ComponentSpec {
                    name: "server-master".to_string(),
                    size: Some(3),
                    command: vec!["./bin/master".to_string()],
                    ports: 10240,
                    cluster_tag: false,
                },
                executor: ComponentSpec {
                    name: "server-executor".to_string(),
                    size: Some(3),
                    command: vec![],
                    ports: 10241,
                    cluster_tag: true,
                },
                frame_storage: StorageSpec {
                    name: "mysql".to_string(),
                    image: "mysql:5.7".to_string(),
                    port: Some(3306),
                    ..StorageSpec::default()
                },
                user_storage: StorageSpec {
                    name: "etcd".to_string(),
                    image: "etcd:3.5".to_string(),
                    ports: vec![2379, 2380],
                    ..StorageSpec::default()
                },
            },
        );
        de.metadata = ObjectMeta {
            name: Some("de-sample".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("uid-1".to_string()),
            ..ObjectMeta::default()
        };
        de
    }

    #[test]
    fn test_plan_uses_engine_image_for_compute() {
        let de = engine();
        let master = SubsystemPlan::from_engine(&de, Subsystem::Master).unwrap();
        assert_eq!(master.image, "dataflow:v1");
        assert_eq!(master.topology, Topology::Standalone);
        assert_eq!(master.replicas, 1);
        assert_eq!(master.child_name(), "de-sample-master");

        let user = SubsystemPlan::from_engine(&de, Subsystem::UserStorage).unwrap();
        assert_eq!(user.image, "etcd:3.5");
        assert_eq!(user.ports, vec![2379, 2380]);
        assert_eq!(user.container_name, "etcd");
    }

    #[test]
    fn test_cluster_endpoints() {
        let de = engine();
        let executor = SubsystemPlan::from_engine(&de, Subsystem::Executor).unwrap();
        assert_eq!(
            executor.endpoints(),
            vec![
                "de-sample-executor-0.de-sample-executor.default.svc:10241",
                "de-sample-executor-1.de-sample-executor.default.svc:10241",
                "de-sample-executor-2.de-sample-executor.default.svc:10241",
            ]
        );
        let frame = SubsystemPlan::from_engine(&de, Subsystem::FrameStorage).unwrap();
        assert_eq!(
            frame.endpoints(),
            vec!["de-sample-frame-storage.default.svc:3306"]
        );
    }

    #[test]
    fn test_validation() {
        let mut de = engine();
        de.spec.master.ports = 0;
        let master = SubsystemPlan::from_engine(&de, Subsystem::Master).unwrap();
        assert!(matches!(
            master.validate(),
            Err(Error::InvalidSpec {
                subsystem: Subsystem::Master,
                ..
            })
        ));

        de.spec.frame_storage.port = None;
        let frame = SubsystemPlan::from_engine(&de, Subsystem::FrameStorage).unwrap();
        assert!(frame.validate().is_err());

        de.spec.executor.size = Some(0);
        let executor = SubsystemPlan::from_engine(&de, Subsystem::Executor).unwrap();
        assert!(executor.validate().is_err());

        de.spec.image = String::new();
        let executor = SubsystemPlan::from_engine(&de, Subsystem::Executor).unwrap();
        assert!(executor.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_replicas() {
        let mut de = engine();
        de.spec.executor.size = Some(MAX_CLUSTER_REPLICAS);
        let executor = SubsystemPlan::from_engine(&de, Subsystem::Executor).unwrap();
        executor.validate().unwrap();
        assert!(executor.endpoints().join(",").len() < MAX_CONFIG_MAP_BYTES);

        for size in [MAX_CLUSTER_REPLICAS + 1, 30000, i32::MAX] {
            de.spec.executor.size = Some(size);
            let executor = SubsystemPlan::from_engine(&de, Subsystem::Executor).unwrap();
            assert!(matches!(
                executor.validate(),
                Err(Error::InvalidSpec {
                    subsystem: Subsystem::Executor,
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_validation_rejects_duplicate_ports() {
        let mut de = engine();
        de.spec.frame_storage.ports = vec![3306];
        let frame = SubsystemPlan::from_engine(&de, Subsystem::FrameStorage).unwrap();
        assert_eq!(frame.ports, vec![3306, 3306]);
        assert!(matches!(
            frame.validate(),
            Err(Error::InvalidSpec {
                subsystem: Subsystem::FrameStorage,
                ..
            })
        ));
    }

    #[test]
    fn test_stage_order_puts_storage_first() {
        let positions: Vec<bool> = Subsystem::STAGES.iter().map(|s| s.is_storage()).collect();
        assert_eq!(positions, vec![true, true, false, false]);
        for (i, subsystem) in Subsystem::STAGES.iter().enumerate() {
            for dependency in subsystem.dependencies() {
                let position = Subsystem::STAGES.iter().position(|s| s == dependency).unwrap();
                assert!(position < i);
            }
        }
    }
}
