// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::api_server::Object;
use crate::common::*;
use crate::reconciler::resource_builder::ResourceBuilder;
use crate::reconciler::subsystem::SubsystemPlan;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub const STORAGE_REQUEST: &str = "10Gi";
pub const PVC_RETENTION_DELETE: &str = "Delete";
pub const PVC_RETENTION_RETAIN: &str = "Retain";

/// A child that runs the members of a subsystem.
pub trait Workload: Object {
    fn replicas(&self) -> i32;
}

impl Workload for appsv1::Deployment {
    fn replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }
}

impl Workload for appsv1::StatefulSet {
    fn replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }
}

/// The fields of a workload the reconciler keeps in line with the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PodShape {
    image: Option<String>,
    command: Vec<String>,
    ports: Vec<i32>,
}

fn pod_shape(template: &corev1::PodTemplateSpec) -> Option<PodShape> {
    let container = template.spec.as_ref()?.containers.first()?;
    Some(PodShape {
        image: container.image.clone(),
        command: container.command.clone().unwrap_or_default(),
        ports: container
            .ports
            .as_ref()
            .map(|ports| ports.iter().map(|p| p.container_port).collect())
            .unwrap_or_default(),
    })
}

fn make_metadata(plan: &SubsystemPlan) -> ObjectMeta {
    ObjectMeta {
        name: Some(plan.child_name()),
        namespace: Some(plan.namespace.clone()),
        labels: Some(make_labels(&plan.engine, plan.subsystem)),
        owner_references: Some(vec![plan.owner.clone()]),
        ..ObjectMeta::default()
    }
}

fn make_selector(plan: &SubsystemPlan) -> metav1::LabelSelector {
    metav1::LabelSelector {
        match_labels: Some(selector_labels(&plan.engine, plan.subsystem)),
        ..metav1::LabelSelector::default()
    }
}

pub fn make_pod_template(plan: &SubsystemPlan) -> corev1::PodTemplateSpec {
    let dependencies = plan.subsystem.dependencies();
    corev1::PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(make_labels(&plan.engine, plan.subsystem)),
            ..ObjectMeta::default()
        }),
        spec: Some(corev1::PodSpec {
            containers: vec![corev1::Container {
                name: plan.container_name.clone(),
                image: Some(plan.image.clone()),
                command: if plan.command.is_empty() {
                    None
                } else {
                    Some(plan.command.clone())
                },
                ports: Some(
                    plan.ports
                        .iter()
                        .enumerate()
                        .map(|(i, port)| corev1::ContainerPort {
                            name: Some(format!("port-{}", i)),
                            container_port: *port,
                            ..corev1::ContainerPort::default()
                        })
                        .collect(),
                ),
                env_from: if dependencies.is_empty() {
                    None
                } else {
                    Some(
                        dependencies
                            .iter()
                            .map(|dependency| corev1::EnvFromSource {
                                config_map_ref: Some(corev1::ConfigMapEnvSource {
                                    name: Some(config_map_name(&plan.engine, *dependency)),
                                    optional: Some(false),
                                }),
                                ..corev1::EnvFromSource::default()
                            })
                            .collect(),
                    )
                },
                volume_mounts: if plan.subsystem.is_storage() {
                    Some(vec![corev1::VolumeMount {
                        name: DATA_VOLUME_NAME.to_string(),
                        mount_path: DATA_MOUNT_PATH.to_string(),
                        ..corev1::VolumeMount::default()
                    }])
                } else {
                    None
                },
                ..corev1::Container::default()
            }],
            ..corev1::PodSpec::default()
        }),
    }
}

// Standalone topology: one instance behind a Deployment.
// Storage keeps its data in an emptyDir, which lives as long as the pod.
pub struct DeploymentBuilder<'a> {
    plan: &'a SubsystemPlan,
}

impl<'a> DeploymentBuilder<'a> {
    pub fn new(plan: &'a SubsystemPlan) -> Self {
        DeploymentBuilder { plan }
    }

    fn make_template(&self) -> corev1::PodTemplateSpec {
        let mut template = make_pod_template(self.plan);
        if self.plan.subsystem.is_storage() {
            if let Some(spec) = template.spec.as_mut() {
                spec.volumes = Some(vec![corev1::Volume {
                    name: DATA_VOLUME_NAME.to_string(),
                    empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
                    ..corev1::Volume::default()
                }]);
            }
        }
        template
    }
}

impl<'a> ResourceBuilder for DeploymentBuilder<'a> {
    type Output = appsv1::Deployment;

    fn name(&self) -> String {
        self.plan.child_name()
    }

    fn make(&self) -> appsv1::Deployment {
        appsv1::Deployment {
            metadata: make_metadata(self.plan),
            spec: Some(appsv1::DeploymentSpec {
                replicas: Some(self.plan.replicas),
                selector: make_selector(self.plan),
                template: self.make_template(),
                strategy: if self.plan.subsystem.is_storage() {
                    Some(appsv1::DeploymentStrategy {
                        type_: Some("Recreate".to_string()),
                        ..appsv1::DeploymentStrategy::default()
                    })
                } else {
                    None
                },
                ..appsv1::DeploymentSpec::default()
            }),
            ..appsv1::Deployment::default()
        }
    }

    fn matches(&self, found: &appsv1::Deployment) -> bool {
        found.replicas() == self.plan.replicas
            && found
                .spec
                .as_ref()
                .and_then(|spec| pod_shape(&spec.template))
                == pod_shape(&self.make_template())
    }

    fn update(&self, found: appsv1::Deployment) -> appsv1::Deployment {
        let mut spec = found.spec.clone().unwrap_or_default();
        spec.replicas = Some(self.plan.replicas);
        spec.template = self.make_template();
        let mut metadata = found.metadata.clone();
        metadata.labels = Some(merge_labels(
            metadata.labels.take(),
            make_labels(&self.plan.engine, self.plan.subsystem),
        ));
        appsv1::Deployment {
            metadata,
            spec: Some(spec),
            ..found
        }
    }
}

// Cluster topology: `replicas` members with stable ordinal identities.
// Storage members get a persistent volume claim each, deleted with the StatefulSet.
pub struct StatefulSetBuilder<'a> {
    plan: &'a SubsystemPlan,
}

impl<'a> StatefulSetBuilder<'a> {
    pub fn new(plan: &'a SubsystemPlan) -> Self {
        StatefulSetBuilder { plan }
    }

    fn make_volume_claim_templates(&self) -> Option<Vec<corev1::PersistentVolumeClaim>> {
        if !self.plan.subsystem.is_storage() {
            return None;
        }
        Some(vec![corev1::PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME_NAME.to_string()),
                labels: Some(selector_labels(&self.plan.engine, self.plan.subsystem)),
                ..ObjectMeta::default()
            },
            spec: Some(corev1::PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(corev1::ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(STORAGE_REQUEST.to_string()),
                    )])),
                    ..corev1::ResourceRequirements::default()
                }),
                ..corev1::PersistentVolumeClaimSpec::default()
            }),
            ..corev1::PersistentVolumeClaim::default()
        }])
    }

    fn make_retention_policy(
        &self,
    ) -> Option<appsv1::StatefulSetPersistentVolumeClaimRetentionPolicy> {
        if self.plan.subsystem.is_storage() {
            Some(released_retention_policy())
        } else {
            None
        }
    }
}

/// Retention policy under which the claims go away with their StatefulSet.
pub fn released_retention_policy() -> appsv1::StatefulSetPersistentVolumeClaimRetentionPolicy {
    appsv1::StatefulSetPersistentVolumeClaimRetentionPolicy {
        when_deleted: Some(PVC_RETENTION_DELETE.to_string()),
        when_scaled: Some(PVC_RETENTION_RETAIN.to_string()),
    }
}

/// Whether the claims of `sts` are released when it is deleted.
pub fn volumes_released_on_delete(sts: &appsv1::StatefulSet) -> bool {
    sts.spec
        .as_ref()
        .and_then(|spec| spec.persistent_volume_claim_retention_policy.as_ref())
        .and_then(|policy| policy.when_deleted.as_deref())
        == Some(PVC_RETENTION_DELETE)
}

impl<'a> ResourceBuilder for StatefulSetBuilder<'a> {
    type Output = appsv1::StatefulSet;

    fn name(&self) -> String {
        self.plan.child_name()
    }

    fn make(&self) -> appsv1::StatefulSet {
        appsv1::StatefulSet {
            metadata: make_metadata(self.plan),
            spec: Some(appsv1::StatefulSetSpec {
                replicas: Some(self.plan.replicas),
                service_name: self.plan.child_name(),
                selector: make_selector(self.plan),
                template: make_pod_template(self.plan),
                volume_claim_templates: self.make_volume_claim_templates(),
                persistent_volume_claim_retention_policy: self.make_retention_policy(),
                ..appsv1::StatefulSetSpec::default()
            }),
            ..appsv1::StatefulSet::default()
        }
    }

    fn matches(&self, found: &appsv1::StatefulSet) -> bool {
        found.replicas() == self.plan.replicas
            && found
                .spec
                .as_ref()
                .and_then(|spec| pod_shape(&spec.template))
                == pod_shape(&make_pod_template(self.plan))
    }

    // The claim retention policy is left out of the comparison: servers without
    // StatefulSetAutoDeletePVC drop it on every write. The finalizer manager
    // checks it before the engine is released.
    fn update(&self, found: appsv1::StatefulSet) -> appsv1::StatefulSet {
        // Volume claim templates and the selector are immutable, keep the found ones.
        let mut spec = found.spec.clone().unwrap_or_default();
        spec.replicas = Some(self.plan.replicas);
        spec.template = make_pod_template(self.plan);
        if let Some(policy) = self.make_retention_policy() {
            spec.persistent_volume_claim_retention_policy = Some(policy);
        }
        let mut metadata = found.metadata.clone();
        metadata.labels = Some(merge_labels(
            metadata.labels.take(),
            make_labels(&self.plan.engine, self.plan.subsystem),
        ));
        appsv1::StatefulSet {
            metadata,
            spec: Some(spec),
            ..found
        }
    }
}

fn merge_labels(
    found: Option<BTreeMap<String, String>>,
    desired: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = found.unwrap_or_default();
    labels.extend(desired);
    labels
}
