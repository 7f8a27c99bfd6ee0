// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::common::make_labels;
use crate::reconciler::resource_builder::ResourceBuilder;
use crate::reconciler::subsystem::SubsystemPlan;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

// The config map publishes where the members of a subsystem can be reached.
// Dependent subsystems import it into their environment.
pub struct ConfigMapBuilder<'a> {
    plan: &'a SubsystemPlan,
}

impl<'a> ConfigMapBuilder<'a> {
    pub fn new(plan: &'a SubsystemPlan) -> Self {
        ConfigMapBuilder { plan }
    }

    fn make_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            self.plan.subsystem.endpoints_key().to_string(),
            self.plan.endpoints().join(","),
        )])
    }
}

impl<'a> ResourceBuilder for ConfigMapBuilder<'a> {
    type Output = ConfigMap;

    fn name(&self) -> String {
        self.plan.config_map_name()
    }

    fn make(&self) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: Some(self.plan.namespace.clone()),
                labels: Some(make_labels(&self.plan.engine, self.plan.subsystem)),
                owner_references: Some(vec![self.plan.owner.clone()]),
                ..ObjectMeta::default()
            },
            data: Some(self.make_data()),
            ..ConfigMap::default()
        }
    }

    fn matches(&self, found: &ConfigMap) -> bool {
        found.data.as_ref() == Some(&self.make_data())
    }

    fn update(&self, found: ConfigMap) -> ConfigMap {
        ConfigMap {
            data: Some(self.make_data()),
            ..found
        }
    }
}
