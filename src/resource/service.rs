// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::common::{make_labels, selector_labels};
use crate::reconciler::resource_builder::ResourceBuilder;
use crate::reconciler::subsystem::SubsystemPlan;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

// The service is headless in both topologies: it assigns a domain name to the
// standalone instance and to every cluster member, and clusterIP never has to
// change when the topology flips.
pub struct ServiceBuilder<'a> {
    plan: &'a SubsystemPlan,
}

impl<'a> ServiceBuilder<'a> {
    pub fn new(plan: &'a SubsystemPlan) -> Self {
        ServiceBuilder { plan }
    }

    fn make_ports(&self) -> Vec<corev1::ServicePort> {
        self.plan
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| corev1::ServicePort {
                name: Some(format!("port-{}", i)),
                port: *port,
                target_port: Some(IntOrString::Int(*port)),
                ..corev1::ServicePort::default()
            })
            .collect()
    }
}

fn port_numbers(svc: &corev1::Service) -> Vec<i32> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect())
        .unwrap_or_default()
}

impl<'a> ResourceBuilder for ServiceBuilder<'a> {
    type Output = corev1::Service;

    fn name(&self) -> String {
        self.plan.child_name()
    }

    fn make(&self) -> corev1::Service {
        corev1::Service {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: Some(self.plan.namespace.clone()),
                labels: Some(make_labels(&self.plan.engine, self.plan.subsystem)),
                owner_references: Some(vec![self.plan.owner.clone()]),
                ..ObjectMeta::default()
            },
            spec: Some(corev1::ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(selector_labels(&self.plan.engine, self.plan.subsystem)),
                ports: Some(self.make_ports()),
                publish_not_ready_addresses: Some(true),
                ..corev1::ServiceSpec::default()
            }),
            ..corev1::Service::default()
        }
    }

    fn matches(&self, found: &corev1::Service) -> bool {
        let selector = found.spec.as_ref().and_then(|spec| spec.selector.as_ref());
        port_numbers(found) == self.plan.ports
            && selector == Some(&selector_labels(&self.plan.engine, self.plan.subsystem))
    }

    fn update(&self, found: corev1::Service) -> corev1::Service {
        let mut spec = found.spec.clone().unwrap_or_default();
        spec.ports = Some(self.make_ports());
        spec.selector = Some(selector_labels(&self.plan.engine, self.plan.subsystem));
        corev1::Service {
            spec: Some(spec),
            ..found
        }
    }
}
