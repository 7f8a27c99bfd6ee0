// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::config::ControllerConfig;
use crate::dataflowengine_types::DataflowEngine;
use crate::error::Error;
use crate::reconciler::reconcile_with;
use crate::shim_layer::kube_api_server::KubeApiServer;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{
    api::{Api, ListParams, Resource},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
    },
    Client,
};
use std::sync::Arc;
use tracing::*;

// Data is passed to reconcile.
// It carries the API server shim and the controller configuration.
pub struct Data {
    pub api: KubeApiServer,
    pub config: ControllerConfig,
}

// run_controller builds a controller for DataflowEngine that is also triggered
// by changes to any child object it owns.
pub async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let engines = Api::<DataflowEngine>::all(client.clone());

    info!("starting dataflow-engine controller");
    Controller::new(engines, ListParams::default())
        .owns(
            Api::<StatefulSet>::all(client.clone()),
            ListParams::default(),
        )
        .owns(
            Api::<Deployment>::all(client.clone()),
            ListParams::default(),
        )
        .owns(
            Api::<Service>::all(client.clone()),
            ListParams::default(),
        )
        .owns(
            Api::<ConfigMap>::all(client.clone()),
            ListParams::default(),
        )
        .shutdown_on_signal()
        .run(
            reconcile,
            error_policy,
            Arc::new(Data {
                api: KubeApiServer::new(client),
                config,
            }),
        )
        .for_each(|res| async move { report_controller_reconciled("dataflow-engine", &res) })
        .await;
    info!("controller terminated");
    Ok(())
}

pub fn report_controller_reconciled<K, QueueErr>(
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<Error, QueueErr>>,
) where
    K: Resource,
    QueueErr: std::error::Error,
{
    match result {
        Ok((obj, _)) => {
            info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            warn!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "Failed to reconcile object",
            );
        }
    }
}

/// Controller triggers this whenever a DataflowEngine or one of its children changed.
/// The cached object is only used for its key; the pass reads the latest version itself.
pub async fn reconcile(de: Arc<DataflowEngine>, ctx: Arc<Data>) -> Result<Action, Error> {
    let name = de
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = de
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    reconcile_with(&ctx.api, namespace, name, &ctx.config).await
}

/// The controller triggers this on reconcile errors. No error is fatal.
pub fn error_policy(de: Arc<DataflowEngine>, error: &Error, ctx: Arc<Data>) -> Action {
    warn!(
        engine = de.metadata.name.as_deref().unwrap_or_default(),
        stage = ?error.failed_stage(),
        "Reconcile failed due to error: {}",
        error
    );
    Action::requeue(ctx.config.error_requeue_after)
}
