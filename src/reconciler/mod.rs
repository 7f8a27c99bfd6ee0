// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod finalizer;
pub mod resource_builder;
pub mod status;
pub mod subsystem;
pub mod topology;

use crate::api_server::ApiServer;
use crate::config::ControllerConfig;
use crate::dataflowengine_types::DataflowEngine;
use crate::error::{APIError, Error};
use finalizer::{cleanup_and_release, ensure_finalizer, FinalizerState};
use kube::runtime::controller::Action;
use resource_builder::Intent;
use status::{update_status, ObservedMembers};
use subsystem::{reconcile_subsystem, Subsystem};
use tracing::*;

// reconcile_with runs one pass for the DataflowEngine `namespace/name`:
// fetch it, converge the four subsystems in stage order, then either record
// the observed members or, once deletion was requested, release it.
pub async fn reconcile_with<A: ApiServer>(
    api: &A,
    namespace: &str,
    name: &str,
    config: &ControllerConfig,
) -> Result<Action, Error> {
    let de = match api.get::<DataflowEngine>(namespace, name).await {
        Ok(de) => de,
        Err(APIError::ObjectNotFound) => {
            info!(engine = %name, namespace = %namespace, "DataflowEngine is gone, nothing to do");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::CRGetFailed(e)),
    };
    debug!(engine = %name, "Reconcile {}", de.summary());

    match FinalizerState::of(&de) {
        FinalizerState::NotDeleting => {
            let observed = run_stages(api, &de, Intent::Converge).await?;
            let de = ensure_finalizer(api, &de).await?;
            update_status(api, &de, observed).await?;
            Ok(Action::requeue(config.requeue_after))
        }
        FinalizerState::PendingCleanup | FinalizerState::FinalizerRemoved => {
            info!(engine = %name, "DataflowEngine is being deleted");
            run_stages(api, &de, Intent::Observe).await?;
            cleanup_and_release(api, &de).await?;
            Ok(Action::await_change())
        }
    }
}

// run_stages visits the subsystems in stage order and stops at the first
// failure, so compute never runs against storage that did not converge.
async fn run_stages<A: ApiServer>(
    api: &A,
    de: &DataflowEngine,
    intent: Intent,
) -> Result<ObservedMembers, Error> {
    let mut observed = ObservedMembers::default();
    for subsystem in Subsystem::STAGES {
        let members = reconcile_subsystem(api, de, subsystem, intent)
            .await
            .map_err(|e| Error::StageFailed {
                subsystem,
                source: Box::new(e),
            })?;
        match subsystem {
            Subsystem::Master => observed.master_names = members,
            Subsystem::Executor => observed.executor_names = members,
            Subsystem::FrameStorage | Subsystem::UserStorage => {}
        }
    }
    Ok(observed)
}
