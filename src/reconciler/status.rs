// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::api_server::ApiServer;
use crate::common::*;
use crate::dataflowengine_types::*;
use crate::error::{APIError, Error};
use tracing::*;

/// Member identities reported by the compute stages of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedMembers {
    pub master_names: Vec<String>,
    pub executor_names: Vec<String>,
}

impl ObservedMembers {
    fn into_status(self) -> DataflowEngineStatus {
        DataflowEngineStatus {
            master_names: self.master_names,
            executor_names: self.executor_names,
        }
    }
}

// update_status replaces the member lists of `de` with the ones observed in this
// pass. Nothing is written if the stored status already matches; a stale
// resource version refetches the engine and writes once more.
pub async fn update_status<A: ApiServer>(
    api: &A,
    de: &DataflowEngine,
    observed: ObservedMembers,
) -> Result<(), Error> {
    let status = observed.into_status();
    let namespace = engine_namespace(de)?;
    let name = engine_name(de)?;
    if de.status.as_ref() == Some(&status) {
        debug!(engine = %name, "Status is up to date");
        return Ok(());
    }
    match write_status(api, namespace, de, &status).await {
        Err(APIError::Conflict) => {
            info!(engine = %name, "Conflict on status update, refetch and retry");
            let latest = api
                .get::<DataflowEngine>(namespace, name)
                .await
                .map_err(Error::StatusUpdateFailed)?;
            if latest.status.as_ref() == Some(&status) {
                return Ok(());
            }
            write_status(api, namespace, &latest, &status)
                .await
                .map_err(Error::StatusUpdateFailed)
        }
        result => result.map_err(Error::StatusUpdateFailed),
    }
}

async fn write_status<A: ApiServer>(
    api: &A,
    namespace: &str,
    de: &DataflowEngine,
    status: &DataflowEngineStatus,
) -> Result<(), APIError> {
    let mut updated = de.clone();
    updated.status = Some(status.clone());
    info!(
        engine = de.metadata.name.as_deref().unwrap_or_default(),
        masters = status.master_names.len(),
        executors = status.executor_names.len(),
        "Update status"
    );
    api.update_status(namespace, &updated).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable_model::ExecutableApiServer;
    use kube::api::ObjectMeta;

    fn engine() -> DataflowEngine {
        let mut de = DataflowEngine::new("de", DataflowEngineSpec::default());
        de.metadata = ObjectMeta {
            name: Some("de".to_string()),
            namespace: Some("default".to_string()),
            ..ObjectMeta::default()
        };
        de
    }

    fn observed(executors: usize) -> ObservedMembers {
        ObservedMembers {
            master_names: vec!["de-master".to_string()],
            executor_names: (0..executors).map(|i| format!("de-executor-{}", i)).collect(),
        }
    }

    #[tokio::test]
    async fn test_status_is_replaced_not_appended() {
        let api = ExecutableApiServer::new();
        let de = api.create("default", &engine()).await.unwrap();
        update_status(&api, &de, observed(3)).await.unwrap();
        let de = api.get::<DataflowEngine>("default", "de").await.unwrap();
        update_status(&api, &de, observed(1)).await.unwrap();

        let de = api.get::<DataflowEngine>("default", "de").await.unwrap();
        assert_eq!(de.status.unwrap().executor_names, vec!["de-executor-0"]);
    }

    #[tokio::test]
    async fn test_equal_status_is_not_written() {
        let api = ExecutableApiServer::new();
        let de = api.create("default", &engine()).await.unwrap();
        update_status(&api, &de, observed(2)).await.unwrap();
        let de = api.get::<DataflowEngine>("default", "de").await.unwrap();
        let writes = api.write_count().await;
        update_status(&api, &de, observed(2)).await.unwrap();
        assert_eq!(api.write_count().await, writes);
    }

    #[tokio::test]
    async fn test_conflict_refetches_once() {
        let api = ExecutableApiServer::new();
        let de = api.create("default", &engine()).await.unwrap();
        api.bump_resource_version::<DataflowEngine>("default", "de")
            .await
            .unwrap();
        update_status(&api, &de, observed(1)).await.unwrap();
        let stored = api.get::<DataflowEngine>("default", "de").await.unwrap();
        assert_eq!(stored.status.unwrap().master_names, vec!["de-master"]);
    }
}
