// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::api_server::{ApiServer, Object};
use crate::error::APIError;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::ErrorResponse;
use kube::Client;

// KubeApiServer forwards every request to the Kubernetes API through kube-rs.
// Writes use replace (PUT) so the resource version in the object is checked by the server.
#[derive(Clone)]
pub struct KubeApiServer {
    client: Client,
}

impl KubeApiServer {
    pub fn new(client: Client) -> Self {
        KubeApiServer { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::<K>::namespaced(self.client.clone(), namespace)
    }
}

fn object_name<K: Object>(obj: &K) -> Result<&str, APIError> {
    obj.meta().name.as_deref().ok_or(APIError::Invalid)
}

impl ApiServer for KubeApiServer {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K, APIError> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, APIError> {
        self.api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn update<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, APIError> {
        let name = object_name(obj)?;
        self.api::<K>(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn update_status<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, APIError> {
        let name = object_name(obj)?;
        let data = serde_json::to_vec(obj).map_err(|e| APIError::Other(e.to_string()))?;
        self.api::<K>(namespace)
            .replace_status(name, &PostParams::default(), data)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), APIError> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| kube_error_to_api_error(&e))
    }
}

/// Translates the error returned by kube-rs into the reconciler's error taxonomy.
pub fn kube_error_to_api_error(error: &kube::Error) -> APIError {
    match error {
        kube::Error::Api(ErrorResponse {
            reason, message, ..
        }) => match reason.as_str() {
            "NotFound" => APIError::ObjectNotFound,
            "AlreadyExists" => APIError::ObjectAlreadyExists,
            "Conflict" => APIError::Conflict,
            "BadRequest" => APIError::BadRequest,
            "Invalid" => APIError::Invalid,
            "Forbidden" => APIError::Forbidden,
            "InternalError" => APIError::InternalError,
            "Timeout" => APIError::Timeout,
            "ServerTimeout" => APIError::ServerTimeout,
            _ => APIError::Other(format!("{}: {}", reason, message)),
        },
        _ => APIError::Other(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(reason: &str, code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} happened", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_error_translation() {
        assert_eq!(
            kube_error_to_api_error(&api_error("NotFound", 404)),
            APIError::ObjectNotFound
        );
        assert_eq!(
            kube_error_to_api_error(&api_error("AlreadyExists", 409)),
            APIError::ObjectAlreadyExists
        );
        assert_eq!(
            kube_error_to_api_error(&api_error("Conflict", 409)),
            APIError::Conflict
        );
        assert_eq!(
            kube_error_to_api_error(&api_error("TooManyRequests", 429)),
            APIError::Other("TooManyRequests: TooManyRequests happened".to_string())
        );
    }
}
