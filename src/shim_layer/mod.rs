// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod controller_runtime;
pub mod kube_api_server;

pub use controller_runtime::{error_policy, reconcile, run_controller, Data};
pub use kube_api_server::{kube_error_to_api_error, KubeApiServer};
