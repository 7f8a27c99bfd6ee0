// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod api_server;
pub mod common;
pub mod config;
pub mod dataflowengine_types;
pub mod error;
pub mod executable_model;
pub mod reconciler;
pub mod resource;
pub mod shim_layer;

pub use error::{APIError, Error};
