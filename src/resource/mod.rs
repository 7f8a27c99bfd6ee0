// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod config_map;
pub mod service;
pub mod workload;
