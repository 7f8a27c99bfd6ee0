// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::reconciler::subsystem::Subsystem;
use thiserror::Error;

/// Failures reported by the API server for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum APIError {
    #[error("object not found")]
    ObjectNotFound,
    #[error("object already exists")]
    ObjectAlreadyExists,
    #[error("resource version conflict")]
    Conflict,
    #[error("bad request")]
    BadRequest,
    #[error("invalid object")]
    Invalid,
    #[error("forbidden")]
    Forbidden,
    #[error("internal error")]
    InternalError,
    #[error("timeout")]
    Timeout,
    #[error("server timeout")]
    ServerTimeout,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get DataflowEngine: {0}")]
    CRGetFailed(#[source] APIError),
    #[error("Failed to reconcile {kind} {name}: {source}")]
    ReconcileChildFailed {
        kind: String,
        name: String,
        #[source]
        source: APIError,
    },
    #[error("{kind} {name} is not controlled by this DataflowEngine")]
    NotOwned { kind: String, name: String },
    #[error("Invalid {subsystem} spec: {reason}")]
    InvalidSpec { subsystem: Subsystem, reason: String },
    #[error("Failed to update status: {0}")]
    StatusUpdateFailed(#[source] APIError),
    #[error("Volume claims of StatefulSet {name} are not released on delete")]
    StorageNotReleased { name: String },
    #[error("Failed to update finalizers: {0}")]
    FinalizerUpdateFailed(#[source] APIError),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("{subsystem} stage failed: {source}")]
    StageFailed {
        subsystem: Subsystem,
        #[source]
        source: Box<Error>,
    },
    #[error("Invalid controller configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn child(kind: &str, name: &str, source: APIError) -> Self {
        Error::ReconcileChildFailed {
            kind: kind.to_string(),
            name: name.to_string(),
            source,
        }
    }

    /// The stage that failed, if the error came out of a subsystem stage.
    pub fn failed_stage(&self) -> Option<Subsystem> {
        match self {
            Error::StageFailed { subsystem, .. } => Some(*subsystem),
            _ => None,
        }
    }
}
