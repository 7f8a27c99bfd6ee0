// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::error::Error;
use std::env;
use std::time::Duration;

pub const REQUEUE_SECS_ENV: &str = "DATAFLOW_REQUEUE_SECS";
pub const ERROR_REQUEUE_SECS_ENV: &str = "DATAFLOW_ERROR_REQUEUE_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Delay before a converged DataflowEngine is reconciled again.
    pub requeue_after: Duration,
    /// Delay before a failed pass is retried.
    pub error_requeue_after: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            requeue_after: Duration::from_secs(60),
            error_requeue_after: Duration::from_secs(10),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = ControllerConfig::default();
        Ok(ControllerConfig {
            requeue_after: parse_secs(&lookup, REQUEUE_SECS_ENV)?.unwrap_or(default.requeue_after),
            error_requeue_after: parse_secs(&lookup, ERROR_REQUEUE_SECS_ENV)?
                .unwrap_or(default.error_requeue_after),
        })
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, Error>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
            _ => Err(Error::InvalidConfig(format!(
                "{} must be a positive number of seconds, got {:?}",
                key, raw
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_overrides() {
        let config = ControllerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_overrides_and_rejects_zero() {
        let config = ControllerConfig::from_lookup(|key| match key {
            REQUEUE_SECS_ENV => Some("300".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.requeue_after, Duration::from_secs(300));
        assert_eq!(config.error_requeue_after, Duration::from_secs(10));

        let err = ControllerConfig::from_lookup(|key| match key {
            ERROR_REQUEUE_SECS_ENV => Some("0".to_string()),
            _ => None,
        });
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }
}
