// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::common::member_name;
use std::fmt;

/// How one subsystem is deployed.
///
/// `Standalone` runs a single instance behind a Deployment; `Cluster` runs
/// `replicas` members with stable ordinal identities behind a StatefulSet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    Standalone,
    Cluster,
}

impl Topology {
    pub fn select(cluster_mode: bool) -> Topology {
        if cluster_mode {
            Topology::Cluster
        } else {
            Topology::Standalone
        }
    }

    /// The requested size only counts in cluster mode; absent means one member.
    pub fn effective_replicas(self, size: Option<i32>) -> i32 {
        match self {
            Topology::Standalone => 1,
            Topology::Cluster => size.unwrap_or(1),
        }
    }

    /// Identities of the running members of a child workload named `child`.
    pub fn member_names(self, child: &str, replicas: i32) -> Vec<String> {
        match self {
            Topology::Standalone => vec![child.to_string()],
            Topology::Cluster => (0..replicas.max(0))
                .map(|ordinal| member_name(child, ordinal))
                .collect(),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Standalone => write!(f, "standalone"),
            Topology::Cluster => write!(f, "cluster"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicas_ignored_outside_cluster_mode() {
        assert_eq!(Topology::select(false).effective_replicas(Some(5)), 1);
        assert_eq!(Topology::select(true).effective_replicas(Some(5)), 5);
        assert_eq!(Topology::select(true).effective_replicas(None), 1);
    }

    #[test]
    fn test_member_names() {
        assert_eq!(
            Topology::Standalone.member_names("de-sample-master", 1),
            vec!["de-sample-master"]
        );
        assert_eq!(
            Topology::Cluster.member_names("de-sample-executor", 3),
            vec![
                "de-sample-executor-0",
                "de-sample-executor-1",
                "de-sample-executor-2"
            ]
        );
        assert!(Topology::Cluster.member_names("x", 0).is_empty());
    }
}
