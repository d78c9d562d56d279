//! etcd cluster management on top of the container reconciliation engine.
//!
//! An etcd cluster is a set of member containers spread over remote
//! hosts. Reconciling it is more than reconciling containers: membership
//! changes must be announced to the live cluster in the right order, so a
//! member is removed from the cluster before its container stops and
//! added before its container starts.

pub mod cluster;
pub mod error;
pub mod member;

pub use cluster::{Cluster, ClusterDeployment};
pub use error::ClusterError;
pub use member::{Member, MemberConfig, MemberInfo, Membership};
