//! StackFlow reconciliation engine
//!
//! Converges a declared [`ClusterTopology`](stackflow_core::ClusterTopology)
//! against a CloudStack control plane through the
//! [`CloudStackApi`](stackflow_cloud::CloudStackApi) boundary.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ClusterController / MachineController        │
//! │   Phase::Active       Phase::Terminating     │
//! └───────┬──────────┬─────────────┬─────────────┘
//!         │          │             │
//!   ZoneResolver  NetworkProvisioner  AffinityGroupManager
//!   DomainResolver       │
//!                   TagAccessor
//!         │          │             │
//! ┌───────▼──────────▼─────────────▼─────────────┐
//! │ dyn CloudStackApi                            │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The engine spawns no tasks. The caller persists the status it returns
//! and re-invokes after [`Action::requeue_after`].

pub mod action;
pub mod affinity;
pub mod controller;
pub mod domain;
pub mod error;
pub mod machine;
pub mod network;
pub mod tags;
pub mod zone;

pub use action::{
    Action, DEFAULT_RESYNC, ReconcileReport, ReportSummary, StageOutcome, StageReport, StageStatus,
};
pub use affinity::AffinityGroupManager;
pub use controller::{ClusterController, ControllerConfig, Phase, Stage};
pub use domain::{DomainResolver, scope_of};
pub use error::{ReconcileError, Result};
pub use machine::{MachineController, MachineStage};
pub use network::{DEFAULT_NETWORK_OFFERING, NetworkProvisioner};
pub use tags::{CLUSTER_TAG_PREFIX, CREATED_BY_TAG, TagAccessor, cluster_tag_name};
pub use zone::ZoneResolver;
