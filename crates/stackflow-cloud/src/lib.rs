//! StackFlow Cloud
//!
//! Provider boundary between the reconciliation engine and an Apache
//! CloudStack control plane.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  StackFlow CLI                   │
//! │            (stack reconcile / delete)            │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │              stackflow-controller                │
//! │   stage pipeline · tags · network · affinity     │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                stackflow-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │      trait CloudStackApi { ... }          │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │   classify   │  │ Status Store │            │
//! │  └──────────────┘  └──────────────┘            │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼──────────────────┐
//! │ stackflow-cloud-cloudstack│
//! │      (cmk CLI)            │
//! └───────────────────────────┘
//! ```

pub mod classify;
pub mod error;
pub mod provider;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use classify::{ErrorClass, classify};
pub use error::{CloudError, Result};
pub use provider::{
    AccountRecord, AffinityGroupRecord, AuthStatus, CloudStackApi, CreateLoadBalancerRuleRequest,
    CreateNetworkRequest, DomainRecord, LoadBalancerRule, Lookup, NetworkOfferingRecord,
    NetworkRecord, PublicIpAddress, ResourceType, Scope, VirtualMachineRecord, ZoneRecord,
};
pub use state::{ClusterRecord, GlobalState, StateLock, StatusStore};
