//! Cloud storage provider abstraction for cloudlink.
//!
//! This module provides the operations the health engine invokes on a
//! backend (token refresh and a lightweight probe), a registry resolving
//! provider clients by name and configuration, and the static capability
//! matrix used for provider selection and graceful degradation.
//!
//! # Design Principles
//! - Provider isolation: no provider-specific logic outside this crate
//! - Typed failures: every provider error is classified permanent or transient
//! - Static capabilities: the capability matrix is immutable after startup

pub mod capability;
pub mod degradation;
pub mod gdrive;
pub mod memory;
pub mod provider;
pub mod registry;

pub use capability::{
    create_default_capabilities, AuthType, CapabilityRecord, Feature, ProviderCapabilityRegistry,
    ProviderMatch, StorageModel,
};
pub use degradation::{Alternative, CapabilityDegradationService, DegradationImpact, DegradationPlan};
pub use memory::ScriptedProvider;
pub use provider::{ErrorClass, ProbeReport, ProviderClient, ProviderError, TokenGrant};
pub use registry::{create_default_registry, ProviderClients, ProviderFactory, ProviderRegistry};
