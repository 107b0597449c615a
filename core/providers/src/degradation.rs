//! Workarounds for features a provider lacks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use cloudlink_common::ProviderId;

use crate::capability::{CapabilityRecord, Feature, ProviderCapabilityRegistry, StorageModel};

/// How noticeable a workaround is to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationImpact {
    Low,
    Medium,
    High,
}

/// A documented substitute for a missing feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alternative {
    /// Machine-readable strategy name.
    pub strategy: String,
    /// Human-readable explanation of the workaround.
    pub description: String,
    pub impact: DegradationImpact,
}

impl Alternative {
    fn new(strategy: &str, description: &str, impact: DegradationImpact) -> Self {
        Self {
            strategy: strategy.to_string(),
            description: description.to_string(),
            impact,
        }
    }
}

/// Degradation outlook for a set of required features on one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationPlan {
    /// Features the provider supports natively.
    pub native: Vec<Feature>,
    /// Missing features and the workaround picked for each.
    pub degraded: Vec<(Feature, Alternative)>,
    /// Missing features with no known workaround.
    pub unsupported: Vec<Feature>,
}

impl DegradationPlan {
    /// True if every required feature is native or has a workaround.
    pub fn is_viable(&self) -> bool {
        self.unsupported.is_empty()
    }
}

/// Looks up workarounds instead of failing when a provider lacks a feature.
pub struct CapabilityDegradationService {
    registry: Arc<ProviderCapabilityRegistry>,
}

impl CapabilityDegradationService {
    /// Create a service over a capability registry.
    pub fn new(registry: Arc<ProviderCapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this service consults.
    pub fn registry(&self) -> &ProviderCapabilityRegistry {
        &self.registry
    }

    /// True if the provider supports `feature` or a known workaround exists.
    ///
    /// Unknown providers cannot degrade.
    pub fn can_gracefully_degrade(&self, feature: Feature, provider: &ProviderId) -> bool {
        match self.registry.get_capabilities(provider) {
            Some(record) => record.supports(feature) || !alternatives_for(feature, record).is_empty(),
            None => false,
        }
    }

    /// Workarounds for `feature` on `provider`, best first.
    ///
    /// Empty when the feature is supported natively, the provider is unknown,
    /// or no substitute exists.
    pub fn get_feature_alternatives(&self, feature: Feature, provider: &ProviderId) -> Vec<Alternative> {
        match self.registry.get_capabilities(provider) {
            Some(record) if !record.supports(feature) => alternatives_for(feature, record),
            _ => Vec::new(),
        }
    }

    /// Plan how `provider` would serve `required`, picking the lowest-impact workaround per gap.
    pub fn degradation_plan(&self, required: &[Feature], provider: &ProviderId) -> DegradationPlan {
        let mut plan = DegradationPlan::default();
        let Some(record) = self.registry.get_capabilities(provider) else {
            plan.unsupported = required.to_vec();
            return plan;
        };

        for feature in required {
            if record.supports(*feature) {
                plan.native.push(*feature);
                continue;
            }
            match alternatives_for(*feature, record).into_iter().next() {
                Some(alternative) => {
                    debug!(
                        "Degrading {} on {} via {}",
                        feature, provider, alternative.strategy
                    );
                    plan.degraded.push((*feature, alternative));
                }
                None => plan.unsupported.push(*feature),
            }
        }

        plan
    }
}

/// Known workarounds, ordered by impact.
fn alternatives_for(feature: Feature, record: &CapabilityRecord) -> Vec<Alternative> {
    let mut alternatives = Vec::new();

    match feature {
        Feature::FolderCreation => {
            if record.storage_model == StorageModel::Flat {
                alternatives.push(Alternative::new(
                    "key_prefix_folders",
                    "Emulate folders with '/'-delimited object key prefixes",
                    DegradationImpact::Low,
                ));
            }
        }
        Feature::PresignedUrls => {
            if record.supports(Feature::FileSharing) {
                alternatives.push(Alternative::new(
                    "shareable_link",
                    "Grant link access through the provider's sharing permissions",
                    DegradationImpact::Low,
                ));
            }
            alternatives.push(Alternative::new(
                "proxied_download",
                "Stream downloads through the application using the stored credentials",
                DegradationImpact::Medium,
            ));
        }
        Feature::StorageClasses => {
            alternatives.push(Alternative::new(
                "default_storage_tier",
                "Store every object in the provider's default tier",
                DegradationImpact::Low,
            ));
        }
        Feature::OauthAuthentication => {
            if record.supports(Feature::ApiKeyAuthentication) {
                alternatives.push(Alternative::new(
                    "native_api_key_auth",
                    "Use the provider's native access-key authentication; no per-user grant exists to refresh",
                    DegradationImpact::Low,
                ));
            }
        }
        Feature::ApiKeyAuthentication => {
            if record.supports(Feature::OauthAuthentication) {
                alternatives.push(Alternative::new(
                    "native_oauth_auth",
                    "Use the provider's native per-user OAuth grant; no static access keys are issued",
                    DegradationImpact::Low,
                ));
            }
        }
        Feature::ResumableUploads => {
            if record.supports(Feature::MultipartUploads) {
                alternatives.push(Alternative::new(
                    "multipart_upload",
                    "Upload in independently retried parts and complete the object at the end",
                    DegradationImpact::Low,
                ));
            }
            alternatives.push(Alternative::new(
                "single_request_upload",
                "Upload each file in one request and restart it from zero on failure",
                DegradationImpact::High,
            ));
        }
        Feature::MultipartUploads => {
            if record.supports(Feature::ResumableUploads) {
                alternatives.push(Alternative::new(
                    "resumable_upload",
                    "Send chunks through a resumable upload session",
                    DegradationImpact::Low,
                ));
            }
            alternatives.push(Alternative::new(
                "single_request_upload",
                "Upload each file in one request and restart it from zero on failure",
                DegradationImpact::High,
            ));
        }
        Feature::FileSharing => {
            if record.supports(Feature::PresignedUrls) {
                alternatives.push(Alternative::new(
                    "presigned_url_sharing",
                    "Share time-limited presigned URLs instead of provider permissions",
                    DegradationImpact::Medium,
                ));
            }
        }
    }

    alternatives.sort_by_key(|a| a.impact);
    alternatives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::create_default_capabilities;

    fn service() -> CapabilityDegradationService {
        CapabilityDegradationService::new(Arc::new(create_default_capabilities().unwrap()))
    }

    fn id(s: &str) -> ProviderId {
        ProviderId::new(s).unwrap()
    }

    #[test]
    fn test_flat_storage_emulates_folders() {
        let service = service();
        let alternatives = service.get_feature_alternatives(Feature::FolderCreation, &id("amazon-s3"));
        assert_eq!(alternatives.len(), 1);
        assert_eq!(alternatives[0].strategy, "key_prefix_folders");
        assert!(service.can_gracefully_degrade(Feature::FolderCreation, &id("amazon-s3")));
    }

    #[test]
    fn test_supported_feature_has_no_alternatives() {
        let service = service();
        assert!(service
            .get_feature_alternatives(Feature::FolderCreation, &id("google-drive"))
            .is_empty());
        assert!(service.can_gracefully_degrade(Feature::FolderCreation, &id("google-drive")));
    }

    #[test]
    fn test_presigned_urls_on_drive_prefers_sharing() {
        let service = service();
        let alternatives = service.get_feature_alternatives(Feature::PresignedUrls, &id("google-drive"));
        assert_eq!(alternatives[0].strategy, "shareable_link");
        assert_eq!(alternatives[1].strategy, "proxied_download");
    }

    #[test]
    fn test_oauth_on_s3_uses_native_auth() {
        let service = service();
        let alternatives =
            service.get_feature_alternatives(Feature::OauthAuthentication, &id("amazon-s3"));
        assert_eq!(alternatives[0].strategy, "native_api_key_auth");
        assert!(alternatives[0].description.contains("native"));

        let alternatives =
            service.get_feature_alternatives(Feature::ApiKeyAuthentication, &id("google-drive"));
        assert_eq!(alternatives[0].strategy, "native_oauth_auth");
    }

    #[test]
    fn test_unknown_provider_cannot_degrade() {
        let service = service();
        assert!(!service.can_gracefully_degrade(Feature::StorageClasses, &id("dropbox")));
        assert!(service
            .get_feature_alternatives(Feature::StorageClasses, &id("dropbox"))
            .is_empty());
    }

    #[test]
    fn test_degradation_plan() {
        let service = service();
        let plan = service.degradation_plan(
            &[
                Feature::FolderCreation,
                Feature::PresignedUrls,
                Feature::FileSharing,
            ],
            &id("amazon-s3"),
        );
        assert_eq!(plan.native, vec![Feature::PresignedUrls]);
        assert_eq!(plan.degraded.len(), 2);
        assert!(plan.is_viable());

        let unknown = service.degradation_plan(&[Feature::FileSharing], &id("dropbox"));
        assert!(!unknown.is_viable());
    }
}
