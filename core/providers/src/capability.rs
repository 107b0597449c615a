//! Static per-provider capability matrix.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use cloudlink_common::{Error, ProviderId, Result};

/// Optional features a provider may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    FolderCreation,
    PresignedUrls,
    StorageClasses,
    OauthAuthentication,
    ApiKeyAuthentication,
    ResumableUploads,
    MultipartUploads,
    FileSharing,
}

impl Feature {
    /// Every known feature.
    pub const ALL: [Feature; 8] = [
        Feature::FolderCreation,
        Feature::PresignedUrls,
        Feature::StorageClasses,
        Feature::OauthAuthentication,
        Feature::ApiKeyAuthentication,
        Feature::ResumableUploads,
        Feature::MultipartUploads,
        Feature::FileSharing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::FolderCreation => "folder_creation",
            Feature::PresignedUrls => "presigned_urls",
            Feature::StorageClasses => "storage_classes",
            Feature::OauthAuthentication => "oauth_authentication",
            Feature::ApiKeyAuthentication => "api_key_authentication",
            Feature::ResumableUploads => "resumable_uploads",
            Feature::MultipartUploads => "multipart_uploads",
            Feature::FileSharing => "file_sharing",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Feature::ALL
            .iter()
            .copied()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown feature '{}'", s)))
    }
}

/// How a provider organizes objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageModel {
    /// Keys in a bucket; "folders" are only prefixes.
    Flat,
    /// Real folder objects with parent references.
    Hierarchical,
}

/// How the application authenticates against a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Oauth,
    ApiKey,
}

/// Capabilities of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub provider: ProviderId,
    pub display_name: String,
    pub features: BTreeSet<Feature>,
    pub storage_model: StorageModel,
    pub auth_type: AuthType,
}

impl CapabilityRecord {
    /// Check if the provider supports a feature.
    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Best provider for a feature request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMatch {
    pub provider: ProviderId,
    pub score: u32,
    /// Preferred features the chosen provider lacks.
    pub missing_preferred: Vec<Feature>,
}

/// Points for covering every required feature.
const REQUIRED_WEIGHT: u32 = 10;
/// Points per preferred feature covered.
const PREFERRED_WEIGHT: u32 = 1;

/// Registry of provider capabilities, kept in registration order.
///
/// Loaded once at startup; lookups never mutate it.
#[derive(Debug, Clone, Default)]
pub struct ProviderCapabilityRegistry {
    records: Vec<CapabilityRecord>,
}

impl ProviderCapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider's capabilities.
    ///
    /// # Errors
    /// - Returns error if the provider is already registered
    pub fn register(&mut self, record: CapabilityRecord) -> Result<()> {
        if self.get_capabilities(&record.provider).is_some() {
            return Err(Error::AlreadyExists(format!(
                "Capabilities for '{}' are already registered",
                record.provider
            )));
        }
        self.records.push(record);
        Ok(())
    }

    /// Capabilities of a provider.
    pub fn get_capabilities(&self, provider: &ProviderId) -> Option<&CapabilityRecord> {
        self.records.iter().find(|r| &r.provider == provider)
    }

    /// Features supported by at least one registered provider.
    pub fn get_all_features(&self) -> BTreeSet<Feature> {
        self.records
            .iter()
            .flat_map(|r| r.features.iter().copied())
            .collect()
    }

    /// Which providers support each known feature.
    pub fn feature_matrix(&self) -> BTreeMap<Feature, Vec<ProviderId>> {
        Feature::ALL
            .iter()
            .map(|feature| {
                let providers = self
                    .records
                    .iter()
                    .filter(|r| r.supports(*feature))
                    .map(|r| r.provider.clone())
                    .collect();
                (*feature, providers)
            })
            .collect()
    }

    /// Registered providers in registration order.
    pub fn providers(&self) -> Vec<ProviderId> {
        self.records.iter().map(|r| r.provider.clone()).collect()
    }

    /// Pick the provider covering all `required` features with the most `preferred` ones.
    ///
    /// Providers missing any required feature are disqualified. Ties go to
    /// the provider registered first.
    pub fn find_best_provider_for_features(
        &self,
        required: &[Feature],
        preferred: &[Feature],
    ) -> Option<ProviderMatch> {
        let mut best: Option<ProviderMatch> = None;

        for record in &self.records {
            if !required.iter().all(|f| record.supports(*f)) {
                continue;
            }

            let covered = preferred.iter().filter(|f| record.supports(**f)).count() as u32;
            let score = REQUIRED_WEIGHT * required.len() as u32 + PREFERRED_WEIGHT * covered;

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(ProviderMatch {
                    provider: record.provider.clone(),
                    score,
                    missing_preferred: preferred
                        .iter()
                        .copied()
                        .filter(|f| !record.supports(*f))
                        .collect(),
                });
            }
        }

        best
    }
}

fn record(
    provider: &str,
    display_name: &str,
    storage_model: StorageModel,
    auth_type: AuthType,
    features: &[Feature],
) -> Result<CapabilityRecord> {
    Ok(CapabilityRecord {
        provider: ProviderId::new(provider)?,
        display_name: display_name.to_string(),
        features: features.iter().copied().collect(),
        storage_model,
        auth_type,
    })
}

/// Create a registry with the built-in providers.
pub fn create_default_capabilities() -> Result<ProviderCapabilityRegistry> {
    let mut registry = ProviderCapabilityRegistry::new();

    registry.register(record(
        "google-drive",
        "Google Drive",
        StorageModel::Hierarchical,
        AuthType::Oauth,
        &[
            Feature::FolderCreation,
            Feature::OauthAuthentication,
            Feature::ResumableUploads,
            Feature::FileSharing,
        ],
    )?)?;

    registry.register(record(
        "amazon-s3",
        "Amazon S3",
        StorageModel::Flat,
        AuthType::ApiKey,
        &[
            Feature::PresignedUrls,
            Feature::StorageClasses,
            Feature::ApiKeyAuthentication,
            Feature::MultipartUploads,
        ],
    )?)?;

    Ok(registry)
}
