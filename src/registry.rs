use crate::error::RegistryError;
use crate::image_reference::EcrImageReference;
use crate::state::RegistryImageRecord;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// A manifest as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    pub body: String,
    pub media_type: Option<String>,
}

/// Raw registry calls. Implementations classify failures into
/// [`RegistryError::Api`] and [`RegistryError::Transport`].
#[async_trait]
pub trait EcrApi: Send + Sync {
    /// All tags of the image currently tagged with `reference.tag`.
    async fn describe_image_tags(
        &self,
        reference: &EcrImageReference,
    ) -> Result<Vec<String>, RegistryError>;

    async fn batch_get_image(
        &self,
        reference: &EcrImageReference,
    ) -> Result<ImageManifest, RegistryError>;

    async fn put_image(
        &self,
        reference: &EcrImageReference,
        manifest: &ImageManifest,
        tag: &str,
    ) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    Tagged,
    AlreadyTagged,
    MissingManifest,
    Rejected { code: String },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagReport {
    pub tagged: usize,
    pub already_tagged: usize,
    pub rejected: usize,
}

/// Registry reads and writes with per-image continue-on-error semantics.
///
/// Classified API errors never escape the gateway: they are logged and the image is dropped
/// or reported as rejected. Transport errors are returned so the caller can abort the batch.
pub struct RegistryGateway<A> {
    api: A,
}

impl<A: EcrApi> RegistryGateway<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    #[cfg(test)]
    pub(crate) fn api(&self) -> &A {
        &self.api
    }

    pub async fn fetch_tags(
        &self,
        reference: &EcrImageReference,
    ) -> Result<BTreeSet<String>, RegistryError> {
        match self.api.describe_image_tags(reference).await {
            Ok(tags) => Ok(tags.into_iter().collect()),
            Err(e) if !e.is_transport() => {
                warn!("Could not fetch tags of image {}: {}", reference, e);
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_manifests(
        &self,
        references: &[EcrImageReference],
    ) -> Result<Vec<RegistryImageRecord>, RegistryError> {
        let mut records = Vec::with_capacity(references.len());
        for reference in references {
            let manifest = match self.api.batch_get_image(reference).await {
                Ok(manifest) => manifest,
                Err(e) if !e.is_transport() => {
                    warn!(
                        "Skipping image {}, could not fetch its manifest: {}",
                        reference, e
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(
                "Fetched manifest of image {} with media type {:?}",
                reference, manifest.media_type
            );
            let mut record = RegistryImageRecord::new(reference.clone());
            record.manifest = Some(manifest.body);
            record.manifest_media_type = manifest.media_type;
            records.push(record);
        }
        Ok(records)
    }

    pub async fn apply_tag(
        &self,
        record: &RegistryImageRecord,
        tag: &str,
    ) -> Result<TagOutcome, RegistryError> {
        if record.has_tag(tag) {
            info!("Image {} already has tag '{}'", record.reference, tag);
            return Ok(TagOutcome::AlreadyTagged);
        }
        let Some(body) = record.manifest.clone() else {
            warn!(
                "Skipping image {}, its manifest was never fetched",
                record.reference
            );
            return Ok(TagOutcome::MissingManifest);
        };
        let manifest = ImageManifest {
            body,
            media_type: record.manifest_media_type.clone(),
        };

        match self.api.put_image(&record.reference, &manifest, tag).await {
            Ok(()) => {
                info!("Tagged image {} with '{}'", record.reference, tag);
                Ok(TagOutcome::Tagged)
            }
            Err(RegistryError::Api { code, message, .. }) => {
                warn!(
                    "Could not tag image {} with '{}': {}: {}",
                    record.reference, tag, code, message
                );
                Ok(TagOutcome::Rejected { code })
            }
            Err(e) => Err(e),
        }
    }

    /// Tags every record, stopping only on a transport error.
    pub async fn apply_tags(
        &self,
        records: &[RegistryImageRecord],
        tag: &str,
    ) -> Result<TagReport, RegistryError> {
        let mut report = TagReport::default();
        for record in records {
            match self.apply_tag(record, tag).await? {
                TagOutcome::Tagged => report.tagged += 1,
                TagOutcome::AlreadyTagged => report.already_tagged += 1,
                TagOutcome::MissingManifest | TagOutcome::Rejected { .. } => report.rejected += 1,
            }
        }
        Ok(report)
    }
}
