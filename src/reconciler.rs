use crate::config::Config;
use crate::image_reference::EcrImageReference;
use crate::registry::{EcrApi, RegistryGateway};
use crate::state::PodObservation;
use crate::tag::TagTarget;
use anyhow::Context;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub not_managed: usize,
    pub already_tagged: usize,
    pub tagged: usize,
    pub rejected: usize,
}

/// Turns one Pod observation into registry tag writes.
pub struct Reconciler<A> {
    gateway: RegistryGateway<A>,
    tag_target: TagTarget,
    skip_current_tag: bool,
}

impl<A: EcrApi> Reconciler<A> {
    pub fn new(gateway: RegistryGateway<A>, config: &Config) -> Self {
        Self {
            gateway,
            tag_target: config.tag_target.clone(),
            skip_current_tag: config.skip_current_tag,
        }
    }

    /// Reconciles observations one at a time until the channel closes or `cancel` fires.
    /// A running reconciliation is always allowed to finish.
    pub async fn run(
        &self,
        mut receiver: mpsc::Receiver<PodObservation>,
        cancel: CancellationToken,
    ) {
        info!("Tagging ECR images with {}", self.tag_target);
        loop {
            let observation = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                observation = receiver.recv() => match observation {
                    Some(observation) => observation,
                    None => break,
                },
            };

            match self.reconcile(&observation).await {
                Ok(summary) => debug!(
                    "Reconciled pod {}: {} tagged, {} already tagged, {} failed, {} not from ECR",
                    observation,
                    summary.tagged,
                    summary.already_tagged,
                    summary.rejected,
                    summary.not_managed
                ),
                Err(e) => error!("Error tagging images of pod {}: {:?}", observation, e),
            }
        }
        info!("Reconciler stopped");
    }

    pub async fn reconcile(&self, pod: &PodObservation) -> anyhow::Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        debug!("Getting images from pod {}", pod);

        let mut candidates = Vec::new();
        for image in pod.images() {
            let Some(reference) = EcrImageReference::parse(image) else {
                debug!("Image '{}' of pod {} is not an ECR image", image, pod);
                summary.not_managed += 1;
                continue;
            };
            if self.skip_current_tag && self.tag_target.is_satisfied_by(&reference.tag) {
                info!(
                    "Image '{}' current tag already matches {}",
                    image, self.tag_target
                );
                summary.already_tagged += 1;
                continue;
            }
            candidates.push(reference);
        }
        if candidates.is_empty() {
            debug!("No ECR images of pod {} need tagging", pod);
            return Ok(summary);
        }

        let mut untagged = Vec::new();
        let mut known_tags: HashMap<EcrImageReference, BTreeSet<String>> = HashMap::new();
        for reference in candidates {
            let tags = match self.gateway.fetch_tags(&reference).await {
                Ok(tags) => tags,
                Err(e) => {
                    warn!("Skipping image {}: {}", reference, e);
                    summary.rejected += 1;
                    continue;
                }
            };
            if let Some(tag) = tags.iter().find(|t| self.tag_target.is_satisfied_by(t)) {
                info!(
                    "Image {} already has tag '{}' matching {}",
                    reference, tag, self.tag_target
                );
                summary.already_tagged += 1;
                continue;
            }
            untagged.push(reference.clone());
            known_tags.insert(reference, tags);
        }
        if untagged.is_empty() {
            return Ok(summary);
        }

        info!("Getting manifests of {} images from ECR", untagged.len());
        let mut records = self
            .gateway
            .fetch_manifests(&untagged)
            .await
            .context("Failed to fetch image manifests")?;
        if records.is_empty() {
            warn!("No manifest of pod {} images could be fetched", pod);
            summary.rejected += untagged.len();
            return Ok(summary);
        }
        summary.rejected += untagged.len() - records.len();
        for record in &mut records {
            if let Some(tags) = known_tags.remove(&record.reference) {
                record.existing_tags.extend(tags);
            }
        }

        let tag = self.tag_target.resolve(Utc::now());
        info!("Tagging images of pod {} with '{}'", pod, tag);
        let report = self
            .gateway
            .apply_tags(&records, &tag)
            .await
            .with_context(|| format!("Failed to tag images with '{}'", tag))?;

        summary.tagged += report.tagged;
        summary.already_tagged += report.already_tagged;
        summary.rejected += report.rejected;
        Ok(summary)
    }
}
