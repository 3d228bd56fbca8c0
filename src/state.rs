use crate::image_reference::EcrImageReference;
use k8s_openapi::api::core::v1::{Container, Pod};
use std::collections::BTreeSet;
use std::fmt;

/// Snapshot of the images a Pod runs, taken from one watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub namespace: String,
    pub name: String,
    pub container_images: Vec<String>,
    pub init_container_images: Vec<String>,
}

impl PodObservation {
    /// Init container images first, then container images, with repeats removed.
    pub fn images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = Vec::new();
        for image in self
            .init_container_images
            .iter()
            .chain(self.container_images.iter())
        {
            if !images.contains(&image.as_str()) {
                images.push(image);
            }
        }
        images
    }
}

impl From<&Pod> for PodObservation {
    fn from(pod: &Pod) -> Self {
        let images = |containers: &[Container]| -> Vec<String> {
            containers.iter().filter_map(|c| c.image.clone()).collect()
        };
        let spec = pod.spec.as_ref();

        PodObservation {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            container_images: spec
                .map(|s| images(s.containers.as_slice()))
                .unwrap_or_default(),
            init_container_images: spec
                .and_then(|s| s.init_containers.as_deref())
                .map(images)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Registry-side view of one image, re-fetched on every reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryImageRecord {
    pub reference: EcrImageReference,
    pub manifest: Option<String>,
    pub manifest_media_type: Option<String>,
    pub existing_tags: BTreeSet<String>,
}

impl RegistryImageRecord {
    pub fn new(reference: EcrImageReference) -> Self {
        let existing_tags = BTreeSet::from([reference.tag.clone()]);
        Self {
            reference,
            manifest: None,
            manifest_media_type: None,
            existing_tags,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.reference.tag == tag || self.existing_tags.contains(tag)
    }
}
