use crate::error::RegistryError;
use crate::image_reference::EcrImageReference;
use crate::registry::{EcrApi, ImageManifest};
use anyhow::Result;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_ecr::Client;
use aws_sdk_ecr::config::Region;
use aws_sdk_ecr::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ecr::operation::batch_get_image::BatchGetImageOutput;
use aws_sdk_ecr::types::ImageIdentifier;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::Mutex;
use tracing::{debug, info};

// Requested from BatchGetImage so the manifest is returned in its stored format.
const ACCEPTED_MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// [`EcrApi`] backed by the AWS SDK, with one client per region.
pub struct AwsEcr {
    sdk_config: SdkConfig,
    clients: Mutex<HashMap<String, Client>>,
}

impl AwsEcr {
    /// Loads credentials from the default provider chain (environment, profile, web identity,
    /// container and instance metadata).
    pub async fn from_env() -> Result<Self> {
        info!("Initializing ECR client");
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        if sdk_config.credentials_provider().is_none() {
            anyhow::bail!("No AWS credentials provider could be resolved");
        }
        Ok(Self {
            sdk_config,
            clients: Mutex::new(HashMap::new()),
        })
    }

    async fn client(&self, region: &str) -> Client {
        let mut clients = self.clients.lock().await;
        clients
            .entry(region.to_string())
            .or_insert_with(|| {
                debug!("Creating ECR client for region {}", region);
                let config = aws_sdk_ecr::config::Builder::from(&self.sdk_config)
                    .region(Region::new(region.to_string()))
                    .build();
                Client::from_conf(config)
            })
            .clone()
    }
}

fn image_id(reference: &EcrImageReference) -> ImageIdentifier {
    ImageIdentifier::builder().image_tag(&reference.tag).build()
}

/// Service errors are answers from ECR about this image; everything else means the
/// request never got one.
fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> RegistryError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(service) => RegistryError::Api {
            operation,
            code: service.err().code().unwrap_or("Unknown").to_string(),
            message: service.err().message().unwrap_or_default().to_string(),
        },
        _ => RegistryError::Transport {
            operation,
            source: Box::new(err),
        },
    }
}

/// Per-image failures come back inside a successful response and are treated like
/// service errors.
fn manifest_from_output(
    reference: &EcrImageReference,
    output: &BatchGetImageOutput,
) -> Result<ImageManifest, RegistryError> {
    if let Some(failure) = output.failures().first() {
        return Err(RegistryError::Api {
            operation: "BatchGetImage",
            code: failure
                .failure_code()
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
            message: failure.failure_reason().unwrap_or_default().to_string(),
        });
    }

    let image = output.images().first();
    match image.and_then(|i| i.image_manifest()) {
        Some(body) => Ok(ImageManifest {
            body: body.to_string(),
            media_type: image
                .and_then(|i| i.image_manifest_media_type())
                .map(str::to_string),
        }),
        None => Err(RegistryError::Api {
            operation: "BatchGetImage",
            code: "ImageNotFound".to_string(),
            message: format!("No manifest returned for {}", reference),
        }),
    }
}

#[async_trait]
impl EcrApi for AwsEcr {
    async fn describe_image_tags(
        &self,
        reference: &EcrImageReference,
    ) -> Result<Vec<String>, RegistryError> {
        debug!("Describing image {}", reference);
        let output = self
            .client(&reference.region)
            .await
            .describe_images()
            .registry_id(&reference.account_id)
            .repository_name(&reference.repository)
            .image_ids(image_id(reference))
            .send()
            .await
            .map_err(|e| classify("DescribeImages", e))?;

        Ok(output
            .image_details()
            .iter()
            .flat_map(|detail| detail.image_tags().iter().cloned())
            .collect())
    }

    async fn batch_get_image(
        &self,
        reference: &EcrImageReference,
    ) -> Result<ImageManifest, RegistryError> {
        debug!("Fetching manifest of image {}", reference);
        let mut request = self
            .client(&reference.region)
            .await
            .batch_get_image()
            .registry_id(&reference.account_id)
            .repository_name(&reference.repository)
            .image_ids(image_id(reference));
        for media_type in ACCEPTED_MANIFEST_MEDIA_TYPES {
            request = request.accepted_media_types(media_type);
        }
        let output = request
            .send()
            .await
            .map_err(|e| classify("BatchGetImage", e))?;

        manifest_from_output(reference, &output)
    }

    async fn put_image(
        &self,
        reference: &EcrImageReference,
        manifest: &ImageManifest,
        tag: &str,
    ) -> Result<(), RegistryError> {
        debug!("Putting image {} with tag {}", reference, tag);
        self.client(&reference.region)
            .await
            .put_image()
            .registry_id(&reference.account_id)
            .repository_name(&reference.repository)
            .image_manifest(&manifest.body)
            .set_image_manifest_media_type(manifest.media_type.clone())
            .image_tag(tag)
            .send()
            .await
            .map_err(|e| classify("PutImage", e))?;
        Ok(())
    }
}
