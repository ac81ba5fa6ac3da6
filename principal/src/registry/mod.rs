//! Pull-secret handling and OCI image label lookup.
//!
//! The sizing controller needs one fact from the container registry: whether
//! the operator image build reports node count from inside the cluster. The
//! lookup walks manifest -> config blob and reads the config labels,
//! authenticating with the hosted cluster's pull secret. The answer is
//! resolved on every reconcile rather than cached, so a new image answers for
//! itself immediately.

use std::collections::HashMap;
use std::future::Future;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use thiserror::Error;

use models::secret::{DockerConfig, Secret, DOCKER_CONFIG_JSON_KEY};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("malformed image reference {0:?}")]
    MalformedReference(String),
    #[error("pull secret is missing the {DOCKER_CONFIG_JSON_KEY} key")]
    MissingDockerConfig,
    #[error("pull secret payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("pull secret payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry response for {0} had no config descriptor")]
    MissingConfig(String),
}

/// A parsed `registry/repository:tag` or `registry/repository@digest` image
/// reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, RegistryError> {
        if image.is_empty() {
            return Err(RegistryError::MalformedReference(image.to_string()));
        }

        let (host, remainder) = match image.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => ("docker.io".to_string(), image.to_string()),
        };

        let (repository, reference) = if let Some((repo, digest)) = remainder.split_once('@') {
            (repo.to_string(), digest.to_string())
        } else {
            // The tag separator must come after the last path segment.
            match remainder.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
                _ => (remainder.clone(), "latest".to_string()),
            }
        };

        if repository.is_empty() {
            return Err(RegistryError::MalformedReference(image.to_string()));
        }

        Ok(ImageReference {
            registry: host,
            repository,
            reference,
        })
    }
}

/// Decodes the dockerconfigjson payload of a pull secret.
pub fn decode_docker_config(secret: &Secret) -> Result<DockerConfig, RegistryError> {
    let encoded = secret
        .data
        .get(DOCKER_CONFIG_JSON_KEY)
        .ok_or(RegistryError::MissingDockerConfig)?;
    let raw = general_purpose::STANDARD.decode(encoded)?;
    let json = String::from_utf8_lossy(&raw);
    Ok(DockerConfig::from_json(&json)?)
}

/// Resolves the label map of a container image.
pub trait ImageMetadataProvider: Send + Sync + 'static {
    fn image_labels(
        &self,
        image: &str,
        pull_secret: Option<&Secret>,
    ) -> impl Future<Output = Result<HashMap<String, String>, RegistryError>> + Send;
}

#[derive(Deserialize)]
struct Manifest {
    config: Option<Descriptor>,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Deserialize)]
struct ImageConfigBlob {
    #[serde(default)]
    config: ContainerConfig,
}

#[derive(Deserialize, Default)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().use_rustls_tls().build()?;
        Ok(RegistryClient { http })
    }

    fn basic_auth_for(
        config: &DockerConfig,
        registry: &str,
    ) -> Option<String> {
        let auth = config.auth_for(registry)?;
        if let Some(token) = &auth.auth {
            return Some(format!("Basic {}", token));
        }
        match (&auth.username, &auth.password) {
            (Some(user), Some(pass)) => {
                let token = general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
                Some(format!("Basic {}", token))
            }
            _ => None,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        accept: &str,
        authorization: Option<&str>,
    ) -> Result<T, RegistryError> {
        let mut request = self.http.get(url).header("Accept", accept);
        if let Some(header) = authorization {
            request = request.header("Authorization", header);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

impl ImageMetadataProvider for RegistryClient {
    async fn image_labels(
        &self,
        image: &str,
        pull_secret: Option<&Secret>,
    ) -> Result<HashMap<String, String>, RegistryError> {
        let reference = ImageReference::parse(image)?;

        let authorization = match pull_secret {
            Some(secret) => {
                let config = decode_docker_config(secret)?;
                Self::basic_auth_for(&config, &reference.registry)
            }
            None => None,
        };

        let manifest_url = format!(
            "https://{}/v2/{}/manifests/{}",
            reference.registry, reference.repository, reference.reference
        );
        let manifest: Manifest = self
            .get_json(
                &manifest_url,
                "application/vnd.oci.image.manifest.v1+json, \
                 application/vnd.docker.distribution.manifest.v2+json",
                authorization.as_deref(),
            )
            .await?;

        let config_digest = manifest
            .config
            .ok_or_else(|| RegistryError::MissingConfig(image.to_string()))?
            .digest;

        let blob_url = format!(
            "https://{}/v2/{}/blobs/{}",
            reference.registry, reference.repository, config_digest
        );
        let blob: ImageConfigBlob = self
            .get_json(
                &blob_url,
                "application/octet-stream",
                authorization.as_deref(),
            )
            .await?;

        Ok(blob.config.labels.unwrap_or_default())
    }
}
