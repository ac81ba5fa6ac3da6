use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Key of the registry credential payload in a pull secret.
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(rename = "type")]
    pub type_: SecretType,
    /// Values are base64 encoded, as on the wire.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretType {
    Opaque,
    DockerConfigJson,
}

impl Secret {
    pub fn key(&self) -> String {
        self.metadata.key()
    }
}

/// Decoded view of a dockerconfigjson payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DockerAuth {
    /// base64("user:password"), ready for an HTTP basic Authorization header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl DockerConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Credentials for a registry host. Entries may be bare hosts or carry a
    /// scheme prefix, so both forms are checked.
    pub fn auth_for(&self, registry: &str) -> Option<&DockerAuth> {
        self.auths.get(registry).or_else(|| {
            self.auths.iter().find_map(|(host, auth)| {
                let trimmed = host
                    .trim_start_matches("https://")
                    .trim_start_matches("http://");
                let trimmed = trimmed.split('/').next().unwrap_or(trimmed);
                (trimmed == registry).then_some(auth)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_docker_config() {
        let raw = r#"{"auths":{"quay.io":{"auth":"dXNlcjpwYXNz"}}}"#;
        let config = DockerConfig::from_json(raw).unwrap();
        assert_eq!(
            config.auth_for("quay.io").unwrap().auth.as_deref(),
            Some("dXNlcjpwYXNz")
        );
    }

    #[test]
    fn test_auth_for_matches_scheme_prefixed_hosts() {
        let raw = r#"{"auths":{"https://registry.example.com/v1/":{"auth":"Zm9vOmJhcg=="}}}"#;
        let config = DockerConfig::from_json(raw).unwrap();
        assert!(config.auth_for("registry.example.com").is_some());
        assert!(config.auth_for("other.example.com").is_none());
    }
}
