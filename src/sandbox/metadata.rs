//! Sandbox configuration stored on the container itself.
//!
//! The container carries a label whose value is base64-encoded JSON
//! describing its ports and volumes, so a fresh process can rebuild a handle
//! from `inspect` output alone.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Label holding the encoded [`SandboxMetadata`].
pub const CONFIG_LABEL: &str = "agent-sandbox.config";

/// Label marking containers owned by this crate.
pub const MANAGED_LABEL: &str = "agent-sandbox.managed";

/// Current schema version of the encoded metadata.
pub const METADATA_VERSION: u32 = 1;

/// Name of the workspace volume for `sandbox_id`.
pub fn workspace_volume_name(sandbox_id: &str) -> String {
    format!("{}-workspace", sandbox_id)
}

/// Name of the cache volume for `sandbox_id`.
pub fn cache_volume_name(sandbox_id: &str) -> String {
    format!("{}-cache", sandbox_id)
}

/// Configuration snapshot persisted on the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetadata {
    /// Schema version.
    #[serde(rename = "v")]
    pub version: u32,
    /// Container ports published for dev servers.
    pub ports: Vec<u16>,
    /// Volume mounted at the project directory.
    pub workspace_volume: String,
    /// Volume mounted at the cache directory.
    pub cache_volume: String,
    /// Unix time (ms) at which the idle timeout stops the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl SandboxMetadata {
    /// Creates metadata with name-derived volumes.
    pub fn new(sandbox_id: &str, ports: Vec<u16>) -> Self {
        Self {
            version: METADATA_VERSION,
            ports,
            workspace_volume: workspace_volume_name(sandbox_id),
            cache_volume: cache_volume_name(sandbox_id),
            expires_at_ms: None,
        }
    }

    /// Sets the absolute expiry time.
    pub fn with_expiry(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    /// Encodes to the label value.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decodes a label value.
    pub fn decode(label: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(label.trim())
            .map_err(|e| Error::Metadata(format!("label is not base64: {}", e)))?;
        let metadata: Self = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Metadata(format!("label is not valid metadata: {}", e)))?;

        if metadata.version != METADATA_VERSION {
            return Err(Error::Metadata(format!(
                "unsupported metadata version {}",
                metadata.version
            )));
        }

        Ok(metadata)
    }

    /// Decodes `label`, falling back to name-derived defaults when it is
    /// missing or unreadable.
    pub fn decode_or_default(label: Option<&str>, sandbox_id: &str, default_ports: &[u16]) -> Self {
        match label.map(Self::decode) {
            Some(Ok(metadata)) => metadata,
            Some(Err(e)) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    error = %e,
                    "ignoring unreadable sandbox metadata label"
                );
                Self::new(sandbox_id, default_ports.to_vec())
            }
            None => Self::new(sandbox_id, default_ports.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_names_derive_from_id() {
        let metadata = SandboxMetadata::new("sbx-1", vec![3000]);
        assert_eq!(metadata.workspace_volume, "sbx-1-workspace");
        assert_eq!(metadata.cache_volume, "sbx-1-cache");
        assert_eq!(metadata.version, METADATA_VERSION);
    }

    #[test]
    fn encoded_label_decodes_to_same_config() {
        let metadata = SandboxMetadata::new("sbx-1", vec![3000, 5173]).with_expiry(1_700_000_000_000);
        let label = metadata.encode().expect("encode");

        assert!(!label.contains('{'));
        assert_eq!(SandboxMetadata::decode(&label).expect("decode"), metadata);
    }

    #[test]
    fn label_json_uses_version_field() {
        let label = SandboxMetadata::new("sbx-1", vec![3000]).encode().unwrap();
        let json = String::from_utf8(STANDARD.decode(label).unwrap()).unwrap();
        assert!(json.contains("\"v\":1"));
        assert!(!json.contains("expires_at_ms"));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let json = r#"{"v":99,"ports":[1],"workspace_volume":"a","cache_volume":"b"}"#;
        let label = STANDARD.encode(json);
        assert!(matches!(
            SandboxMetadata::decode(&label),
            Err(Error::Metadata(_))
        ));
    }

    #[test]
    fn corrupt_label_falls_back_to_defaults() {
        let metadata = SandboxMetadata::decode_or_default(Some("%%%not base64"), "sbx-9", &[3000, 5173]);
        assert_eq!(metadata, SandboxMetadata::new("sbx-9", vec![3000, 5173]));
    }

    #[test]
    fn missing_label_falls_back_to_defaults() {
        let metadata = SandboxMetadata::decode_or_default(None, "sbx-9", &[8080]);
        assert_eq!(metadata.ports, vec![8080]);
        assert_eq!(metadata.workspace_volume, "sbx-9-workspace");
    }
}
