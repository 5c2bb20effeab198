use std::time::{SystemTime, UNIX_EPOCH};

use ps_core::{Error, Result};
use serde::Serialize;

/// Provenance stamped on every artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactMeta {
    /// Producing tool (`pscore`).
    pub tool: String,
    /// Crate version.
    pub tool_version: String,
    /// Wall-clock creation time.
    pub created_unix_ms: u128,
}

impl ArtifactMeta {
    /// Metadata stamped with the current time.
    pub fn now() -> Result<Self> {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Computation(format!("system time error: {}", e)))?;
        Ok(Self {
            tool: "pscore".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            created_unix_ms: d.as_millis(),
        })
    }
}
