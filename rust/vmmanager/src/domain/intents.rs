//! Queue intent payloads.
//!
//! Intents are the ephemeral JSON messages popped from the two queues. The
//! front-end produces them; the provisioner and the reconciler also produce
//! decommission intents of their own. Unknown fields are ignored.

use serde::{Deserialize, Serialize};

/// Request to provision a lab VM for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionIntent {
    /// External user identity.
    #[serde(rename = "webuserid")]
    pub web_user_id: String,
    /// Lab to provision; labs are numbered from 1.
    #[serde(rename = "labId")]
    pub lab_id: u32,
}

impl ProvisionIntent {
    /// Parses and validates a raw queue payload.
    pub fn parse(payload: &str) -> Result<Self, IntentError> {
        let intent: Self = serde_json::from_str(payload)?;
        if intent.web_user_id.is_empty() {
            return Err(IntentError::MissingField("webuserid"));
        }
        if intent.lab_id == 0 {
            return Err(IntentError::MissingField("labId"));
        }
        Ok(intent)
    }
}

/// Request to decommission a user's VM.
///
/// `lab_id`, when present, guards against stale requests: a decommission for
/// a lab the cache has moved past is dropped. `server_id`, when present,
/// enables cache-less deletion of a VM whose cache entry is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecommissionIntent {
    /// External user identity.
    #[serde(rename = "webuserid")]
    pub web_user_id: String,
    /// Lab the request refers to; validated against the cache when present.
    #[serde(rename = "labId", skip_serializing_if = "Option::is_none")]
    pub lab_id: Option<u32>,
    /// Provider handle for cache-less deletion.
    #[serde(rename = "serverId", skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl DecommissionIntent {
    /// Parses and validates a raw queue payload.
    pub fn parse(payload: &str) -> Result<Self, IntentError> {
        let intent: Self = serde_json::from_str(payload)?;
        if intent.web_user_id.is_empty() {
            return Err(IntentError::MissingField("webuserid"));
        }
        Ok(intent)
    }

    /// Intent synthesized by the reconciler for an expired record.
    pub fn expired(web_user_id: impl Into<String>, lab_id: u32) -> Self {
        Self {
            web_user_id: web_user_id.into(),
            lab_id: Some(lab_id),
            server_id: None,
        }
    }

    /// Intent the provisioner enqueues for the previous lab on a lab switch.
    ///
    /// Carries the old `server_id` so the VM stays deletable after the cache
    /// entry is overwritten.
    pub fn lab_switch(
        web_user_id: impl Into<String>,
        old_lab_id: u32,
        old_server_id: impl Into<String>,
    ) -> Self {
        Self {
            web_user_id: web_user_id.into(),
            lab_id: Some(old_lab_id),
            server_id: Some(old_server_id.into()),
        }
    }
}

/// Why an intent payload was rejected.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    /// Payload was not valid JSON for the expected shape.
    #[error("malformed intent payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A required field was missing or empty.
    #[error("missing required field {0}")]
    MissingField(&'static str),
}
