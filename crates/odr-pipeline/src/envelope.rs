//! Job payloads exchanged between pipeline stages
//!
//! Each queue message is an [`Envelope`]: a schema version, an attempt counter
//! used by the retry policy, and a stage-specific [`Payload`]. Envelopes are
//! rebuilt at every fan-out so no stage ever mutates another stage's input.
//!
//! Triggers published by the producer are bare JSON objects without the
//! envelope wrapper; [`Envelope::decode`] accepts both shapes.

use crate::de::{bool_from_any, i64_from_any, opt_string_or_number, string_or_number};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Current envelope schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Semantic name -> template/field UUID
pub type SchemaMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzer,
    Builder,
    Finisher,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Analyzer => f.write_str("analyzer"),
            Stage::Builder => f.write_str("builder"),
            Stage::Finisher => f.write_str("finisher"),
        }
    }
}

/// Producer API credentials carried by every job
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_user: String,
    pub api_key: String,
}

impl ApiCredentials {
    pub fn new(api_user: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_user: api_user.into(),
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_user", &self.api_user)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Ties builder and finisher jobs to one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(deserialize_with = "i64_from_any")]
    pub tracked_job_id: i64,

    /// Suffix of this run's temporary output files (epoch millis at start)
    #[serde(deserialize_with = "string_or_number")]
    pub file_extension: String,
}

/// One entry of a record listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    #[serde(deserialize_with = "string_or_number")]
    pub unique_id: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub internal_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub external_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub record_name: Option<String>,
}

/// Starts a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerInput {
    #[serde(flatten)]
    pub credentials: ApiCredentials,

    /// Record listing URL; may end in the `99999999` watermark sentinel
    #[serde(alias = "full_rruff_url")]
    pub full_url: String,

    /// Request an incremental rebuild when a watermark exists
    #[serde(default, alias = "ima_update_rebuild", deserialize_with = "bool_from_any")]
    pub incremental: bool,

    /// Listing of files changed since the watermark (file pipelines)
    #[serde(default)]
    pub modified_files_url: Option<String>,

    #[serde(default)]
    pub schema: SchemaMap,
}

/// Builds the artifacts for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderInput {
    #[serde(flatten)]
    pub credentials: ApiCredentials,
    #[serde(flatten)]
    pub correlation: Correlation,
    pub record: RecordRef,

    /// Position in the fan-out
    pub index: usize,

    #[serde(default)]
    pub incremental: bool,

    #[serde(default)]
    pub schema: SchemaMap,
}

/// Waits for a run to complete, then finalizes its outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinisherInput {
    #[serde(flatten)]
    pub credentials: ApiCredentials,
    #[serde(flatten)]
    pub correlation: Correlation,

    #[serde(default, deserialize_with = "bool_from_any")]
    pub incremental: bool,

    /// Number of times this job has re-queued itself
    #[serde(default)]
    pub counter: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Analyze(AnalyzerInput),
    Build(BuilderInput),
    Finish(FinisherInput),
}

impl Payload {
    pub fn stage(&self) -> Stage {
        match self {
            Payload::Analyze(_) => Stage::Analyzer,
            Payload::Build(_) => Stage::Builder,
            Payload::Finish(_) => Stage::Finisher,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    #[serde(default)]
    pub attempt: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            attempt: 0,
            payload,
        }
    }

    pub fn stage(&self) -> Stage {
        self.payload.stage()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message taken from a tube that feeds `expected`
    pub fn decode(expected: Stage, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;

        let envelope = if value.get("schema_version").is_some() && value.get("payload").is_some() {
            let envelope: Envelope = serde_json::from_value(value)?;
            if envelope.schema_version == 0 || envelope.schema_version > SCHEMA_VERSION {
                return Err(PipelineError::validation(format!(
                    "unsupported envelope schema version {}",
                    envelope.schema_version
                )));
            }
            envelope
        } else {
            let payload = match expected {
                Stage::Analyzer => Payload::Analyze(serde_json::from_value(value)?),
                Stage::Builder => Payload::Build(serde_json::from_value(value)?),
                Stage::Finisher => Payload::Finish(serde_json::from_value(value)?),
            };
            Envelope::new(payload)
        };

        if envelope.stage() != expected {
            return Err(PipelineError::validation(format!(
                "{} job delivered to the {} tube",
                envelope.stage(),
                expected
            )));
        }

        Ok(envelope)
    }
}

impl From<Payload> for Envelope {
    fn from(payload: Payload) -> Self {
        Envelope::new(payload)
    }
}
