//! Message protocol between the coordinator and its workers.
//!
//! Thread workers move these values through channels. Process workers exchange them
//! as newline-delimited JSON over stdin/stdout.

use std::backtrace::BacktraceStatus;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request from the coordinator to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Invoke `method_name` on the component registered as `component_id`.
    #[serde(rename = "dispatch")]
    Dispatch {
        component_id: String,
        method_name: String,
        /// Positional arguments
        args: Vec<Value>,
    },

    /// Stop the worker. No payload and no acknowledgement.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from a worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Worker has built its registry and accepts work.
    #[serde(rename = "ready")]
    Ready,

    /// The method returned normally.
    #[serde(rename = "result")]
    Result { result: Value },

    /// The method failed.
    #[serde(rename = "error")]
    Error { error: SerializedError },
}

/// An error flattened for crossing a worker boundary.
///
/// Only the message, an optional stack and a bag of extra properties survive; the
/// concrete error type is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl SerializedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    /// Flatten an `anyhow::Error`, keeping its source chain under `causes` and its
    /// backtrace as `stack` when one was captured.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let mut serialized = Self::new(err.to_string());

        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            serialized.stack = Some(backtrace.to_string());
        }

        let causes: Vec<Value> = err
            .chain()
            .skip(1)
            .map(|cause| Value::String(cause.to_string()))
            .collect();
        if !causes.is_empty() {
            serialized
                .properties
                .insert("causes".to_string(), Value::Array(causes));
        }
        serialized
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl WorkRequest {
    pub fn dispatch(
        component_id: impl Into<String>,
        method_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self::Dispatch {
            component_id: component_id.into(),
            method_name: method_name.into(),
            args,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    pub fn result(result: Value) -> Self {
        Self::Result { result }
    }

    pub fn error(error: SerializedError) -> Self {
        Self::Error { error }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
