//! Structured event envelopes.
//!
//! An [`Event`] wraps a payload with CloudEvents 0.1 context attributes.
//! Events are immutable; [`Event::map_payload`] produces a new event that
//! keeps the metadata, which is how they travel through `map` stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// CloudEvents version stamped on events built without an explicit one
pub const CLOUD_EVENTS_VERSION: &str = "0.1";

/// Anything that carries a payload through a pipeline
pub trait Message<T> {
    fn payload(&self) -> &T;

    fn into_payload(self) -> T;
}

/// Errors raised while assembling an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Missing required event attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Event attribute '{name}' must not be empty")]
    EmptyAttribute { name: &'static str },
}

fn default_cloud_events_version() -> String {
    CLOUD_EVENTS_VERSION.to_string()
}

/// Immutable event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(rename = "eventTypeVersion", default, skip_serializing_if = "Option::is_none")]
    event_type_version: Option<String>,
    #[serde(rename = "cloudEventsVersion", default = "default_cloud_events_version")]
    cloud_events_version: String,
    source: String,
    #[serde(rename = "eventID")]
    event_id: String,
    #[serde(rename = "eventTime", default, skip_serializing_if = "Option::is_none")]
    event_time: Option<DateTime<Utc>>,
    #[serde(rename = "schemaURL", default, skip_serializing_if = "Option::is_none")]
    schema_url: Option<String>,
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extensions: BTreeMap<String, serde_json::Value>,
    data: T,
}

impl<T> Event<T> {
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_type_version(&self) -> Option<&str> {
        self.event_type_version.as_deref()
    }

    pub fn cloud_events_version(&self) -> &str {
        &self.cloud_events_version
    }

    /// URI of the producer
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.event_time
    }

    pub fn schema_url(&self) -> Option<&str> {
        self.schema_url.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn extensions(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extensions
    }

    pub fn extension(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(key)
    }

    /// Same envelope around a transformed payload
    pub fn map_payload<U, F>(self, f: F) -> Event<U>
    where
        F: FnOnce(T) -> U,
    {
        Event {
            event_type: self.event_type,
            event_type_version: self.event_type_version,
            cloud_events_version: self.cloud_events_version,
            source: self.source,
            event_id: self.event_id,
            event_time: self.event_time,
            schema_url: self.schema_url,
            content_type: self.content_type,
            extensions: self.extensions,
            data: f(self.data),
        }
    }
}

impl<T> Message<T> for Event<T> {
    fn payload(&self) -> &T {
        &self.data
    }

    fn into_payload(self) -> T {
        self.data
    }
}

/// Collects attributes and validates them when the payload is supplied
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    event_type: Option<String>,
    event_type_version: Option<String>,
    cloud_events_version: Option<String>,
    source: Option<String>,
    event_id: Option<String>,
    event_time: Option<DateTime<Utc>>,
    schema_url: Option<String>,
    content_type: Option<String>,
    extensions: BTreeMap<String, serde_json::Value>,
}

impl EventBuilder {
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_type_version(mut self, version: impl Into<String>) -> Self {
        self.event_type_version = Some(version.into());
        self
    }

    pub fn cloud_events_version(mut self, version: impl Into<String>) -> Self {
        self.cloud_events_version = Some(version.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    pub fn event_time(mut self, time: DateTime<Utc>) -> Self {
        self.event_time = Some(time);
        self
    }

    /// Stamp the event with the current time
    pub fn now(self) -> Self {
        self.event_time(Utc::now())
    }

    pub fn schema_url(mut self, url: impl Into<String>) -> Self {
        self.schema_url = Some(url.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Finish the envelope; type, source and id are required and non-empty
    pub fn data<T>(self, data: T) -> Result<Event<T>, EventError> {
        Ok(Event {
            event_type: required("eventType", self.event_type)?,
            event_type_version: self.event_type_version,
            cloud_events_version: self
                .cloud_events_version
                .unwrap_or_else(default_cloud_events_version),
            source: required("source", self.source)?,
            event_id: required("eventID", self.event_id)?,
            event_time: self.event_time,
            schema_url: self.schema_url,
            content_type: self.content_type,
            extensions: self.extensions,
            data,
        })
    }
}

fn required(name: &'static str, value: Option<String>) -> Result<String, EventError> {
    match value {
        None => Err(EventError::MissingAttribute(name)),
        Some(value) if value.trim().is_empty() => Err(EventError::EmptyAttribute { name }),
        Some(value) => Ok(value),
    }
}
