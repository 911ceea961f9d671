#![forbid(unsafe_code)]

use std::collections::BTreeMap;

/// Canonical metadata keys stamped on messages by trigger runtimes and read
/// back by sinks and the delegator.
pub const TRACE_ID_KEY: &str = "trace_id";
pub const SOURCE_ENDPOINT_KEY: &str = "source_endpoint";
pub const ROUTE_KEY: &str = "route";

/// One unit of telemetry moving through a route: raw bytes plus the
/// transport-level headers the trigger observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeMessage {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl BridgeMessage {
    pub fn new(endpoint: impl Into<String>, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers,
            body,
            metadata: BTreeMap::new(),
        }
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|value| value.as_str())
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.metadata_value(TRACE_ID_KEY)
    }

    pub fn source_endpoint(&self) -> Option<&str> {
        self.metadata_value(SOURCE_ENDPOINT_KEY)
    }

    pub fn route(&self) -> Option<&str> {
        self.metadata_value(ROUTE_KEY)
    }

    pub fn with_trace_id(mut self, value: impl Into<String>) -> Self {
        self.metadata.insert(TRACE_ID_KEY.to_string(), value.into());
        self
    }

    pub fn with_route(mut self, value: impl Into<String>) -> Self {
        self.metadata.insert(ROUTE_KEY.to_string(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
