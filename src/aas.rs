//! Client for the Asset Administration Shell submodel repository API.
//!
//! Submodel identifiers are IRIs and travel base64url-encoded in the path;
//! element values are addressed through the `$value` serialization endpoints.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone)]
pub struct AasClient {
    name: String,
    base_url: Url,
    api_key: Option<String>,
    client: Client,
}

impl AasClient {
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<String>,
        client: Client,
    ) -> Result<Self, AasClientError> {
        let base_url = Url::parse(base_url).map_err(|source| AasClientError::InvalidBaseUrl {
            url: base_url.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            base_url,
            api_key,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encode_submodel_id(submodel_id: &str) -> String {
        URL_SAFE_NO_PAD.encode(submodel_id.as_bytes())
    }

    pub async fn write_element_value(
        &self,
        submodel_id: &str,
        element_path: &str,
        value: &JsonValue,
    ) -> Result<(), AasClientError> {
        let url = self.element_value_url(submodel_id, element_path)?;
        let mut request = self.client.put(url.clone()).json(value);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await?;
        check_status(&self.name, submodel_id, element_path, response.status())?;
        Ok(())
    }

    pub async fn read_element_value(
        &self,
        submodel_id: &str,
        element_path: &str,
    ) -> Result<JsonValue, AasClientError> {
        let url = self.element_value_url(submodel_id, element_path)?;
        let mut request = self.client.get(url.clone());
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await?;
        check_status(&self.name, submodel_id, element_path, response.status())?;
        Ok(response.json().await?)
    }

    fn element_value_url(
        &self,
        submodel_id: &str,
        element_path: &str,
    ) -> Result<Url, AasClientError> {
        let encoded = Self::encode_submodel_id(submodel_id);
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AasClientError::BaseUrlNotHierarchical {
                    url: self.base_url.to_string(),
                })?;
            segments.pop_if_empty();
            segments.push("submodels");
            segments.push(&encoded);
            segments.push("submodel-elements");
            // idShort paths are dot-separated but travel as one segment
            segments.push(element_path);
            segments.push("$value");
        }
        Ok(url)
    }
}

fn check_status(
    endpoint: &str,
    submodel_id: &str,
    element_path: &str,
    status: StatusCode,
) -> Result<(), AasClientError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(AasClientError::ElementNotFound {
            endpoint: endpoint.to_string(),
            submodel_id: submodel_id.to_string(),
            element_path: element_path.to_string(),
        });
    }
    Err(AasClientError::UnexpectedStatus {
        endpoint: endpoint.to_string(),
        status,
    })
}

#[derive(Debug, Error)]
pub enum AasClientError {
    #[error("invalid AAS base URL `{url}`: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("AAS base URL `{url}` cannot carry path segments")]
    BaseUrlNotHierarchical { url: String },
    #[error("AAS endpoint `{endpoint}` has no element `{element_path}` in submodel `{submodel_id}`")]
    ElementNotFound {
        endpoint: String,
        submodel_id: String,
        element_path: String,
    },
    #[error("AAS endpoint `{endpoint}` returned unexpected status {status}")]
    UnexpectedStatus {
        endpoint: String,
        status: StatusCode,
    },
    #[error("AAS request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submodel_ids_encode_without_padding() {
        let encoded = AasClient::encode_submodel_id("https://example.com/ids/sm/4564_7747");
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('+'));
    }

    #[test]
    fn element_value_url_keeps_dotted_path_as_one_segment() {
        let client = AasClient::new(
            "plant-aas",
            "http://localhost:8081/api/v3.0",
            None,
            Client::new(),
        )
        .unwrap();
        let url = client
            .element_value_url("urn:example:sm:1", "Sensors.Temperature")
            .unwrap();
        let path = url.path();
        assert!(path.starts_with("/api/v3.0/submodels/"));
        assert!(path.ends_with("/submodel-elements/Sensors.Temperature/$value"));
    }
}
