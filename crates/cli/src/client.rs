//! API client for communicating with the reclaimer agent

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for the reclaimer agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send_get(path).await?;
        Self::parse(response).await
    }

    /// Make a GET request, mapping 404 to `None`
    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send_get(path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse(response).await.map(Some)
    }

    /// POST to a run control endpoint. Control endpoints answer refusals
    /// (409, 404) with the same body as acceptances, so only server errors bail.
    pub async fn control(&self, path: &str) -> Result<ControlOutcome> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        let body: ControlResponse = response
            .json()
            .await
            .context("Failed to parse response")?;
        Ok(ControlOutcome {
            accepted: status.is_success(),
            body,
        })
    }

    async fn send_get(&self, path: &str) -> Result<Response> {
        let url = self.base_url.join(path).context("Invalid path")?;

        self.client
            .get(url)
            .send()
            .await
            .context("Failed to send request")
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }
}

// API response types

/// Body of the run control endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Control response together with whether the agent accepted the request
#[derive(Debug, Clone)]
pub struct ControlOutcome {
    pub accepted: bool,
    pub body: ControlResponse,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_lib::{Phase, RunProgress, RunRecord};

    #[tokio::test]
    async fn test_get_parses_progress() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/runs/current")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"run_id":"run-1","phase":"capping_outliers","started_at":null,
                    "watching":"web-01","outcomes":[],"drain_polls":0}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let progress: RunProgress = client.get("api/v1/runs/current").await.unwrap();

        mock.assert_async().await;
        assert_eq!(progress.phase, Phase::CappingOutliers);
        assert_eq!(progress.watching.as_deref(), Some("web-01"));
    }

    #[tokio::test]
    async fn test_get_optional_maps_404_to_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/runs/last")
            .with_status(404)
            .with_body(r#"{"status":"none"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let last: Option<RunRecord> = client.get_optional("api/v1/runs/last").await.unwrap();

        assert!(last.is_none());
    }

    #[tokio::test]
    async fn test_get_surfaces_server_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/runs/current")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client
            .get::<RunProgress>("api/v1/runs/current")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_control_reports_conflict_as_refusal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/runs")
            .with_status(409)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"busy","message":"a reclamation run is already in progress"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let outcome = client.control("api/v1/runs").await.unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.body.status, "busy");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
