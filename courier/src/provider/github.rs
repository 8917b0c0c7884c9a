use super::{
    Artifact, ByteStream, CiProvider, ProviderError, ResolvedDownload, Run,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, redirect, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const ACCEPT: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// GitHub Actions engine. One client follows redirects for plain API calls,
/// the other never does so the artifact blob location can be captured from
/// the `Location` header without leaking the bearer token to the target.
#[derive(Debug)]
pub struct Github {
    api_base: String,
    client: Client,
    no_redirect_client: Client,
}

/// GitHub wraps list responses in an envelope object.
#[derive(Debug, Deserialize)]
struct RunsEnvelope {
    workflow_runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct ArtifactsEnvelope {
    artifacts: Vec<Artifact>,
}

impl Github {
    pub fn new(api_base: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::FailedPrecondition(e.to_string()))?;

        let no_redirect_client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| ProviderError::FailedPrecondition(e.to_string()))?;

        Ok(Github {
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
            no_redirect_client,
        })
    }

    fn auth_header(token: &str) -> String {
        format!("Bearer {token}")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, Self::auth_header(token))
            .header(header::ACCEPT, ACCEPT)
            .header(API_VERSION_HEADER, API_VERSION)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl CiProvider for Github {
    async fn list_runs(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Run>, ProviderError> {
        let mut url = format!(
            "{}/repos/{owner}/{repo}/actions/runs?per_page={limit}",
            self.api_base
        );
        if let Some(branch) = branch {
            url.push_str(&format!("&branch={branch}"));
        }

        let envelope: RunsEnvelope = self.get_json(&url, token).await?;
        Ok(envelope.workflow_runs)
    }

    async fn get_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Run, ProviderError> {
        let url = format!(
            "{}/repos/{owner}/{repo}/actions/runs/{run_id}",
            self.api_base
        );

        self.get_json(&url, token).await
    }

    async fn list_artifacts(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<Artifact>, ProviderError> {
        let url = format!(
            "{}/repos/{owner}/{repo}/actions/runs/{run_id}/artifacts",
            self.api_base
        );

        let envelope: ArtifactsEnvelope = self.get_json(&url, token).await?;
        Ok(envelope.artifacts)
    }

    async fn resolve_download_url(
        &self,
        url: &str,
        token: &str,
    ) -> Result<ResolvedDownload, ProviderError> {
        let response = self
            .no_redirect_client
            .get(url)
            .header(header::AUTHORIZATION, Self::auth_header(token))
            .header(header::ACCEPT, ACCEPT)
            .header(API_VERSION_HEADER, API_VERSION)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ProviderError::UnexpectedResponse {
                    status: status.as_u16(),
                    body: "redirect without a Location header".into(),
                })?;

            debug!(url, "Resolved artifact download redirect");

            // The redirect target is blob storage owned by a third party;
            // sending the bearer token there corrupts the download.
            return Ok(ResolvedDownload {
                url: location.to_string(),
                forward_auth: false,
            });
        }

        if status.is_success() {
            // No redirect happened. Unusual for this endpoint but the data is
            // served directly; keep auth since we're still talking to the API.
            warn!(url, status = status.as_u16(), "Artifact endpoint answered without a redirect");
            return Ok(ResolvedDownload {
                url: url.to_string(),
                forward_auth: true,
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::UnexpectedResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn download(
        &self,
        resolved: &ResolvedDownload,
        token: &str,
    ) -> Result<ByteStream, ProviderError> {
        let mut request = self.client.get(&resolved.url);
        if resolved.forward_auth {
            request = request.header(header::AUTHORIZATION, Self::auth_header(token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            });
        }

        if status == StatusCode::OK {
            debug!(url = resolved.url, length = response.content_length(), "Opened artifact download stream");
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProviderError::Network(e.to_string())));

        Ok(ByteStream {
            content_length,
            stream: Box::pin(stream),
        })
    }
}
