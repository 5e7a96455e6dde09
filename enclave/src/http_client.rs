//! HTTPS client for the secret-store surface.
//!
//! Wraps reqwest with the vault's authentication convention: requests go
//! out with a cached bearer token when one is held; a 401 carrying a
//! `WWW-Authenticate: Bearer` challenge triggers an OAuth2
//! client-credentials token fetch against the challenge's authority,
//! after which the original request is retried exactly once.
//!
//! Inside the enclave the TLS trust anchors are a compiled-in PEM bundle;
//! the platform store is never consulted.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use sealed_ml_common::{ChannelError, Result};

/// Timeout for vault and attestation service requests.
const API_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// A parsed `WWW-Authenticate` Bearer challenge.
pub struct HttpChallenge {
    parameters: HashMap<String, String>,
}

impl HttpChallenge {
    pub fn is_bearer_challenge(challenge: &str) -> bool {
        challenge.contains("Bearer ")
    }

    pub fn parse(challenge: &str) -> Result<Self> {
        let trimmed = challenge.trim();
        let Some((_scheme, params)) = trimmed.split_once(' ') else {
            return Err(ChannelError::Transport(
                "invalid authentication challenge".to_string(),
            ));
        };

        let mut parameters = HashMap::new();
        for pair in params.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                let key = key.trim().trim_matches('"');
                let value = value.trim().trim_matches('"');
                if !key.is_empty() {
                    parameters.insert(key.to_string(), value.to_string());
                }
            }
        }

        if parameters.is_empty() {
            return Err(ChannelError::Transport(
                "invalid challenge parameters".to_string(),
            ));
        }
        Ok(Self { parameters })
    }

    /// The token authority, from `authorization` or `authorization_uri`.
    pub fn authority(&self) -> Result<&str> {
        self.parameters
            .get("authorization")
            .or_else(|| self.parameters.get("authorization_uri"))
            .map(String::as_str)
            .ok_or_else(|| ChannelError::Transport("challenge authority not found".to_string()))
    }

    pub fn resource(&self) -> Result<&str> {
        self.parameters
            .get("resource")
            .map(String::as_str)
            .ok_or_else(|| ChannelError::Transport("challenge resource not found".to_string()))
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: String,
    resource: Option<String>,
}

/// HTTPS client with lazy OAuth2 bearer acquisition.
pub struct HttpClient {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(app_id: &str, app_secret: &str, ca_bundle_pem: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(pem) = ca_bundle_pem {
            builder = builder.tls_built_in_root_certs(false);
            let certs = reqwest::Certificate::from_pem_bundle(pem.as_bytes())
                .map_err(|e| ChannelError::Transport(format!("CA bundle parse failed: {}", e)))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        let http = builder
            .build()
            .map_err(|e| ChannelError::Transport(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            token: None,
        })
    }

    /// Perform a request, acquiring a bearer token on a 401 Bearer
    /// challenge and retrying once. Responses with status >= 400 surface
    /// as `HttpStatus`; connection-level failures as `Transport`.
    pub async fn request(
        &mut self,
        url: &str,
        body: Option<&str>,
        headers: &[(&str, &str)],
        method: HttpMethod,
    ) -> Result<String> {
        let resp = self.send(url, body, headers, method).await?;

        if resp.status().as_u16() == 401 {
            let challenge = resp
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if let Some(challenge) = challenge {
                if HttpChallenge::is_bearer_challenge(&challenge) {
                    let parsed = HttpChallenge::parse(&challenge)?;
                    let token = self
                        .fetch_oauth_token(parsed.authority()?, parsed.resource()?)
                        .await?;
                    self.token = Some(token);
                    let retry = self.send(url, body, headers, method).await?;
                    return Self::read_body(retry).await;
                }
            }
        }

        Self::read_body(resp).await
    }

    async fn send(
        &self,
        url: &str,
        body: Option<&str>,
        headers: &[(&str, &str)],
        method: HttpMethod,
    ) -> Result<reqwest::Response> {
        let mut req = match method {
            HttpMethod::Get => self.http.get(url),
            HttpMethod::Post => self.http.post(url),
            HttpMethod::Put => self.http.put(url),
            HttpMethod::Delete => self.http.delete(url),
        };
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            req = req.body(body.to_string());
        }

        req.send()
            .await
            .map_err(|e| ChannelError::Transport(format!("request to {} failed: {}", url, e)))
    }

    async fn read_body(resp: reqwest::Response) -> Result<String> {
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ChannelError::Transport(format!("response read failed: {}", e)))?;
        if status >= 400 {
            return Err(ChannelError::HttpStatus { status, body });
        }
        Ok(body)
    }

    /// OAuth2 client-credentials grant against `{authority}/oauth2/token`.
    async fn fetch_oauth_token(&self, authority: &str, resource: &str) -> Result<String> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.app_id.as_str()),
            ("client_secret", self.app_secret.as_str()),
            ("resource", resource),
        ];

        let resp = self
            .http
            .post(format!("{}/oauth2/token", authority))
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("token request failed: {}", e)))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ChannelError::Transport(format!("token response read failed: {}", e)))?;
        if status >= 400 {
            return Err(ChannelError::HttpStatus { status, body });
        }

        let token: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ChannelError::Transport(format!("token response parse failed: {}", e)))?;

        if token.token_type != "Bearer" || token.resource.as_deref() != Some(resource) {
            return Err(ChannelError::Transport(
                "unexpected token type from identity provider".to_string(),
            ));
        }

        Ok(token.access_token)
    }
}
