//! Ephemeral relay-server credentials.
//!
//! The fetch is best effort: every failure is logged and collapses to an
//! empty server list so joining the room never depends on it.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(config: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: config.urls.clone(),
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed credential body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("credential endpoint reported failure")]
    Rejected,
    #[error("credential endpoint returned no relay servers")]
    Empty,
    #[error("invalid credential endpoint: {0}")]
    Endpoint(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialResponse {
    success: bool,
    #[serde(default)]
    ice_servers: Vec<IceServerEntry>,
}

#[derive(Debug, Deserialize)]
struct IceServerEntry {
    urls: UrlList,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl From<UrlList> for Vec<String> {
    fn from(list: UrlList) -> Self {
        match list {
            UrlList::One(url) => vec![url],
            UrlList::Many(urls) => urls,
        }
    }
}

/// Parses a credential endpoint body. Anything other than
/// `{success: true, iceServers: [..non-empty..]}` is a failure.
pub fn parse_credentials(body: &str) -> Result<Vec<IceServerConfig>, CredentialError> {
    let response: CredentialResponse = serde_json::from_str(body)?;
    if !response.success {
        return Err(CredentialError::Rejected);
    }
    let servers: Vec<IceServerConfig> = response
        .ice_servers
        .into_iter()
        .map(|entry| IceServerConfig {
            urls: entry.urls.into(),
            username: entry.username,
            credential: entry.credential,
        })
        .filter(|server| !server.urls.is_empty())
        .collect();
    if servers.is_empty() {
        return Err(CredentialError::Empty);
    }
    Ok(servers)
}

#[derive(Clone)]
pub struct CredentialClient {
    http: Option<Client>,
    endpoint: Result<Url, String>,
}

impl CredentialClient {
    /// Client for `{base}/turn-credentials?userId={user}`.
    pub fn new(base_url: &str, user: &str, insecure_tls: bool) -> Self {
        let http = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|err| {
                tracing::warn!(target = "buoy.credentials", error = %err, "failed to build http client");
            })
            .ok();
        Self {
            http,
            endpoint: credentials_endpoint(base_url, user),
        }
    }

    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref().ok()
    }

    /// Fetches relay servers; degrades to an empty list on any failure.
    pub async fn fetch_ice_servers(&self) -> Vec<IceServerConfig> {
        match self.try_fetch().await {
            Ok(servers) => {
                tracing::info!(
                    target = "buoy.credentials",
                    servers = servers.len(),
                    "fetched relay credentials"
                );
                servers
            }
            Err(err) => {
                tracing::warn!(
                    target = "buoy.credentials",
                    error = %err,
                    "relay credentials unavailable; continuing without relay servers"
                );
                Vec::new()
            }
        }
    }

    async fn try_fetch(&self) -> Result<Vec<IceServerConfig>, CredentialError> {
        let endpoint = self.endpoint.clone().map_err(CredentialError::Endpoint)?;
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| CredentialError::Endpoint("http client unavailable".into()))?;
        let res = http.get(endpoint).send().await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(CredentialError::UnexpectedStatus { status, body });
        }
        parse_credentials(&body)
    }
}

fn credentials_endpoint(base_url: &str, user: &str) -> Result<Url, String> {
    let base = base_url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/turn-credentials")).map_err(|err| err.to_string())?;
    url.query_pairs_mut().append_pair("userId", user);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_string_and_array_urls() {
        let body = r#"{
            "success": true,
            "iceServers": [
                {"urls": "stun:stun.example.net:3478"},
                {"urls": ["turn:turn.example.net:3478?transport=udp", "turns:turn.example.net:5349"],
                 "username": "1700000000:pibot", "credential": "secret"}
            ]
        }"#;
        let servers = parse_credentials(body).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.net:3478"]);
        assert_eq!(servers[0].username, None);
        assert_eq!(servers[1].urls.len(), 2);
        assert_eq!(servers[1].credential.as_deref(), Some("secret"));

        let rtc = RTCIceServer::from(&servers[1]);
        assert_eq!(rtc.username, "1700000000:pibot");
        assert_eq!(rtc.urls.len(), 2);
    }

    #[test]
    fn rejects_unsuccessful_or_empty_bodies() {
        assert!(matches!(
            parse_credentials(r#"{"success": false, "iceServers": [{"urls": "stun:x"}]}"#),
            Err(CredentialError::Rejected)
        ));
        assert!(matches!(
            parse_credentials(r#"{"success": true, "iceServers": []}"#),
            Err(CredentialError::Empty)
        ));
        assert!(matches!(
            parse_credentials(r#"{"iceServers": []}"#),
            Err(CredentialError::Body(_))
        ));
        assert!(matches!(
            parse_credentials("<html>bad gateway</html>"),
            Err(CredentialError::Body(_))
        ));
    }

    #[test]
    fn builds_endpoint_with_user_query() {
        let client = CredentialClient::new("https://reg.example.net/", "pibot", false);
        assert_eq!(
            client.endpoint().map(Url::as_str),
            Some("https://reg.example.net/turn-credentials?userId=pibot")
        );
    }

    #[tokio::test]
    async fn invalid_endpoint_degrades_to_empty() {
        let client = CredentialClient::new("not a url", "pibot", false);
        assert!(client.endpoint().is_none());
        assert!(client.fetch_ice_servers().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_to_empty() {
        // Port 9 on loopback refuses connections.
        let client = CredentialClient::new("http://127.0.0.1:9", "pibot", false);
        assert!(client.fetch_ice_servers().await.is_empty());
    }
}
