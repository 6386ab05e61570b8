use std::convert::Infallible;
use std::net::SocketAddr;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;

use pulse_core::ProjectId;

/// Project a request is authenticated for.
///
/// Inserted by the auth middleware; present on every ingestion route.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    project_id: ProjectId,
}

impl ProjectContext {
    pub fn new(project_id: ProjectId) -> Self {
        Self { project_id }
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }
}

/// Client address and user agent as captured at ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(Self {
            ip_address: client_ip(&parts.headers, peer),
            user_agent: header(&parts.headers, USER_AGENT.as_str()).map(str::to_string),
        })
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(first) = header(headers, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(first.to_string());
    }

    if let Some(real) = header(headers, "x-real-ip") {
        return Some(real.to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.7:5555".parse().unwrap())
    }

    #[test]
    fn forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.3"));
        assert_eq!(client_ip(&headers, peer()).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.3"));
        assert_eq!(client_ip(&headers, peer()).as_deref(), Some("198.51.100.3"));

        assert_eq!(client_ip(&HeaderMap::new(), peer()).as_deref(), Some("192.0.2.7"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
