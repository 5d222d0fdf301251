//! Vehicle data providers as a closed sum type.
//!
//! Every provider exposes the same capability set: `poll()` returns fresh
//! vehicle data or a typed error, `supports_active_poll()` says whether a
//! poller should run at all. The vendor gateways themselves are external;
//! this crate only speaks their JSON SoC interface.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ProviderKind, VehicleProviderConfig};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication rejected")]
    Auth,

    #[error("rate limited")]
    RateLimited,

    #[error("provider returned no usable data")]
    NoData,

    #[error("provider does not support active polling")]
    NotSupported,
}

/// Standardised vehicle data, whichever provider produced it.
#[derive(Debug, Clone)]
pub struct VehicleData {
    pub soc: Option<f64>,
    pub charging: bool,
    pub plugged_in: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SocPayload {
    soc: Option<f64>,
    #[serde(default)]
    charging: bool,
    #[serde(default, alias = "pluggedIn", alias = "plugged_in")]
    plugged_in: bool,
}

/// JSON-over-HTTP SoC endpoint with optional basic auth; the shape the Kia
/// and Renault bridge gateways and plain HTTP providers all serve.
pub struct HttpSocClient {
    url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl HttpSocClient {
    pub fn new(url: String, username: Option<String>, password: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { url, username, password, client })
    }

    async fn fetch(&self) -> Result<VehicleData, ProviderError> {
        let mut request = self.client.get(&self.url);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let resp = request.send().await?;
        match resp.status().as_u16() {
            401 | 403 => return Err(ProviderError::Auth),
            429 => return Err(ProviderError::RateLimited),
            _ => {}
        }
        let payload: SocPayload = resp.json().await?;
        if payload.soc.is_none() {
            return Err(ProviderError::NoData);
        }
        Ok(VehicleData {
            soc: payload.soc,
            charging: payload.charging,
            plugged_in: payload.plugged_in,
            timestamp: Utc::now(),
        })
    }
}

/// All supported vehicle data sources. The poller loop is provider-agnostic.
pub enum VehicleProvider {
    Kia(HttpSocClient),
    Renault(HttpSocClient),
    Http(HttpSocClient),
    /// Driver-entered SoC only; no API to poll
    Manual,
}

impl VehicleProvider {
    pub fn from_config(cfg: &VehicleProviderConfig) -> anyhow::Result<Self> {
        let url = cfg.api_url.clone().unwrap_or_default();
        let make = |url: String| {
            HttpSocClient::new(url, cfg.username.clone(), cfg.password.clone())
        };
        Ok(match cfg.provider {
            ProviderKind::Kia => VehicleProvider::Kia(make(url)?),
            ProviderKind::Renault => VehicleProvider::Renault(make(url)?),
            ProviderKind::Http => VehicleProvider::Http(make(url)?),
            ProviderKind::Manual => VehicleProvider::Manual,
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            VehicleProvider::Kia(_) => "kia",
            VehicleProvider::Renault(_) => "renault",
            VehicleProvider::Http(_) => "http",
            VehicleProvider::Manual => "manual",
        }
    }

    pub fn supports_active_poll(&self) -> bool {
        !matches!(self, VehicleProvider::Manual)
    }

    pub async fn poll(&self) -> Result<VehicleData, ProviderError> {
        match self {
            VehicleProvider::Kia(client)
            | VehicleProvider::Renault(client)
            | VehicleProvider::Http(client) => client.fetch().await,
            VehicleProvider::Manual => Err(ProviderError::NotSupported),
        }
    }
}

/// Failure back-off ladder for vehicle pollers: 2h, 4h, 8h, 16h, then a 24h
/// cap. Reset on the first successful poll.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollBackoff {
    failures: u32,
}

impl PollBackoff {
    const LADDER_HOURS: [u64; 5] = [2, 4, 8, 16, 24];

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn is_backing_off(&self) -> bool {
        self.failures > 0
    }

    /// Delay until the next poll attempt; `None` when not backing off.
    pub fn current_delay(&self) -> Option<Duration> {
        if self.failures == 0 {
            return None;
        }
        let idx = ((self.failures - 1) as usize).min(Self::LADDER_HOURS.len() - 1);
        Some(Duration::from_secs(Self::LADDER_HOURS[idx] * 3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn manual_provider_has_no_active_poll() {
        let provider = VehicleProvider::Manual;
        assert!(!provider.supports_active_poll());
    }

    #[tokio::test]
    async fn manual_poll_is_not_supported() {
        let provider = VehicleProvider::Manual;
        assert!(matches!(provider.poll().await, Err(ProviderError::NotSupported)));
    }

    #[tokio::test]
    async fn http_provider_parses_soc_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/soc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "soc": 63.5, "charging": true, "pluggedIn": true
            })))
            .mount(&server)
            .await;

        let client = HttpSocClient::new(format!("{}/soc", server.uri()), None, None).unwrap();
        let provider = VehicleProvider::Http(client);
        let data = provider.poll().await.unwrap();
        assert_eq!(data.soc, Some(63.5));
        assert!(data.charging);
        assert!(data.plugged_in);
    }

    #[tokio::test]
    async fn auth_failure_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/soc"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let client = HttpSocClient::new(format!("{}/soc", server.uri()), None, None).unwrap();
        assert!(matches!(client.fetch().await, Err(ProviderError::Auth)));
    }

    #[tokio::test]
    async fn missing_soc_is_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/soc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        let client = HttpSocClient::new(format!("{}/soc", server.uri()), None, None).unwrap();
        assert!(matches!(client.fetch().await, Err(ProviderError::NoData)));
    }

    #[test]
    fn backoff_ladder_values() {
        let mut b = PollBackoff::default();
        assert!(b.current_delay().is_none());
        let expected_hours = [2u64, 4, 8, 16, 24, 24, 24];
        for hours in expected_hours {
            b.record_failure();
            assert_eq!(b.current_delay().unwrap(), Duration::from_secs(hours * 3600));
        }
        b.reset();
        assert!(b.current_delay().is_none());
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(failures in 1u32..100) {
            let mut b = PollBackoff::default();
            let mut last = Duration::ZERO;
            for _ in 0..failures {
                b.record_failure();
                let delay = b.current_delay().unwrap();
                prop_assert!(delay >= last);
                prop_assert!(delay <= Duration::from_secs(24 * 3600));
                last = delay;
            }
        }
    }
}
