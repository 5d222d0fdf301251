//! Thin client for the evcc REST API.
//!
//! All writes the dispatcher performs downstream go through here: price
//! limits, loadpoint mode, buffer/priority SoC, discharge control. Timeouts
//! are bounded and errors surface as typed results; callers degrade the cycle
//! instead of aborting it.

pub mod types;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EvccConfig;
use crate::domain::{ChargeMode, TariffSlot};
pub use types::{EvccState, Loadpoint};

#[derive(Debug, Error)]
pub enum EvccError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(StatusCode),
}

pub type EvccResult<T> = Result<T, EvccError>;

pub struct EvccClient {
    base_url: String,
    password: Option<String>,
    client: reqwest::Client,
    logged_in: AtomicBool,
}

impl EvccClient {
    pub fn new(cfg: &EvccConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .cookie_store(true)
            .build()?;
        Ok(Self {
            base_url: cfg.url.trim_end_matches('/').to_string(),
            password: cfg.password.clone(),
            client,
            logged_in: AtomicBool::new(false),
        })
    }

    /// Session login via the optional shared password; the cookie is kept by
    /// the client. Silent no-op without a password.
    async fn login(&self) {
        if self.logged_in.load(Ordering::SeqCst) {
            return;
        }
        let Some(password) = &self.password else { return };
        let url = format!("{}/api/auth/login", self.base_url);
        match self.client.post(&url).json(&json!({ "password": password })).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.logged_in.store(true, Ordering::SeqCst);
            }
            Ok(resp) => warn!(status = %resp.status(), "evcc login rejected"),
            Err(e) => warn!(error = %e, "evcc login failed"),
        }
    }

    /// Full system state, or `None` when evcc is unreachable or returns junk.
    pub async fn state(&self) -> Option<EvccState> {
        self.login().await;
        let url = format!("{}/api/state", self.base_url);
        let value: Value = match self.client.get(&url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "evcc state parse failed");
                    return None;
                }
            },
            Err(e) => {
                warn!(error = %e, "evcc state fetch failed");
                return None;
            }
        };
        let payload = value.get("result").cloned().unwrap_or(value);
        match serde_json::from_value(payload) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "evcc state schema mismatch");
                None
            }
        }
    }

    pub async fn tariff_grid(&self) -> Vec<TariffSlot> {
        self.tariff("grid").await
    }

    pub async fn tariff_solar(&self) -> Vec<TariffSlot> {
        self.tariff("solar").await
    }

    /// Fetch a tariff list. evcc has returned several shapes over time
    /// (`{result: {rates: []}}`, `{result: []}`, `{rates: []}`, bare list);
    /// all are normalised to a flat slot list.
    async fn tariff(&self, kind: &str) -> Vec<TariffSlot> {
        self.login().await;
        let url = format!("{}/api/tariff/{kind}", self.base_url);
        let value: Value = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, kind, "tariff parse failed");
                    return Vec::new();
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), kind, "tariff API error");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, kind, "tariff fetch failed");
                return Vec::new();
            }
        };

        let rates = extract_rates(&value);
        let slots: Vec<TariffSlot> = rates.iter().filter_map(|r| parse_rate(r)).collect();
        debug!(kind, count = slots.len(), "tariff rates fetched");
        slots
    }

    pub async fn set_battery_grid_charge_limit(&self, eur_per_kwh: f64) -> EvccResult<()> {
        let path = format!("batterygridchargelimit/{eur_per_kwh:.4}");
        self.post(&path).await?;
        info!(limit_ct = format!("{:.1}", eur_per_kwh * 100.0), "battery grid charge limit set");
        Ok(())
    }

    pub async fn clear_battery_grid_charge_limit(&self) -> EvccResult<()> {
        self.login().await;
        let url = format!("{}/api/batterygridchargelimit", self.base_url);
        let resp = self.client.delete(&url).send().await?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NO_CONTENT => Ok(()),
            s => Err(EvccError::Status(s)),
        }
    }

    pub async fn set_smart_cost_limit(&self, eur_per_kwh: f64) -> EvccResult<()> {
        let path = format!("smartcostlimit/{eur_per_kwh:.4}");
        self.post(&path).await?;
        info!(limit_ct = format!("{:.1}", eur_per_kwh * 100.0), "EV smart cost limit set");
        Ok(())
    }

    pub async fn set_loadpoint_mode(&self, loadpoint: usize, mode: ChargeMode) -> EvccResult<()> {
        self.post(&format!("loadpoints/{loadpoint}/mode/{mode}")).await?;
        info!(loadpoint, %mode, "loadpoint mode set");
        Ok(())
    }

    pub async fn set_buffer_soc(&self, soc: i64) -> EvccResult<()> {
        self.post(&format!("buffersoc/{soc}")).await?;
        info!(soc, "bufferSoc set");
        Ok(())
    }

    pub async fn set_buffer_start_soc(&self, soc: i64) -> EvccResult<()> {
        self.post(&format!("bufferstartsoc/{soc}")).await?;
        info!(soc, "bufferStartSoc set");
        Ok(())
    }

    pub async fn set_priority_soc(&self, soc: i64) -> EvccResult<()> {
        self.post(&format!("prioritysoc/{soc}")).await?;
        info!(soc, "prioritySoc set");
        Ok(())
    }

    pub async fn set_battery_discharge_control(&self, enabled: bool) -> EvccResult<()> {
        self.post(&format!("batterydischargecontrol/{enabled}")).await?;
        info!(enabled, "battery discharge control set");
        Ok(())
    }

    async fn post(&self, path: &str) -> EvccResult<()> {
        self.login().await;
        let url = format!("{}/api/{path}", self.base_url);
        let resp = self.client.post(&url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EvccError::Status(resp.status()))
        }
    }
}

fn extract_rates(value: &Value) -> Vec<Value> {
    let inner = value.get("result").unwrap_or(value);
    if let Some(rates) = inner.get("rates").and_then(Value::as_array) {
        return rates.clone();
    }
    if let Some(list) = inner.as_array() {
        return list.clone();
    }
    if let Some(rates) = value.get("rates").and_then(Value::as_array) {
        return rates.clone();
    }
    Vec::new()
}

fn parse_rate(rate: &Value) -> Option<TariffSlot> {
    let start = rate.get("start").or_else(|| rate.get("startsAt"))?.as_str()?;
    let end = rate.get("end").or_else(|| rate.get("endsAt"))?.as_str()?;
    let value = rate
        .get("value")
        .or_else(|| rate.get("price"))
        .and_then(Value::as_f64)?;
    Some(TariffSlot {
        start: parse_rfc3339(start)?,
        end: parse_rfc3339(end)?,
        value,
    })
}

/// RFC 3339 with either `Z` or `+HH:MM` offset, normalised to UTC.
fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvccConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> EvccClient {
        EvccClient::new(&EvccConfig {
            url: server.uri(),
            password: None,
            http_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn parses_both_timestamp_suffixes() {
        let z = parse_rfc3339("2024-06-01T12:00:00Z").unwrap();
        let offset = parse_rfc3339("2024-06-01T14:00:00+02:00").unwrap();
        assert_eq!(z, offset);
    }

    #[test]
    fn extracts_rates_from_all_known_shapes() {
        let rate = serde_json::json!({
            "start": "2024-06-01T12:00:00Z",
            "end": "2024-06-01T13:00:00Z",
            "value": 0.25
        });
        for wrapped in [
            serde_json::json!({ "result": { "rates": [rate] } }),
            serde_json::json!({ "result": [rate] }),
            serde_json::json!({ "rates": [rate] }),
            serde_json::json!([rate]),
        ] {
            assert_eq!(extract_rates(&wrapped).len(), 1, "shape: {wrapped}");
        }
    }

    #[test]
    fn rate_accepts_price_alias() {
        let rate = serde_json::json!({
            "startsAt": "2024-06-01T12:00:00Z",
            "endsAt": "2024-06-01T13:00:00Z",
            "price": 0.31
        });
        let slot = parse_rate(&rate).unwrap();
        assert_eq!(slot.value, 0.31);
    }

    #[tokio::test]
    async fn state_unwraps_result_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {
                    "batterySoc": 55.0,
                    "pvPower": 2400.0,
                    "loadpoints": [{ "mode": "pv", "connected": true, "vehicleName": "ioniq" }]
                }
            })))
            .mount(&server)
            .await;

        let state = client_for(&server).state().await.unwrap();
        assert_eq!(state.battery_soc, Some(55.0));
        assert_eq!(state.first_loadpoint().unwrap().vehicle_name.as_deref(), Some("ioniq"));
    }

    #[tokio::test]
    async fn unreachable_evcc_yields_none() {
        let cfg = EvccConfig {
            url: "http://127.0.0.1:1".to_string(),
            password: None,
            http_timeout_secs: 1,
        };
        let client = EvccClient::new(&cfg).unwrap();
        assert!(client.state().await.is_none());
    }

    #[tokio::test]
    async fn tariff_error_status_yields_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tariff/grid"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        assert!(client_for(&server).tariff_grid().await.is_empty());
    }

    #[tokio::test]
    async fn post_endpoints_format_paths() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/batterygridchargelimit/0.2500"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/loadpoints/0/mode/now"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.set_battery_grid_charge_limit(0.25).await.unwrap();
        client.set_loadpoint_mode(0, ChargeMode::Now).await.unwrap();
    }
}
