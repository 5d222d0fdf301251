use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub evcc: EvccConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub ev: EvConfig,

    #[validate(nested)]
    pub arbitrage: ArbitrageConfig,

    #[validate(nested)]
    pub dispatch: DispatchConfig,

    #[validate(nested)]
    pub learner: LearnerConfig,

    #[validate(nested)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub vehicles: Vec<VehicleProviderConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Downstream evcc endpoint
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EvccConfig {
    pub url: String,

    /// Optional shared password for POST /auth/login
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    #[validate(range(min = 1, max = 15))]
    pub http_timeout_secs: u64,
}

/// House battery parameters
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BatteryConfig {
    pub capacity_kwh: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    pub charge_power_kw: f64,

    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc: f64,

    /// Price ceiling for grid-charging the battery (ct/kWh)
    #[serde(default = "default_battery_max_price_ct")]
    pub max_price_ct: f64,

    /// Feed-in revenue used as the discharge objective coefficient (ct/kWh)
    #[serde(default = "default_feed_in_tariff_ct")]
    pub feed_in_tariff_ct: f64,
}

/// EV charging parameters shared across vehicles
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EvConfig {
    #[serde(default = "default_ev_max_price_ct")]
    pub max_price_ct: f64,

    #[serde(default = "default_ev_target_soc")]
    pub target_soc: f64,

    /// Fallbacks when the wallbox reports no vehicle metadata
    #[serde(default = "default_ev_capacity_kwh")]
    #[validate(range(min = 1.0, max = 300.0))]
    pub default_capacity_kwh: f64,

    #[serde(default = "default_ev_charge_power_kw")]
    #[validate(range(min = 1.0, max = 50.0))]
    pub default_charge_power_kw: f64,

    /// Fallback departure hour when the driver never answered the inquiry
    #[serde(default = "default_departure_hour")]
    #[validate(range(min = 0, max = 23))]
    pub default_departure_hour: u32,
}

/// Battery-to-EV arbitrage parameters
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ArbitrageConfig {
    /// Battery SoC floor below which discharge-to-EV never activates
    #[serde(default = "default_bat_to_ev_floor")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub battery_to_ev_floor_soc: f64,

    /// Minimum savings over battery round-trip cost (ct/kWh)
    #[serde(default = "default_min_profit_ct")]
    pub min_profit_ct: f64,
}

/// Decision loop timing and quiet hours
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DispatchConfig {
    #[serde(default = "default_interval_minutes")]
    pub decision_interval_minutes: u64,

    #[serde(default)]
    pub quiet_hours_enabled: bool,

    #[serde(default = "default_quiet_start")]
    #[validate(range(min = 0, max = 23))]
    pub quiet_hours_start: u32,

    #[serde(default = "default_quiet_end")]
    #[validate(range(min = 0, max = 23))]
    pub quiet_hours_end: u32,
}

/// Residual learner settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LearnerConfig {
    #[serde(default = "default_learner_mode")]
    pub mode: LearnerMode,

    #[serde(default = "default_epsilon")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub epsilon: f64,

    /// Win rate a shadow audit must reach before advisory promotion
    #[serde(default = "default_win_rate_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub promotion_win_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnerMode {
    Shadow,
    Advisory,
    Disabled,
}

/// Where the persisted model files live
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PersistenceConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// One vehicle provider entry
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VehicleProviderConfig {
    #[validate(length(min = 1))]
    pub name: String,

    pub provider: ProviderKind,

    #[validate(range(min = 1.0, max = 300.0))]
    pub capacity_kwh: f64,

    #[serde(default = "default_ev_charge_power_kw")]
    pub charge_power_kw: f64,

    #[serde(default = "default_poll_interval_minutes")]
    #[validate(range(min = 15, max = 60))]
    pub poll_interval_minutes: u64,

    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Kia,
    Renault,
    Http,
    Manual,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8099 }
fn default_http_timeout_secs() -> u64 { 15 }
fn default_battery_max_price_ct() -> f64 { 25.0 }
fn default_feed_in_tariff_ct() -> f64 { 7.0 }
fn default_ev_max_price_ct() -> f64 { 30.0 }
fn default_ev_target_soc() -> f64 { 80.0 }
fn default_ev_capacity_kwh() -> f64 { 30.0 }
fn default_ev_charge_power_kw() -> f64 { 11.0 }
fn default_departure_hour() -> u32 { 7 }
fn default_bat_to_ev_floor() -> f64 { 30.0 }
fn default_min_profit_ct() -> f64 { 3.0 }
fn default_interval_minutes() -> u64 { 15 }
fn default_quiet_start() -> u32 { 22 }
fn default_quiet_end() -> u32 { 6 }
fn default_learner_mode() -> LearnerMode { LearnerMode::Shadow }
fn default_epsilon() -> f64 { 0.1 }
fn default_win_rate_threshold() -> f64 { 0.55 }
fn default_data_dir() -> PathBuf { PathBuf::from("/data") }
fn default_poll_interval_minutes() -> u64 { 30 }

/// Severity of a single validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

/// One config validation finding, rendered verbatim on the error page
#[derive(Debug, Clone, Serialize)]
pub struct ConfigIssue {
    pub field: &'static str,
    pub severity: Severity,
    pub message: String,
    pub suggestion: String,
}

impl AppConfig {
    /// Load configuration from `config.toml` overridden by `HED__`-prefixed
    /// environment variables (`HED__BATTERY__CAPACITY_KWH` -> battery.capacity_kwh).
    pub fn load() -> Result<Self> {
        Self::load_from(Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("HED__").split("__")))
    }

    pub fn load_from(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;
        Ok(config)
    }

    /// Domain validation beyond the derive-level range checks.
    ///
    /// Critical findings block the decision loop; warnings are fixed up by
    /// [`AppConfig::apply_safe_defaults`] and the loop continues.
    pub fn validate_issues(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        // Derive-level range violations are config the operator must fix
        if let Err(errors) = self.validate() {
            issues.push(ConfigIssue {
                field: "config",
                severity: Severity::Critical,
                message: format!(
                    "Konfigurationswerte ausserhalb der gueltigen Bereiche: {errors}"
                ),
                suggestion: "Wertebereiche der Felder pruefen".to_string(),
            });
        }

        if !self.evcc.url.starts_with("http") {
            issues.push(ConfigIssue {
                field: "evcc.url",
                severity: Severity::Critical,
                message: format!(
                    "evcc.url muss eine gueltige HTTP-URL sein, ist aber '{}'",
                    self.evcc.url
                ),
                suggestion: "Pruefe IP-Adresse und Port des evcc-Servers (z.B. http://evcc.local:7070)"
                    .to_string(),
            });
        }

        if self.battery.min_soc >= self.battery.max_soc {
            issues.push(ConfigIssue {
                field: "battery.min_soc",
                severity: Severity::Critical,
                message: format!(
                    "battery.min_soc ({}) muss kleiner als battery.max_soc ({}) sein",
                    self.battery.min_soc, self.battery.max_soc
                ),
                suggestion: "Setze z.B. min_soc=10, max_soc=90".to_string(),
            });
        }

        for (field, value) in [
            ("battery.charge_efficiency", self.battery.charge_efficiency),
            ("battery.discharge_efficiency", self.battery.discharge_efficiency),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                issues.push(ConfigIssue {
                    field,
                    severity: Severity::Critical,
                    message: format!(
                        "{field} muss zwischen 0 (exklusiv) und 1.0 liegen, ist aber {value}"
                    ),
                    suggestion: "Typischer Wert: 0.92".to_string(),
                });
            }
        }

        if !self.battery.capacity_kwh.is_finite() || self.battery.capacity_kwh <= 0.0 {
            issues.push(ConfigIssue {
                field: "battery.capacity_kwh",
                severity: Severity::Critical,
                message: "battery.capacity_kwh muss groesser als 0 sein".to_string(),
                suggestion: "Trage die Bruttokapazitaet der Batterie in kWh ein (z.B. 33.1)"
                    .to_string(),
            });
        }

        if self.battery.max_price_ct <= 0.0 {
            issues.push(ConfigIssue {
                field: "battery.max_price_ct",
                severity: Severity::Warning,
                message: format!(
                    "battery.max_price_ct ist {}ct - wird auf sicheren Default gesetzt (25.0ct)",
                    self.battery.max_price_ct
                ),
                suggestion: "Typischer Wert: 25.0".to_string(),
            });
        }

        if self.ev.max_price_ct <= 0.0 {
            issues.push(ConfigIssue {
                field: "ev.max_price_ct",
                severity: Severity::Warning,
                message: format!(
                    "ev.max_price_ct ist {}ct - wird auf sicheren Default gesetzt (30.0ct)",
                    self.ev.max_price_ct
                ),
                suggestion: "Typischer Wert: 30.0".to_string(),
            });
        }

        if self.ev.target_soc < 0.0 || self.ev.target_soc > 100.0 {
            issues.push(ConfigIssue {
                field: "ev.target_soc",
                severity: Severity::Warning,
                message: format!(
                    "ev.target_soc ({}) liegt ausserhalb des gueltigen Bereichs 0-100%",
                    self.ev.target_soc
                ),
                suggestion: "Typischer Wert: 80".to_string(),
            });
        }

        let interval = self.dispatch.decision_interval_minutes;
        if !(1..=60).contains(&interval) {
            issues.push(ConfigIssue {
                field: "dispatch.decision_interval_minutes",
                severity: Severity::Warning,
                message: format!(
                    "decision_interval_minutes ({interval}) liegt ausserhalb des Bereichs 1-60 - wird auf 15 gesetzt"
                ),
                suggestion: "Empfohlener Wert: 15".to_string(),
            });
        }

        issues
    }

    /// Replace warning-level values with their safe defaults, logging each change.
    pub fn apply_safe_defaults(&mut self, issues: &[ConfigIssue]) {
        for issue in issues {
            if issue.severity != Severity::Warning {
                continue;
            }
            match issue.field {
                "battery.max_price_ct" => {
                    tracing::warn!(old = self.battery.max_price_ct, "setze battery.max_price_ct=25.0");
                    self.battery.max_price_ct = 25.0;
                }
                "ev.max_price_ct" => {
                    tracing::warn!(old = self.ev.max_price_ct, "setze ev.max_price_ct=30.0");
                    self.ev.max_price_ct = 30.0;
                }
                "ev.target_soc" => {
                    tracing::warn!(old = self.ev.target_soc, "setze ev.target_soc=80");
                    self.ev.target_soc = 80.0;
                }
                "dispatch.decision_interval_minutes" => {
                    tracing::warn!(
                        old = self.dispatch.decision_interval_minutes,
                        "setze decision_interval_minutes=15"
                    );
                    self.dispatch.decision_interval_minutes = 15;
                }
                _ => {}
            }
        }
    }

    pub fn has_critical(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

pub type Config = AppConfig;
