use serde::Deserialize;

/// Site-level snapshot from `GET /api/state`. evcc wraps the payload in a
/// `result` object on most versions; the client unwraps either shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvccState {
    #[serde(default)]
    pub battery_soc: Option<f64>,
    #[serde(default)]
    pub battery_power: Option<f64>,
    #[serde(default)]
    pub grid_power: Option<f64>,
    #[serde(default)]
    pub pv_power: Option<f64>,
    #[serde(default)]
    pub home_power: Option<f64>,
    #[serde(default)]
    pub loadpoints: Vec<Loadpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loadpoint {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub charging: bool,
    #[serde(default)]
    pub vehicle_soc: Option<f64>,
    #[serde(default)]
    pub vehicle_name: Option<String>,
    #[serde(default)]
    pub vehicle_capacity: Option<f64>,
    #[serde(default)]
    pub charge_power: Option<f64>,
}

impl EvccState {
    pub fn first_loadpoint(&self) -> Option<&Loadpoint> {
        self.loadpoints.first()
    }
}
