use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tariff or solar-forecast slot as reported by evcc.
///
/// `value` is EUR/kWh for grid tariffs. Solar forecasts may report W or kW;
/// [`solar_values_are_watts`] disambiguates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: f64,
}

/// Per-cycle snapshot of the whole site, rebuilt every decision cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub timestamp: Option<DateTime<Utc>>,

    /// Battery SoC in percent (0-100)
    pub battery_soc: f64,
    /// Signed W, positive = charging
    pub battery_power: f64,
    /// Signed W, positive = import
    pub grid_power: f64,
    pub pv_power: f64,
    pub home_power: f64,

    /// EUR/kWh
    pub current_price: f64,

    pub ev_connected: bool,
    pub ev_name: String,
    pub ev_soc: f64,
    pub ev_capacity_kwh: f64,
    /// Rated charger power
    pub ev_charge_power_kw: f64,
    /// Momentary charge power at the loadpoint, W
    pub ev_power: f64,

    /// percentile -> EUR/kWh, derived from the forward tariff window
    pub price_percentiles: BTreeMap<u8, f64>,
    /// P80 - P20 in EUR/kWh
    pub price_spread: f64,
    /// Tariff entries at or below P30 still ahead today
    pub hours_cheap_remaining: usize,
    /// Expected PV energy over the next 24h (kWh)
    pub solar_forecast_total_kwh: f64,
}

impl SystemState {
    /// Fill the derived price context from the forward tariff and solar windows.
    pub fn enrich_with_tariffs(&mut self, tariffs: &[TariffSlot], solar: &[TariffSlot]) {
        if tariffs.is_empty() {
            return;
        }
        self.price_percentiles = compute_price_percentiles(tariffs);
        self.price_spread = self.price_percentiles.get(&80).copied().unwrap_or(0.0)
            - self.price_percentiles.get(&20).copied().unwrap_or(0.0);
        let p30 = self.price_percentiles.get(&30).copied().unwrap_or(0.20);
        self.hours_cheap_remaining = tariffs.iter().filter(|t| t.value <= p30).count();
        self.solar_forecast_total_kwh = solar_energy_kwh(solar);
    }
}

/// Percentiles of the forward tariff window, linearly interpolated.
pub fn compute_price_percentiles(tariffs: &[TariffSlot]) -> BTreeMap<u8, f64> {
    let mut prices: Vec<f64> = tariffs.iter().map(|t| t.value).collect();
    prices.sort_by(|a, b| a.total_cmp(b));

    let mut out = BTreeMap::new();
    if prices.is_empty() {
        return out;
    }
    for p in [10u8, 20, 30, 40, 50, 60, 70, 80, 90] {
        out.insert(p, percentile(&prices, f64::from(p)));
    }
    out
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// evcc's solar tariff reports W on some installations and kW on others.
/// A median above 100 can only plausibly be W.
pub fn solar_values_are_watts(solar: &[TariffSlot]) -> bool {
    if solar.is_empty() {
        return false;
    }
    let mut values: Vec<f64> = solar.iter().map(|s| s.value.abs()).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2] > 100.0
}

/// Total forecast PV energy in kWh over the given window.
pub fn solar_energy_kwh(solar: &[TariffSlot]) -> f64 {
    let to_kw = if solar_values_are_watts(solar) { 0.001 } else { 1.0 };
    solar
        .iter()
        .map(|s| {
            let dur_h = (s.end - s.start).num_minutes().max(0) as f64 / 60.0;
            s.value.max(0.0) * to_kw * dur_h
        })
        .sum()
}

/// PV energy left over after house load, in kWh, over the forecast window.
pub fn solar_surplus_kwh(solar: &[TariffSlot], home_load_kw: f64) -> f64 {
    let to_kw = if solar_values_are_watts(solar) { 0.001 } else { 1.0 };
    solar
        .iter()
        .map(|s| {
            let dur_h = (s.end - s.start).num_minutes().max(0) as f64 / 60.0;
            (s.value * to_kw - home_load_kw).max(0.0) * dur_h
        })
        .sum()
}
