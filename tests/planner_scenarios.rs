//! End-to-end planner scenarios: literal inputs, expected dispatch shapes.

use chrono::{DateTime, Duration, TimeZone, Utc};
use figment::providers::{Format, Toml};
use figment::Figment;
use std::collections::HashMap;

use home_energy_dispatcher::config::AppConfig;
use home_energy_dispatcher::domain::{SystemState, TariffSlot};
use home_energy_dispatcher::learning::ConfidenceFactors;
use home_energy_dispatcher::planner::{HorizonPlanner, MinilpSolver};

fn config() -> AppConfig {
    let toml = r#"
        [server]
        [evcc]
        url = "http://evcc.local:7070"
        [battery]
        capacity_kwh = 10.0
        charge_power_kw = 5.0
        charge_efficiency = 0.95
        discharge_efficiency = 0.95
        min_soc = 10.0
        max_soc = 90.0
        max_price_ct = 25.0
        [ev]
        target_soc = 80.0
        [arbitrage]
        [dispatch]
        [learner]
        [persistence]
    "#;
    AppConfig::load_from(Figment::new().merge(Toml::string(toml))).unwrap()
}

fn planner() -> HorizonPlanner {
    HorizonPlanner::new(&config(), Box::new(MinilpSolver))
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 22, 0, 0, 0).unwrap()
}

fn hourly_tariffs(prices: &[f64], from: DateTime<Utc>) -> Vec<TariffSlot> {
    prices
        .iter()
        .enumerate()
        .map(|(i, p)| TariffSlot {
            start: from + Duration::hours(i as i64),
            end: from + Duration::hours(i as i64 + 1),
            value: *p,
        })
        .collect()
}

fn house_state(battery_soc: f64, now: DateTime<Utc>) -> SystemState {
    SystemState {
        timestamp: Some(now),
        battery_soc,
        current_price: 0.25,
        home_power: 500.0,
        ..Default::default()
    }
}

#[test]
fn flat_prices_no_ev_plans_no_battery_charging() {
    let now = start();
    let tariffs = hourly_tariffs(&[0.25; 24], now);
    let plan = planner()
        .plan(
            &house_state(50.0, now),
            &tariffs,
            &[500.0; 96],
            &[0.0; 96],
            &HashMap::new(),
            &ConfidenceFactors::default(),
            0.0,
        )
        .expect("flat 24h prices must produce a plan");

    assert_eq!(plan.slots.len(), 96);
    assert_eq!(plan.padded_slots, 0);
    let total_charge: f64 = plan.slots.iter().map(|s| s.bat_charge_kw).sum();
    assert!(
        total_charge < 0.5,
        "flat prices should leave the battery alone, charged {total_charge:.3} kW total"
    );
}

#[test]
fn price_valley_concentrates_charging_in_cheap_half() {
    let now = start();
    let mut prices = vec![0.40; 12];
    prices.extend(vec![0.10; 12]);
    let tariffs = hourly_tariffs(&prices, now);

    let plan = planner()
        .plan(
            &house_state(30.0, now),
            &tariffs,
            &[500.0; 96],
            &[0.0; 96],
            &HashMap::new(),
            &ConfidenceFactors::default(),
            0.0,
        )
        .expect("plan");

    let charge_expensive: f64 = plan.slots[..48].iter().map(|s| s.bat_charge_kw).sum();
    let charge_cheap: f64 = plan.slots[48..].iter().map(|s| s.bat_charge_kw).sum();
    assert!(
        charge_cheap > charge_expensive,
        "cheap half should carry the charging: cheap {charge_cheap:.2}, expensive {charge_expensive:.2}"
    );
    assert!(charge_cheap > 1.0, "valley must actually trigger charging");
}

#[test]
fn urgent_ev_departure_frontloads_charging() {
    let now = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap();
    let tariffs = hourly_tariffs(&[0.25; 24], now);

    let state = SystemState {
        timestamp: Some(now),
        battery_soc: 50.0,
        current_price: 0.25,
        home_power: 1000.0,
        ev_connected: true,
        ev_name: "ioniq".to_string(),
        ev_soc: 30.0,
        ev_capacity_kwh: 30.0,
        ev_charge_power_kw: 11.0,
        ..Default::default()
    };
    let departures: HashMap<String, DateTime<Utc>> =
        [("ioniq".to_string(), now + Duration::hours(3))].into_iter().collect();

    let plan = planner()
        .plan(
            &state,
            &tariffs,
            &[1000.0; 96],
            &[0.0; 96],
            &departures,
            &ConfidenceFactors::default(),
            0.0,
        )
        .expect("plan");

    let ev_first_12: f64 = plan.slots[..12].iter().map(|s| s.ev_charge_kw).sum();
    let ev_rest: f64 = plan.slots[12..].iter().map(|s| s.ev_charge_kw).sum();
    assert!(
        ev_first_12 > ev_rest,
        "EV charging must land before departure: first {ev_first_12:.2}, rest {ev_rest:.2}"
    );

    // Delivered energy reaches the departure target
    let dep_soc = plan.slots[12].ev_soc_pct;
    assert!(dep_soc >= 79.5, "EV SoC at departure slot: {dep_soc:.1}%");
}

#[test]
fn eight_hour_horizon_plans_with_padding_seven_does_not() {
    let now = start();
    let p = planner();

    let eight = hourly_tariffs(&[0.20; 8], now);
    let plan = p
        .plan(
            &house_state(50.0, now),
            &eight,
            &[500.0; 96],
            &[0.0; 96],
            &HashMap::new(),
            &ConfidenceFactors::default(),
            0.0,
        )
        .expect("32 slots are enough");
    assert_eq!(plan.padded_slots, 64);

    let seven = hourly_tariffs(&[0.20; 7], now);
    assert!(p
        .plan(
            &house_state(50.0, now),
            &seven,
            &[500.0; 96],
            &[0.0; 96],
            &HashMap::new(),
            &ConfidenceFactors::default(),
            0.0,
        )
        .is_none());
}

#[test]
fn battery_at_min_with_high_feed_in_never_goes_below_min() {
    let now = start();
    let tariffs = hourly_tariffs(&[0.40; 24], now);
    let plan = planner()
        .plan(
            &house_state(10.0, now),
            &tariffs,
            &[500.0; 96],
            &[0.0; 96],
            &HashMap::new(),
            &ConfidenceFactors::default(),
            0.0,
        )
        .expect("plan");
    for slot in &plan.slots {
        assert!(slot.bat_soc_pct >= 10.0 - 0.5, "slot {}: {:.2}%", slot.slot_index, slot.bat_soc_pct);
    }
}

#[test]
fn pv_confidence_scales_objective_not_feasibility() {
    let now = start();
    let mut prices = vec![0.40; 12];
    prices.extend(vec![0.10; 12]);
    let tariffs = hourly_tariffs(&prices, now);

    for pv_conf in [0.0, 0.5, 1.0] {
        let confidence = ConfidenceFactors { pv: pv_conf, consumption: 1.0, price: 1.0 };
        let plan = planner()
            .plan(
                &house_state(40.0, now),
                &tariffs,
                &[500.0; 96],
                &[3.0; 96],
                &HashMap::new(),
                &confidence,
                0.0,
            )
            .expect("plan must exist at every confidence level");
        assert_eq!(plan.slots.len(), 96);
    }
}
