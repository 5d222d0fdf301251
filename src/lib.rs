pub mod arbitrage;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod domain;
pub mod engine;
pub mod evcc;
pub mod forecast;
pub mod learning;
pub mod modes;
pub mod overrides;
pub mod persist;
pub mod planner;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod vehicles;
