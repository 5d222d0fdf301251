//! Driver notification seam.
//!
//! The decision loop only needs "ask the driver when they leave"; the actual
//! transport (Telegram bot, push service) is an external collaborator. The
//! default implementation writes the inquiry to the log so the dashboard and
//! operators still see it.

use tracing::info;

pub trait Notifier: Send + Sync {
    /// Ask the driver of `vehicle` for their departure time. Fired exactly
    /// once per plug-in event.
    fn send_departure_inquiry(&self, vehicle: &str, soc: Option<f64>);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_departure_inquiry(&self, vehicle: &str, soc: Option<f64>) {
        info!(vehicle, soc = ?soc, "Abfahrtszeit-Anfrage an Fahrer");
    }
}
