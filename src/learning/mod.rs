pub mod reaction;
pub mod reliability;
pub mod residual;
pub mod seasonal;

pub use reaction::ReactionTimingTracker;
pub use reliability::{ConfidenceFactors, ForecastReliabilityTracker, ForecastSource};
pub use residual::ResidualLearner;
pub use seasonal::SeasonalBiasTable;
