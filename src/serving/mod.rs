//! Model Swap Controller and Prediction Server.

mod controller;
mod predict;

pub use controller::{ModelSwapController, PromotionError, SlotState};
pub use predict::{PredictionError, PredictionOutcome, PredictionServer};
