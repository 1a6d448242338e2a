//! Forming labeled measurement pairs and reducing pair sets.

pub mod background;
pub mod generator;
pub mod policy;
pub mod split;
pub mod triage;

pub use background::{BackgroundSampler, BackgroundStats, DEFAULT_MIN_BACKGROUND_GAP_SECS};
pub use generator::{GeneratedPairs, PairGenerator, PairingStats};
pub use policy::{DeviceGroups, PairingPolicy, ProximityPolicy, TrackPolicy};
pub use split::{TrainTest, holdout_split};
