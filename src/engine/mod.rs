pub mod ensemble;
pub mod odds;
pub mod producers;

pub use ensemble::{EnsembleConfig, EnsembleEngine};
pub use producers::{FeatureBlendModel, HistoricalTrendModel, LineMomentumModel, ModelProducer};
