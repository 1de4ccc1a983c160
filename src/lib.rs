pub mod attack;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod labels;
pub mod loss;
pub mod model;
pub mod telemetry;
pub mod training;
pub mod utils;
