#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod auc;
pub mod brier;
pub mod cache;
pub mod config;
pub mod cox;
pub mod data;
pub mod discrimination;
pub mod export;
pub mod kaplan_meier;
pub mod linalg;
pub mod pipeline;
pub mod prediction_error;
pub mod progress;
pub mod resample;
