#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod basis;
pub mod classify;
pub mod cohort;
pub mod config;
pub mod correct;
pub mod features;
pub mod geometry;
pub mod linalg;
pub mod pipeline;
pub mod progress;
pub mod roc;
pub mod solver;
pub mod tfx;

#[path = "../shared/tables.rs"]
pub mod tables;

pub use basis::{AggregateMethod, ReferenceSimplex, SimplexBuilder, SimplexVertex};
pub use classify::{CalibratedThreshold, Call, ClassificationCall, OperatingCondition, classify};
pub use config::RunConfig;
pub use correct::{CorrectedVector, TumorFractionCorrector, TumorFractionSource};
pub use features::{FeatureMatrix, FeatureVector};
pub use pipeline::{BatchReport, Deconvolver, ErrorKind, QuerySample, SampleFailure};
pub use solver::{MixtureResult, SimplexSolver};
pub use tfx::LikelihoodWeights;
