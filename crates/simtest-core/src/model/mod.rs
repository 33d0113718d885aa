//! Testset tree data model.

pub mod command;
pub mod run;
pub mod target;
pub mod testset;

pub use command::{Command, HandlerRef};
pub use run::{RunRecord, RunStatus, TestLocation};
pub use target::{render_scalar, Target, TargetConfig, DEFAULT_TARGET};
pub use test::{BenchmarkRule, Test};
pub use testset::Testset;
