// Module declarations
pub mod parse;
pub mod process;
pub mod progress;
pub mod stats;

pub use process::{
    CriterionRecord, Diagnostic, DiagnosticKind, GenotypeDimensions, GroupKey, KSelectError,
    LrtRecord, RunRecord, StageOutcome,
};

#[cfg(test)]
#[path = "tests/parse_tests.rs"]
mod parse_tests;

#[cfg(test)]
#[path = "tests/stats_tests.rs"]
mod stats_tests;
