//! Scan orchestration: forge access, commit replay, repository workspaces,
//! the scanner driver, the batch engine, and the metrics exporter.

pub mod engine;
pub mod export;
pub mod forge;
pub mod gitspace;
pub mod replay;
pub mod scanner;
pub mod sonar;

pub use engine::ScanEngine;
pub use export::{ExportOptions, ExportSummary, run_export};
pub use forge::{ForgeClient, ForgeError, TokenPool};
pub use sonar::{SonarAuth, SonarClient};
