pub mod app;
pub mod config;
pub mod realtime;
pub mod snapshot;
pub mod telemetry;
pub mod worklist;

pub use app::{build_engine, engine_with, run, Command, WorklistEngine, WorklistView};
pub use config::{AppConfig, Cli};
pub use realtime::{RealtimeConfig, RealtimeFeed};
pub use snapshot::HttpSnapshotSource;
pub use worklist::{Gate, Kpis, WorklistModel, WorklistRow};
