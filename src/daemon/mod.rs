//! Daemon Module
//!
//! The long-running parser service. The orchestrator owns every task; the
//! HTTP API and the CLI are thin clients of it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     manga-parser serve                       │
//! │                                                              │
//! │  ┌────────────┐   submit    ┌──────────────────────────────┐ │
//! │  │ HTTP API   │────────────▶│ TaskOrchestrator             │ │
//! │  │ (axum)     │◀── SSE ─────│  FIFO queue ─▶ N permits     │ │
//! │  └────────────┘             │  Parse / Build executors     │ │
//! │        ▲                    └──────┬───────────────┬───────┘ │
//! │        │ events                    │               │         │
//! │  ┌─────┴────────────┐   ┌──────────▼─────┐  ┌──────▼──────┐  │
//! │  │ ProgressBroadcaster│  │ SourceAdapter  │  │Collaborators│  │
//! │  └──────────────────┘   │ (proxied HTTP) │  │ (catalog,   │  │
//! │                         └────────────────┘  │  chapters,  │  │
//! │                                             │  images)    │  │
//! │                                             └─────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod broadcaster;
pub mod collaborators;
pub mod events;
pub mod http;
pub mod jobs;
pub mod lifecycle;
pub mod metrics;
pub mod outputs;

pub use broadcaster::{ProgressBroadcaster, Subscription};
pub use collaborators::{CatalogService, ChapterService, Collaborators, ImageStorage};
pub use events::ProgressEvent;
pub use http::HttpServer;
pub use jobs::{BuildRequest, OrchestratorError, TaskEnvironment, TaskOrchestrator};
pub use lifecycle::{build_orchestrator, Daemon};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics, Timer};
pub use outputs::{CleanupReport, OutputError, OutputStore};
