//! Service layer
//!
//! Services sit between the web handlers and the lower layers (cache, queue,
//! pipeline, progress). Handlers validate nothing themselves beyond request
//! shape; domain validation and all orchestration happen here.

pub mod job_orchestrator;

pub use job_orchestrator::{
    JobOrchestrator, OrchestratorSettings, SubmitOutcome, TileAvailability, TilePipeline,
    result_url,
};
