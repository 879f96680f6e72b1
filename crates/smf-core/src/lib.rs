pub mod agent;
pub mod campaign;
pub mod campaign_executor;
pub mod config;
pub mod dn;
pub mod error;
pub mod executor;
pub mod io;
pub mod mailbox;
pub mod notify;
pub mod orchestrator;
pub mod parser;
pub mod procedure;
pub mod procedure_executor;
pub mod redb_store;
pub mod shell_agent;
pub mod step;
pub mod step_machine;
pub mod store;
pub mod types;

pub use error::{Result, SmfError};
pub use orchestrator::{CampaignStatus, Orchestrator, OrchestratorContext};
pub use types::{AdminOperation, AdminResult, CampaignState, ProcedureState, StepType};
