pub mod analysis;
pub mod config;
pub mod device;
pub mod error;
pub mod session_log;
pub mod sim;
pub mod stage;
pub mod states;
pub mod task;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{
    load_config, load_config_or_default, AdvanceMode, AppConfig, BathConfig, CellDetectConfig,
    CleanConfig, InitialConfig, InitialPressure, LoggingConfig, PressureMode, PressureStep,
    SealConfig,
};
pub use device::{MoveHandle, PatchDevice, TestPulseSubscription};
pub use error::PatchError;
pub use session_log::{SessionLog, SessionRecord};
pub use sim::SimulatedRig;
pub use stage::{apply_initial_config, build_stage, Outcome, StageProgram};
pub use task::{StageContext, StateTask, TaskResult};
pub use types::{
    ClampMode, Completion, MoveSpeed, PatchStateId, Position3, PressureSource, StateEvent,
    TestPulse,
};
