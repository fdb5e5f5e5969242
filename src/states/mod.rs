pub mod bath;
pub mod cell_detect;
pub mod clean;
pub mod seal;
pub mod simple;

pub use bath::BathState;
pub use cell_detect::CellDetectState;
pub use clean::CleanState;
pub use seal::{BreakInState, SealState};
pub use simple::{ApproachState, OutState, SimpleState};
