use crate::config::{AppConfig, InitialConfig, InitialPressure};
use crate::device::PatchDevice;
use crate::error::PatchError;
use crate::states::{
    ApproachState, BathState, BreakInState, CellDetectState, CleanState, OutState, SealState,
    SimpleState,
};
use crate::task::StageContext;
use crate::types::PatchStateId;

/// Result of a stage's control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Normal completion with an optional next-state label.
    Transition(Option<PatchStateId>),
    /// Expected negative outcome: a failed completion that still names the
    /// state the procedure should fall back to, if any.
    Failed {
        error: String,
        next: Option<PatchStateId>,
    },
}

impl Outcome {
    pub fn next(label: PatchStateId) -> Self {
        Outcome::Transition(Some(label))
    }

    pub fn done() -> Self {
        Outcome::Transition(None)
    }

    pub fn failed(error: impl Into<String>, next: Option<PatchStateId>) -> Self {
        Outcome::Failed {
            error: error.into(),
            next,
        }
    }
}

/// One stage of the patch procedure.
///
/// Stages supply their initial device settings and, when they drive a
/// control loop, an algorithm polled with cooperative cancellation. The
/// task executor owns the worker lifecycle, the sample subscription, and
/// the exactly-once cleanup and completion guarantees.
pub trait StageProgram: Send {
    fn id(&self) -> PatchStateId;

    fn initial_config(&self) -> &InitialConfig;

    /// Apply initial pressure, clamp, and test-pulse settings on entry.
    fn initialize(&mut self, device: &dyn PatchDevice) -> Result<(), PatchError> {
        apply_initial_config(self.initial_config(), device)
    }

    /// Whether this stage runs a background control loop.
    fn has_algorithm(&self) -> bool {
        false
    }

    /// The stage's control loop. Must call `ctx.check_stop()` at every
    /// iteration boundary and keep all blocking waits timeout-bounded.
    fn run(&mut self, ctx: &StageContext) -> Result<Outcome, PatchError> {
        let _ = ctx;
        Ok(Outcome::done())
    }

    /// Invoked after `run` on every exit path. Failures here are reported
    /// but never override the already-decided outcome.
    fn cleanup(&mut self, ctx: &StageContext, interrupted: bool) -> Result<(), PatchError> {
        let _ = (ctx, interrupted);
        Ok(())
    }
}

/// Apply the optional initial device settings for a stage. Each absent
/// field leaves the corresponding device setting untouched.
pub fn apply_initial_config(
    init: &InitialConfig,
    device: &dyn PatchDevice,
) -> Result<(), PatchError> {
    match init.pressure {
        Some(InitialPressure::Source(source)) => {
            device.set_pressure_source(source)?;
            device.set_pressure(0.0)?;
        }
        Some(InitialPressure::Pascals(pascals)) => {
            device.set_regulator_pressure(pascals)?;
        }
        None => {}
    }

    if let Some(mode) = init.clamp_mode {
        device.set_clamp_mode(mode)?;
        if let Some(holding) = init.clamp_holding {
            device.set_holding(holding)?;
        }
    }

    if let Some(enabled) = init.test_pulse {
        device.enable_test_pulse(enabled)?;
    }

    Ok(())
}

/// Build the stage program for a state label from the resolved
/// configuration.
pub fn build_stage(id: PatchStateId, config: &AppConfig) -> Box<dyn StageProgram> {
    match id {
        PatchStateId::Out => Box::new(OutState::new(config.out.clone())),
        PatchStateId::Approach => Box::new(ApproachState::new(config.approach.clone())),
        PatchStateId::Attached => Box::new(SimpleState::new(id, config.attached.clone())),
        PatchStateId::WholeCell => Box::new(SimpleState::new(id, config.whole_cell.clone())),
        PatchStateId::Broken => Box::new(SimpleState::new(id, config.broken.clone())),
        PatchStateId::Fouled => Box::new(SimpleState::new(id, config.fouled.clone())),
        PatchStateId::Bath => Box::new(BathState::new(config.bath.clone())),
        PatchStateId::CellDetect => Box::new(CellDetectState::new(config.cell_detect.clone())),
        PatchStateId::Seal => Box::new(SealState::new(config.seal.clone())),
        PatchStateId::BreakIn => Box::new(BreakInState::new(config.break_in.clone())),
        PatchStateId::Clean => Box::new(CleanState::new(config.clean.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stage_covers_all_labels() {
        let config = AppConfig::default();
        let labels = [
            PatchStateId::Out,
            PatchStateId::Approach,
            PatchStateId::Attached,
            PatchStateId::WholeCell,
            PatchStateId::Broken,
            PatchStateId::Fouled,
            PatchStateId::Bath,
            PatchStateId::CellDetect,
            PatchStateId::Seal,
            PatchStateId::BreakIn,
            PatchStateId::Clean,
        ];
        for label in labels {
            let stage = build_stage(label, &config);
            assert_eq!(stage.id(), label);
        }
    }

    #[test]
    fn test_loop_stages_declare_algorithms() {
        let config = AppConfig::default();
        for label in [
            PatchStateId::Bath,
            PatchStateId::CellDetect,
            PatchStateId::Seal,
            PatchStateId::BreakIn,
            PatchStateId::Clean,
            PatchStateId::Approach,
        ] {
            assert!(build_stage(label, &config).has_algorithm(), "{label}");
        }
        for label in [
            PatchStateId::Out,
            PatchStateId::Attached,
            PatchStateId::WholeCell,
            PatchStateId::Broken,
            PatchStateId::Fouled,
        ] {
            assert!(!build_stage(label, &config).has_algorithm(), "{label}");
        }
    }
}
