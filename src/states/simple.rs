use crate::config::InitialConfig;
use crate::device::PatchDevice;
use crate::error::PatchError;
use crate::stage::{apply_initial_config, Outcome, StageProgram};
use crate::task::StageContext;
use crate::types::PatchStateId;

/// Configuration-only stage: applies its initial device settings and
/// completes immediately. Used for attached, whole cell, broken, and
/// fouled.
pub struct SimpleState {
    id: PatchStateId,
    init: InitialConfig,
}

impl SimpleState {
    pub fn new(id: PatchStateId, init: InitialConfig) -> Self {
        Self { id, init }
    }
}

impl StageProgram for SimpleState {
    fn id(&self) -> PatchStateId {
        self.id
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.init
    }
}

/// Pipette removed from the rig. Applies its settings and signals that the
/// physical pipette has been replaced.
pub struct OutState {
    init: InitialConfig,
}

impl OutState {
    pub fn new(init: InitialConfig) -> Self {
        Self { init }
    }
}

impl StageProgram for OutState {
    fn id(&self) -> PatchStateId {
        PatchStateId::Out
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.init
    }

    fn initialize(&mut self, device: &dyn PatchDevice) -> Result<(), PatchError> {
        apply_initial_config(&self.init, device)?;
        device.new_pipette()
    }
}

/// Moving toward the sample. Runs a one-shot calibration: automatic
/// pipette offset on the clamp, then a reset of the test-pulse history so
/// later baselines start clean.
pub struct ApproachState {
    init: InitialConfig,
}

impl ApproachState {
    pub fn new(init: InitialConfig) -> Self {
        Self { init }
    }
}

impl StageProgram for ApproachState {
    fn id(&self) -> PatchStateId {
        PatchStateId::Approach
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.init
    }

    fn has_algorithm(&self) -> bool {
        true
    }

    fn run(&mut self, ctx: &StageContext) -> Result<Outcome, PatchError> {
        ctx.device().auto_pipette_offset()?;
        ctx.device().reset_test_pulse_history()?;
        Ok(Outcome::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_context, DeviceCall, MockRig};

    #[test]
    fn test_out_signals_new_pipette_after_settings() {
        let rig = MockRig::new();
        let mut state = OutState::new(crate::config::InitialConfig::new(
            crate::config::InitialPressure::Source(crate::types::PressureSource::Atmosphere),
            crate::types::ClampMode::Vc,
            0.0,
            false,
        ));
        state.initialize(rig.as_ref()).unwrap();
        let calls = rig.calls();
        let pressure_idx = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::PressureSource(_)))
            .unwrap();
        let new_pipette_idx = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::NewPipette))
            .unwrap();
        assert!(pressure_idx < new_pipette_idx);
        assert!(calls
            .iter()
            .any(|c| matches!(c, DeviceCall::TestPulse(false))));
    }

    #[test]
    fn test_approach_calibrates_and_resets_history() {
        let rig = MockRig::new();
        let (ctx, _shared) = test_context(rig.clone(), PatchStateId::Approach);
        let mut state = ApproachState::new(InitialConfig::empty());
        let outcome = state.run(&ctx).unwrap();
        assert_eq!(outcome, Outcome::done());
        let calls = rig.calls();
        assert!(calls.iter().any(|c| matches!(c, DeviceCall::AutoOffset)));
        assert!(calls.iter().any(|c| matches!(c, DeviceCall::ResetHistory)));
    }
}
