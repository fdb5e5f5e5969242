use crate::error::PatchError;
use crate::types::{ClampMode, MoveSpeed, Position3, PressureSource, TestPulse};
use crossbeam_channel::Receiver;
use std::time::Duration;

/// Handle to an in-flight motorized move.
///
/// All waits are timeout-bounded so callers can interleave cooperative
/// cancellation checks between polls.
pub trait MoveHandle: Send {
    /// Block up to `timeout` for the move to finish. Returns true once the
    /// move has completed (or was canceled).
    fn wait_for(&self, timeout: Duration) -> Result<bool, PatchError>;

    fn is_done(&self) -> bool;

    /// Abort the move. Idempotent.
    fn cancel(&self);
}

/// Scoped subscription to the device's test-pulse producer.
///
/// Dropping the guard unsubscribes, so the subscription cannot outlive the
/// worker that holds it regardless of how the worker exits.
pub struct TestPulseSubscription {
    receiver: Receiver<TestPulse>,
    canceler: Option<Box<dyn FnOnce() + Send>>,
}

impl TestPulseSubscription {
    pub fn new(receiver: Receiver<TestPulse>, canceler: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            canceler: Some(Box::new(canceler)),
        }
    }

    pub fn receiver(&self) -> &Receiver<TestPulse> {
        &self.receiver
    }
}

impl Drop for TestPulseSubscription {
    fn drop(&mut self) {
        if let Some(canceler) = self.canceler.take() {
            canceler();
        }
    }
}

/// Facade over the patch rig hardware consumed by the state controllers.
///
/// Calls are synchronous and assumed non-reentrant: at most one state task
/// talks to the facade at a time, a discipline owned by the sequencing
/// caller rather than this crate.
pub trait PatchDevice: Send + Sync {
    // --- pressure ---
    fn set_pressure_source(&self, source: PressureSource) -> Result<(), PatchError>;
    fn set_pressure(&self, pascals: f64) -> Result<(), PatchError>;

    /// Route the regulator to a numeric set-point.
    fn set_regulator_pressure(&self, pascals: f64) -> Result<(), PatchError> {
        self.set_pressure(pascals)?;
        self.set_pressure_source(PressureSource::Regulator)
    }

    /// Vent the pipette back end to ambient.
    fn vent_to_atmosphere(&self) -> Result<(), PatchError> {
        self.set_pressure_source(PressureSource::Atmosphere)
    }

    // --- clamp ---
    fn set_clamp_mode(&self, mode: ClampMode) -> Result<(), PatchError>;
    fn set_holding(&self, volts: f64) -> Result<(), PatchError>;
    fn auto_pipette_offset(&self) -> Result<(), PatchError>;

    // --- test pulses ---
    fn enable_test_pulse(&self, enabled: bool) -> Result<(), PatchError>;
    fn last_test_pulse(&self) -> Result<TestPulse, PatchError>;
    fn reset_test_pulse_history(&self) -> Result<(), PatchError>;
    fn subscribe_test_pulses(&self) -> TestPulseSubscription;

    // --- motion ---
    fn global_position(&self) -> Result<Position3, PatchError>;
    /// Unit vector along the pipette axis, pointing toward the sample.
    fn global_direction(&self) -> Result<Position3, PatchError>;
    fn target_position(&self) -> Result<Position3, PatchError>;
    fn move_to(&self, position: Position3, speed: MoveSpeed)
        -> Result<Box<dyn MoveHandle>, PatchError>;
    fn retract_from_surface(&self) -> Result<Box<dyn MoveHandle>, PatchError>;

    // --- bookkeeping ---
    /// Record a named numeric field on the persistent patch record.
    fn update_patch_record(&self, field: &str, value: f64);
    /// Look up a stored rig position by name.
    fn load_stored_position(&self, name: &str) -> Option<Position3>;
    /// Signal that the physical pipette has been replaced.
    fn new_pipette(&self) -> Result<(), PatchError>;
    /// Report a coarse pipette state label to the rig bookkeeping.
    fn report_pipette_state(&self, state: &str);
}
