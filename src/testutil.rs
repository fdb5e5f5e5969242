//! Shared test support: a recording mock of the device facade.

use crate::device::{MoveHandle, PatchDevice, TestPulseSubscription};
use crate::error::PatchError;
use crate::task::{StageContext, TaskShared};
use crate::types::{ClampMode, MoveSpeed, PatchStateId, Position3, PressureSource, TestPulse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Every facade call a state can make, recorded in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeviceCall {
    PressureSource(PressureSource),
    Pressure(f64),
    ClampMode(ClampMode),
    Holding(f64),
    TestPulse(bool),
    AutoOffset,
    ResetHistory,
    MoveTo(Position3, MoveSpeed),
    Retract,
    Record(String, f64),
    PipetteState(String),
    NewPipette,
}

/// Recording mock rig. Samples are fed manually; moves complete
/// immediately and update the reported position.
pub(crate) struct MockRig {
    calls: Mutex<Vec<DeviceCall>>,
    subscribers: Mutex<Vec<crossbeam_channel::Sender<TestPulse>>>,
    position: Mutex<Position3>,
    direction: Position3,
    target: Mutex<Position3>,
    stored: Mutex<HashMap<String, Position3>>,
    last_pulse: Mutex<Option<TestPulse>>,
    fail_pressure: AtomicBool,
}

impl MockRig {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            position: Mutex::new(Position3::default()),
            direction: Position3::new(0.0, 0.0, -1.0),
            target: Mutex::new(Position3::default()),
            stored: Mutex::new(HashMap::new()),
            last_pulse: Mutex::new(None),
            fail_pressure: AtomicBool::new(false),
        })
    }

    pub(crate) fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }

    /// Deliver one test pulse to all subscribers.
    pub(crate) fn feed(&self, resistance: f64, time: f64) {
        let pulse = TestPulse::new(time, resistance);
        *self.last_pulse.lock() = Some(pulse);
        self.subscribers
            .lock()
            .retain(|sender| sender.send(pulse).is_ok());
    }

    pub(crate) fn store_position(&self, name: &str, position: Position3) {
        self.stored.lock().insert(name.to_string(), position);
    }

    #[allow(dead_code)]
    pub(crate) fn set_target(&self, position: Position3) {
        *self.target.lock() = position;
    }

    /// Make every pressure call fail, for initialization-failure tests.
    pub(crate) fn fail_pressure_calls(&self) {
        self.fail_pressure.store(true, Ordering::SeqCst);
    }

    fn pressure_result(&self) -> Result<(), PatchError> {
        if self.fail_pressure.load(Ordering::SeqCst) {
            Err(PatchError::Device("pressure regulator offline".to_string()))
        } else {
            Ok(())
        }
    }
}

struct InstantMove;

impl MoveHandle for InstantMove {
    fn wait_for(&self, _timeout: Duration) -> Result<bool, PatchError> {
        Ok(true)
    }

    fn is_done(&self) -> bool {
        true
    }

    fn cancel(&self) {}
}

impl PatchDevice for MockRig {
    fn set_pressure_source(&self, source: PressureSource) -> Result<(), PatchError> {
        self.pressure_result()?;
        self.record(DeviceCall::PressureSource(source));
        Ok(())
    }

    fn set_pressure(&self, pascals: f64) -> Result<(), PatchError> {
        self.pressure_result()?;
        self.record(DeviceCall::Pressure(pascals));
        Ok(())
    }

    fn set_clamp_mode(&self, mode: ClampMode) -> Result<(), PatchError> {
        self.record(DeviceCall::ClampMode(mode));
        Ok(())
    }

    fn set_holding(&self, volts: f64) -> Result<(), PatchError> {
        self.record(DeviceCall::Holding(volts));
        Ok(())
    }

    fn auto_pipette_offset(&self) -> Result<(), PatchError> {
        self.record(DeviceCall::AutoOffset);
        Ok(())
    }

    fn enable_test_pulse(&self, enabled: bool) -> Result<(), PatchError> {
        self.record(DeviceCall::TestPulse(enabled));
        Ok(())
    }

    fn last_test_pulse(&self) -> Result<TestPulse, PatchError> {
        let last = *self.last_pulse.lock();
        Ok(last.unwrap_or(TestPulse {
            start_time: 0.0,
            steady_state_resistance: 100e6,
        }))
    }

    fn reset_test_pulse_history(&self) -> Result<(), PatchError> {
        self.record(DeviceCall::ResetHistory);
        Ok(())
    }

    fn subscribe_test_pulses(&self) -> TestPulseSubscription {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(sender);
        TestPulseSubscription::new(receiver, || {})
    }

    fn global_position(&self) -> Result<Position3, PatchError> {
        Ok(*self.position.lock())
    }

    fn global_direction(&self) -> Result<Position3, PatchError> {
        Ok(self.direction)
    }

    fn target_position(&self) -> Result<Position3, PatchError> {
        Ok(*self.target.lock())
    }

    fn move_to(
        &self,
        position: Position3,
        speed: MoveSpeed,
    ) -> Result<Box<dyn MoveHandle>, PatchError> {
        self.record(DeviceCall::MoveTo(position, speed));
        *self.position.lock() = position;
        Ok(Box::new(InstantMove))
    }

    fn retract_from_surface(&self) -> Result<Box<dyn MoveHandle>, PatchError> {
        self.record(DeviceCall::Retract);
        Ok(Box::new(InstantMove))
    }

    fn update_patch_record(&self, field: &str, value: f64) {
        self.record(DeviceCall::Record(field.to_string(), value));
    }

    fn load_stored_position(&self, name: &str) -> Option<Position3> {
        self.stored.lock().get(name).copied()
    }

    fn new_pipette(&self) -> Result<(), PatchError> {
        self.record(DeviceCall::NewPipette);
        Ok(())
    }

    fn report_pipette_state(&self, state: &str) {
        self.record(DeviceCall::PipetteState(state.to_string()));
    }
}

/// Build a detached stage context over a mock rig, for exercising state
/// algorithms without the task executor. The returned shared handle stops
/// the loop via `request_stop`.
pub(crate) fn test_context(
    rig: Arc<MockRig>,
    state: PatchStateId,
) -> (StageContext, Arc<TaskShared>) {
    let shared = TaskShared::new(None);
    let samples = rig.subscribe_test_pulses();
    let ctx = StageContext::new(rig, samples, shared.clone(), state);
    (ctx, shared)
}

/// Feed resistances one per interval, with sample times spaced 0.1 s apart.
pub(crate) fn feed_spaced(rig: &MockRig, resistances: &[f64], spacing: Duration) {
    for (i, resistance) in resistances.iter().enumerate() {
        rig.feed(*resistance, i as f64 * 0.1);
        std::thread::sleep(spacing);
    }
}

/// Feed (time, resistance) pulses one per interval.
pub(crate) fn feed_pulses_spaced(rig: &MockRig, pulses: &[(f64, f64)], spacing: Duration) {
    for (time, resistance) in pulses {
        rig.feed(*resistance, *time);
        std::thread::sleep(spacing);
    }
}
