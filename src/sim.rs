use crate::device::{MoveHandle, PatchDevice, TestPulseSubscription};
use crate::error::PatchError;
use crate::types::{ClampMode, MoveSpeed, Position3, PressureSource, TestPulse};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Traversal speed used for `MoveSpeed::Fast` (m/s).
const FAST_SPEED: f64 = 1e-3;

/// Retraction height used by `retract_from_surface` (m).
const RETRACT_HEIGHT: f64 = 1e-3;

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct RigInner {
    profile: Box<dyn Fn(f64) -> f64 + Send + Sync>,
    started: Instant,
    sample_interval: Duration,
    running: AtomicBool,
    test_pulse_enabled: AtomicBool,
    subscribers: Mutex<Vec<(u64, crossbeam_channel::Sender<TestPulse>)>>,
    next_subscriber: AtomicU64,
    last_pulse: Mutex<Option<TestPulse>>,
    position: Mutex<Position3>,
    direction: Position3,
    target: Mutex<Position3>,
    pressure: Mutex<(PressureSource, f64)>,
    holding: Mutex<f64>,
    clamp_mode: Mutex<ClampMode>,
    stored_positions: Mutex<HashMap<String, Position3>>,
    patch_record: Mutex<HashMap<String, f64>>,
    pipette_state: Mutex<String>,
}

impl RigInner {
    fn sample(&self) -> TestPulse {
        let elapsed = self.started.elapsed().as_secs_f64();
        TestPulse::new(epoch_secs(), (self.profile)(elapsed))
    }
}

/// Scripted patch rig for demos and integration tests.
///
/// The resistance seen at the tip follows a caller-supplied profile of
/// elapsed seconds; a background thread publishes test pulses to all
/// subscribers while test-pulse generation is enabled. Motion completes
/// after the travel time implied by distance and speed.
pub struct SimulatedRig {
    inner: Arc<RigInner>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedRig {
    pub fn new(
        sample_interval: Duration,
        profile: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Arc<Self> {
        let inner = Arc::new(RigInner {
            profile: Box::new(profile),
            started: Instant::now(),
            sample_interval,
            running: AtomicBool::new(true),
            test_pulse_enabled: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            last_pulse: Mutex::new(None),
            position: Mutex::new(Position3::default()),
            direction: Position3::new(0.0, 0.0, -1.0),
            target: Mutex::new(Position3::default()),
            pressure: Mutex::new((PressureSource::Atmosphere, 0.0)),
            holding: Mutex::new(0.0),
            clamp_mode: Mutex::new(ClampMode::Vc),
            stored_positions: Mutex::new(HashMap::new()),
            patch_record: Mutex::new(HashMap::new()),
            pipette_state: Mutex::new("out".to_string()),
        });

        let generator_inner = inner.clone();
        let generator = thread::spawn(move || {
            while generator_inner.running.load(Ordering::SeqCst) {
                thread::sleep(generator_inner.sample_interval);
                if !generator_inner.test_pulse_enabled.load(Ordering::SeqCst) {
                    continue;
                }
                let pulse = generator_inner.sample();
                *generator_inner.last_pulse.lock() = Some(pulse);
                generator_inner
                    .subscribers
                    .lock()
                    .retain(|(_, sender)| sender.send(pulse).is_ok());
            }
        });

        Arc::new(Self {
            inner,
            generator: Mutex::new(Some(generator)),
        })
    }

    /// Register a named rig position (clean well, rinse well, ...).
    pub fn store_position(&self, name: &str, position: Position3) {
        self.inner
            .stored_positions
            .lock()
            .insert(name.to_string(), position);
    }

    pub fn set_target(&self, position: Position3) {
        *self.inner.target.lock() = position;
    }

    pub fn pressure(&self) -> (PressureSource, f64) {
        *self.inner.pressure.lock()
    }

    pub fn patch_record_value(&self, field: &str) -> Option<f64> {
        self.inner.patch_record.lock().get(field).copied()
    }

    pub fn pipette_state(&self) -> String {
        self.inner.pipette_state.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Drop for SimulatedRig {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(generator) = self.generator.lock().take() {
            let _ = generator.join();
        }
    }
}

struct SimMove {
    done_at: Instant,
    canceled: AtomicBool,
}

impl MoveHandle for SimMove {
    fn wait_for(&self, timeout: Duration) -> Result<bool, PatchError> {
        if self.is_done() {
            return Ok(true);
        }
        let remaining = self.done_at.saturating_duration_since(Instant::now());
        thread::sleep(remaining.min(timeout));
        Ok(self.is_done())
    }

    fn is_done(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || Instant::now() >= self.done_at
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

impl PatchDevice for SimulatedRig {
    fn set_pressure_source(&self, source: PressureSource) -> Result<(), PatchError> {
        debug!("sim: pressure source -> {source}");
        self.inner.pressure.lock().0 = source;
        Ok(())
    }

    fn set_pressure(&self, pascals: f64) -> Result<(), PatchError> {
        debug!("sim: pressure set-point -> {pascals} Pa");
        self.inner.pressure.lock().1 = pascals;
        Ok(())
    }

    fn set_clamp_mode(&self, mode: ClampMode) -> Result<(), PatchError> {
        *self.inner.clamp_mode.lock() = mode;
        Ok(())
    }

    fn set_holding(&self, volts: f64) -> Result<(), PatchError> {
        debug!("sim: holding potential -> {volts} V");
        *self.inner.holding.lock() = volts;
        Ok(())
    }

    fn auto_pipette_offset(&self) -> Result<(), PatchError> {
        debug!("sim: auto pipette offset");
        Ok(())
    }

    fn enable_test_pulse(&self, enabled: bool) -> Result<(), PatchError> {
        self.inner.test_pulse_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn last_test_pulse(&self) -> Result<TestPulse, PatchError> {
        let last = *self.inner.last_pulse.lock();
        Ok(last.unwrap_or_else(|| self.inner.sample()))
    }

    fn reset_test_pulse_history(&self) -> Result<(), PatchError> {
        *self.inner.last_pulse.lock() = None;
        Ok(())
    }

    fn subscribe_test_pulses(&self) -> TestPulseSubscription {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().push((id, sender));
        let inner = self.inner.clone();
        TestPulseSubscription::new(receiver, move || {
            inner.subscribers.lock().retain(|(sid, _)| *sid != id);
        })
    }

    fn global_position(&self) -> Result<Position3, PatchError> {
        Ok(*self.inner.position.lock())
    }

    fn global_direction(&self) -> Result<Position3, PatchError> {
        Ok(self.inner.direction)
    }

    fn target_position(&self) -> Result<Position3, PatchError> {
        Ok(*self.inner.target.lock())
    }

    fn move_to(
        &self,
        position: Position3,
        speed: MoveSpeed,
    ) -> Result<Box<dyn MoveHandle>, PatchError> {
        let speed = match speed {
            MoveSpeed::Fast => FAST_SPEED,
            MoveSpeed::MetersPerSecond(v) => v,
        };
        if speed <= 0.0 {
            return Err(PatchError::Device(format!("invalid move speed: {speed}")));
        }
        let distance = self.inner.position.lock().distance_to(&position);
        // the sim teleports immediately; the handle completes after the
        // travel time implied by distance and speed
        *self.inner.position.lock() = position;
        Ok(Box::new(SimMove {
            done_at: Instant::now() + Duration::from_secs_f64(distance / speed),
            canceled: AtomicBool::new(false),
        }))
    }

    fn retract_from_surface(&self) -> Result<Box<dyn MoveHandle>, PatchError> {
        let above = self.inner.position.lock().with_z_offset(RETRACT_HEIGHT);
        self.move_to(above, MoveSpeed::Fast)
    }

    fn update_patch_record(&self, field: &str, value: f64) {
        debug!("sim: patch record {field} = {value}");
        self.inner
            .patch_record
            .lock()
            .insert(field.to_string(), value);
    }

    fn load_stored_position(&self, name: &str) -> Option<Position3> {
        self.inner.stored_positions.lock().get(name).copied()
    }

    fn new_pipette(&self) -> Result<(), PatchError> {
        info!("sim: pipette replaced");
        self.inner.patch_record.lock().clear();
        Ok(())
    }

    fn report_pipette_state(&self, state: &str) {
        info!("sim: pipette state -> {state}");
        *self.inner.pipette_state.lock() = state.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_receives_pulses_and_unsubscribes_on_drop() {
        let rig = SimulatedRig::new(Duration::from_millis(10), |_| 42e6);
        rig.enable_test_pulse(true).unwrap();
        {
            let subscription = rig.subscribe_test_pulses();
            assert_eq!(rig.subscriber_count(), 1);
            let pulse = subscription
                .receiver()
                .recv_timeout(Duration::from_millis(500))
                .unwrap();
            assert_eq!(pulse.steady_state_resistance, 42e6);
        }
        assert_eq!(rig.subscriber_count(), 0);
    }

    #[test]
    fn test_no_pulses_while_disabled() {
        let rig = SimulatedRig::new(Duration::from_millis(10), |_| 42e6);
        let subscription = rig.subscribe_test_pulses();
        assert!(subscription
            .receiver()
            .recv_timeout(Duration::from_millis(100))
            .is_err());
    }

    #[test]
    fn test_move_completes_after_travel_time() {
        let rig = SimulatedRig::new(Duration::from_millis(50), |_| 0.0);
        let handle = rig
            .move_to(
                Position3::new(0.0, 0.0, -100e-6),
                MoveSpeed::MetersPerSecond(1e-3),
            )
            .unwrap();
        assert!(!handle.is_done());
        assert!(handle.wait_for(Duration::from_millis(500)).unwrap());
        assert_eq!(
            rig.global_position().unwrap(),
            Position3::new(0.0, 0.0, -100e-6)
        );
    }

    #[test]
    fn test_profile_drives_resistance() {
        let rig = SimulatedRig::new(Duration::from_millis(10), |t| 50e6 + t * 1e6);
        rig.enable_test_pulse(true).unwrap();
        let subscription = rig.subscribe_test_pulses();
        let first = subscription
            .receiver()
            .recv_timeout(Duration::from_millis(500))
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        let later = subscription.receiver().try_iter().last().unwrap();
        assert!(later.steady_state_resistance > first.steady_state_resistance);
    }
}
