use crate::analysis::linear_slope;
use crate::config::{InitialConfig, PressureMode, SealConfig};
use crate::stage::{Outcome, StageProgram};
use crate::task::{StageContext, SAMPLE_POLL};
use crate::types::{PatchStateId, PressureSource, TestPulse};
use crate::PatchError;
use std::collections::VecDeque;
use std::time::Instant;

/// Resistance slope below which suction is eased back toward atmosphere
/// (ohm/s).
const SLOPE_FLOOR: f64 = 1e6;

/// Resistance slope above which suction is deepened toward vacuum (ohm/s).
const SLOPE_CEILING: f64 = 200e6;

/// Regulator set-point adjustment per decision (Pa).
const PRESSURE_STEP: f64 = 200.0;

/// Lower bound on the regulator set-point (Pa).
const MIN_PRESSURE: f64 = -10e3;

/// Seal formation: watch resistance climb toward the gigaohm range, latch
/// the holding potential on the way, and (in auto mode) modulate suction
/// from the resistance slope.
pub struct SealState {
    config: SealConfig,
}

impl SealState {
    pub fn new(config: SealConfig) -> Self {
        Self { config }
    }
}

impl StageProgram for SealState {
    fn id(&self) -> PatchStateId {
        PatchStateId::Seal
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.config.init
    }

    fn has_algorithm(&self) -> bool {
        true
    }

    fn run(&mut self, ctx: &StageContext) -> Result<Outcome, PatchError> {
        run_seal_loop(ctx, &self.config)
    }

    fn cleanup(&mut self, ctx: &StageContext, _interrupted: bool) -> Result<(), PatchError> {
        ctx.device().vent_to_atmosphere()
    }
}

/// Membrane rupture for whole-cell access. Runs the identical control loop
/// as `SealState` under its own name and configuration defaults; the rig
/// procedure treats them as distinct stages.
pub struct BreakInState {
    config: SealConfig,
}

impl BreakInState {
    pub fn new(config: SealConfig) -> Self {
        Self { config }
    }
}

impl StageProgram for BreakInState {
    fn id(&self) -> PatchStateId {
        PatchStateId::BreakIn
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.config.init
    }

    fn has_algorithm(&self) -> bool {
        true
    }

    fn run(&mut self, ctx: &StageContext) -> Result<Outcome, PatchError> {
        run_seal_loop(ctx, &self.config)
    }

    fn cleanup(&mut self, ctx: &StageContext, _interrupted: bool) -> Result<(), PatchError> {
        ctx.device().vent_to_atmosphere()
    }
}

fn run_seal_loop(ctx: &StageContext, config: &SealConfig) -> Result<Outcome, PatchError> {
    let device = ctx.device();
    let mut recent: VecDeque<TestPulse> = VecDeque::with_capacity(config.n_slope_samples);
    let initial = device.last_test_pulse()?;
    device.update_patch_record("resistance_before_seal", initial.steady_state_resistance);
    let started = Instant::now();
    let mut pressure = 0.0_f64;

    ctx.set_status("beginning seal");
    match config.pressure_mode {
        PressureMode::User => device.set_pressure_source(PressureSource::User)?,
        PressureMode::Auto => device.set_pressure_source(PressureSource::Atmosphere)?,
    }

    let mut holding_set = false;

    loop {
        ctx.check_stop()?;

        let samples = ctx.drain_samples(SAMPLE_POLL);
        for sample in &samples {
            if recent.len() == config.n_slope_samples {
                recent.pop_front();
            }
            recent.push_back(*sample);
        }
        let Some(sample) = samples.last() else {
            continue;
        };
        let ssr = sample.steady_state_resistance;

        if !holding_set && ssr > config.holding_threshold {
            ctx.set_status("enable holding potential");
            device.set_holding(config.holding_potential)?;
            holding_set = true;
        }

        if ssr > config.seal_threshold {
            device.vent_to_atmosphere()?;
            ctx.set_status("gigaohm seal detected");
            return Ok(Outcome::next(PatchStateId::Attached));
        }

        if config.pressure_mode == PressureMode::Auto {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed < config.pressure_hold_secs {
                // settle at atmosphere before the regulator takes over
                continue;
            }
            if elapsed > config.auto_seal_timeout_secs {
                return Ok(Outcome::failed(
                    format!("Seal failed after {elapsed:.1} seconds"),
                    None,
                ));
            }

            let times: Vec<f64> = recent.iter().map(|s| s.start_time).collect();
            let resistances: Vec<f64> =
                recent.iter().map(|s| s.steady_state_resistance).collect();
            if let Some(slope) = linear_slope(&times, &resistances) {
                if slope < SLOPE_FLOOR {
                    pressure += PRESSURE_STEP;
                } else if slope > SLOPE_CEILING {
                    pressure -= PRESSURE_STEP;
                }
            }
            pressure = pressure.clamp(MIN_PRESSURE, 0.0);
            device.set_regulator_pressure(pressure)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{feed_pulses_spaced, test_context, DeviceCall, MockRig};
    use std::time::Duration;

    fn auto_config() -> SealConfig {
        SealConfig {
            pressure_hold_secs: 0.0,
            ..SealConfig::default()
        }
    }

    fn setpoints(rig: &MockRig) -> Vec<f64> {
        rig.calls()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Pressure(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_gigaohm_seal_vents_before_success_auto_mode() {
        let rig = MockRig::new();
        let (ctx, _shared) = test_context(rig.clone(), PatchStateId::Seal);

        let rig_feeder = rig.clone();
        let feeder = std::thread::spawn(move || {
            feed_pulses_spaced(&rig_feeder, &[(0.0, 1.5e9)], Duration::from_millis(30));
        });

        let outcome = SealState::new(auto_config()).run(&ctx).unwrap();
        feeder.join().unwrap();
        assert_eq!(outcome, Outcome::next(PatchStateId::Attached));

        let calls = rig.calls();
        // atmosphere restored after the initial entry and before completion
        let vents: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                matches!(c, DeviceCall::PressureSource(PressureSource::Atmosphere)).then_some(i)
            })
            .collect();
        assert!(vents.len() >= 2);
    }

    #[test]
    fn test_gigaohm_seal_vents_before_success_user_mode() {
        let rig = MockRig::new();
        let (ctx, _shared) = test_context(rig.clone(), PatchStateId::Seal);

        let config = SealConfig {
            pressure_mode: PressureMode::User,
            ..SealConfig::default()
        };

        let rig_feeder = rig.clone();
        let feeder = std::thread::spawn(move || {
            feed_pulses_spaced(&rig_feeder, &[(0.0, 1.5e9)], Duration::from_millis(30));
        });

        let outcome = SealState::new(config).run(&ctx).unwrap();
        feeder.join().unwrap();
        assert_eq!(outcome, Outcome::next(PatchStateId::Attached));

        let calls = rig.calls();
        let user_idx = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::PressureSource(PressureSource::User)))
            .unwrap();
        let vent_idx = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::PressureSource(PressureSource::Atmosphere)))
            .unwrap_or(usize::MAX);
        assert!(vent_idx > user_idx);
        assert_ne!(vent_idx, usize::MAX);
    }

    #[test]
    fn test_holding_potential_latched_once() {
        let rig = MockRig::new();
        let (ctx, _shared) = test_context(rig.clone(), PatchStateId::Seal);

        let rig_feeder = rig.clone();
        let feeder = std::thread::spawn(move || {
            feed_pulses_spaced(
                &rig_feeder,
                &[(0.0, 150e6), (0.2, 180e6), (0.4, 1.5e9)],
                Duration::from_millis(60),
            );
        });

        let outcome = SealState::new(auto_config()).run(&ctx).unwrap();
        feeder.join().unwrap();
        assert_eq!(outcome, Outcome::next(PatchStateId::Attached));

        let holdings: Vec<f64> = rig
            .calls()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Holding(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(holdings, vec![-70e-3]);
    }

    #[test]
    fn test_atmosphere_hold_defers_regulator() {
        let rig = MockRig::new();
        let (ctx, shared) = test_context(rig.clone(), PatchStateId::Seal);

        let config = SealConfig {
            pressure_hold_secs: 30.0,
            ..SealConfig::default()
        };

        let rig_feeder = rig.clone();
        let shared_feeder = shared.clone();
        let feeder = std::thread::spawn(move || {
            // steep rise that would otherwise deepen suction
            feed_pulses_spaced(
                &rig_feeder,
                &[(0.0, 100e6), (0.1, 150e6), (0.2, 210e6)],
                Duration::from_millis(60),
            );
            std::thread::sleep(Duration::from_millis(300));
            shared_feeder.request_stop();
        });

        let result = SealState::new(config).run(&ctx);
        feeder.join().unwrap();
        assert!(matches!(result, Err(PatchError::Stopped)));
        assert!(setpoints(&rig).is_empty());
    }

    #[test]
    fn test_steep_slope_deepens_suction_and_flat_slope_releases() {
        let rig = MockRig::new();
        let (ctx, shared) = test_context(rig.clone(), PatchStateId::Seal);

        let rig_feeder = rig.clone();
        let shared_feeder = shared.clone();
        let feeder = std::thread::spawn(move || {
            // slope ~300 MOhm/s over the window: above the ceiling
            feed_pulses_spaced(
                &rig_feeder,
                &[(0.0, 200e6), (0.1, 230e6)],
                Duration::from_millis(60),
            );
            std::thread::sleep(Duration::from_millis(250));
            // near-flat tail: slope falls below the floor
            feed_pulses_spaced(
                &rig_feeder,
                &[
                    (0.2, 230.00e6),
                    (0.3, 230.01e6),
                    (0.4, 230.02e6),
                    (0.5, 230.03e6),
                    (0.6, 230.04e6),
                ],
                Duration::from_millis(60),
            );
            std::thread::sleep(Duration::from_millis(300));
            shared_feeder.request_stop();
        });

        let result = SealState::new(auto_config()).run(&ctx);
        feeder.join().unwrap();
        assert!(matches!(result, Err(PatchError::Stopped)));

        let applied = setpoints(&rig);
        assert!(!applied.is_empty());
        // suction deepened by one step, then released back toward atmosphere
        assert!(applied.contains(&-200.0));
        assert_eq!(*applied.last().unwrap(), 0.0);
        assert!(applied.iter().all(|p| (-10e3..=0.0).contains(p)));
    }

    #[test]
    fn test_auto_seal_timeout_fails_without_next_state() {
        let rig = MockRig::new();
        let (ctx, _shared) = test_context(rig.clone(), PatchStateId::Seal);

        let config = SealConfig {
            pressure_hold_secs: 0.0,
            auto_seal_timeout_secs: 0.2,
            ..SealConfig::default()
        };

        let rig_feeder = rig.clone();
        let feeder = std::thread::spawn(move || {
            feed_pulses_spaced(
                &rig_feeder,
                &[(0.0, 150e6), (0.3, 150e6), (0.6, 150e6)],
                Duration::from_millis(150),
            );
        });

        let outcome = SealState::new(config).run(&ctx).unwrap();
        feeder.join().unwrap();
        match outcome {
            Outcome::Failed { error, next } => {
                assert!(error.contains("Seal failed after"));
                assert!(next.is_none());
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[test]
    fn test_break_in_shares_seal_loop() {
        let rig = MockRig::new();
        let (ctx, _shared) = test_context(rig.clone(), PatchStateId::BreakIn);

        let rig_feeder = rig.clone();
        let feeder = std::thread::spawn(move || {
            feed_pulses_spaced(&rig_feeder, &[(0.0, 1.5e9)], Duration::from_millis(30));
        });

        let mut state = BreakInState::new(auto_config());
        assert_eq!(state.id(), PatchStateId::BreakIn);
        let outcome = state.run(&ctx).unwrap();
        feeder.join().unwrap();
        assert_eq!(outcome, Outcome::next(PatchStateId::Attached));
    }
}
