use crate::config::{AdvanceMode, CellDetectConfig, InitialConfig};
use crate::stage::{Outcome, StageProgram};
use crate::task::{StageContext, SAMPLE_POLL};
use crate::types::{MoveSpeed, PatchStateId, Position3};
use crate::PatchError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hunts for a cell by watching resistance while stepping the tip forward.
///
/// A sharp resistance rise (fast criteria) or a sustained monotonic rise
/// (slow criteria) hands off to the seal stage; a resistance drop reports a
/// broken tip; exhausting the search distance fails with no next state.
pub struct CellDetectState {
    config: CellDetectConfig,
}

impl CellDetectState {
    pub fn new(config: CellDetectConfig) -> Self {
        Self { config }
    }

    fn step_target(
        &self,
        ctx: &StageContext,
        start_position: Position3,
        current: Position3,
        step_count: usize,
    ) -> Result<Option<Position3>, PatchError> {
        let step = (step_count + 1) as f64 * self.config.advance_step_distance;
        let target = match self.config.advance_mode {
            AdvanceMode::Vertical => start_position.with_z_offset(-step),
            AdvanceMode::Axial => {
                let direction = ctx.device().global_direction()?;
                start_position + direction * step
            }
            AdvanceMode::Target => {
                let target = ctx.device().target_position()?;
                let toward = target - current;
                let distance = toward.norm();
                if distance < f64::EPSILON {
                    // already on target; nowhere further to advance
                    return Ok(None);
                }
                current + toward * (self.config.advance_step_distance / distance)
            }
        };
        Ok(Some(target))
    }
}

impl StageProgram for CellDetectState {
    fn id(&self) -> PatchStateId {
        PatchStateId::CellDetect
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.config.init
    }

    fn has_algorithm(&self) -> bool {
        true
    }

    fn run(&mut self, ctx: &StageContext) -> Result<Outcome, PatchError> {
        let config = self.config.clone();
        let window = config.slow_detection_steps + 1;
        let mut recent: VecDeque<f64> = VecDeque::with_capacity(window);
        let mut baseline: Option<f64> = None;
        let mut last_move: Option<Instant> = None;
        let start_position = ctx.device().global_position()?;
        let mut step_count: usize = 0;
        let advance_interval = Duration::from_secs_f64(config.advance_interval_secs);

        loop {
            ctx.check_stop()?;

            ctx.set_status("checking test pulses");
            let samples = ctx.drain_samples(SAMPLE_POLL);
            if samples.is_empty() {
                continue;
            }
            for sample in &samples {
                if recent.len() == window {
                    recent.pop_front();
                }
                recent.push_back(sample.steady_state_resistance);
            }
            let ssr = samples[samples.len() - 1].steady_state_resistance;
            let base = *baseline.get_or_insert(ssr);

            if ssr < base + config.break_threshold {
                return Ok(Outcome::failed("Pipette broken", Some(PatchStateId::Broken)));
            }

            if ssr > base + config.fast_detection_threshold {
                ctx.set_status("cell detected (fast criteria)");
                return Ok(Outcome::next(PatchStateId::Seal));
            }

            if recent.len() > config.slow_detection_steps {
                let rising = recent
                    .iter()
                    .zip(recent.iter().skip(1))
                    .all(|(a, b)| b > a);
                if rising && ssr - base > config.slow_detection_threshold {
                    ctx.set_status("cell detected (slow criteria)");
                    return Ok(Outcome::next(PatchStateId::Seal));
                }
            }

            let position = ctx.device().global_position()?;
            if position.distance_to(&start_position) > config.max_advance_distance {
                return Ok(Outcome::failed(
                    "No cell found within maximum search distance",
                    None,
                ));
            }

            if !config.auto_advance {
                continue;
            }
            if let Some(at) = last_move {
                if at.elapsed() < advance_interval {
                    continue;
                }
            }

            ctx.check_stop()?;
            ctx.set_status("advancing pipette");
            let Some(target) = self.step_target(ctx, start_position, position, step_count)? else {
                continue;
            };
            let handle = ctx
                .device()
                .move_to(target, MoveSpeed::MetersPerSecond(config.advance_speed))?;
            ctx.wait_for_move(handle.as_ref())?;
            step_count += 1;
            last_move = Some(Instant::now());
        }
    }
}
