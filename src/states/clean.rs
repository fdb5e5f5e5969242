use crate::config::{CleanConfig, InitialConfig};
use crate::stage::{Outcome, StageProgram};
use crate::task::StageContext;
use crate::types::{MoveSpeed, PatchStateId, Position3};
use crate::PatchError;
use log::{error, warn};
use std::time::Duration;

/// Pipette cleaning: retract, then dip the tip through the clean and rinse
/// wells while cycling pressure.
///
/// The approach point above each well is remembered so an interrupted run
/// can retreat to a known-safe height during cleanup.
pub struct CleanState {
    config: CleanConfig,
    reset_position: Option<Position3>,
}

impl CleanState {
    pub fn new(config: CleanConfig) -> Self {
        Self {
            config,
            reset_position: None,
        }
    }
}

impl StageProgram for CleanState {
    fn id(&self) -> PatchStateId {
        PatchStateId::Clean
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.config.init
    }

    fn has_algorithm(&self) -> bool {
        true
    }

    fn run(&mut self, ctx: &StageContext) -> Result<Outcome, PatchError> {
        let device = ctx.device();
        device.report_pipette_state("cleaning");

        let handle = device.retract_from_surface()?;
        ctx.wait_for_move(handle.as_ref())?;

        let stages = [
            ("clean", &self.config.clean_sequence),
            ("rinse", &self.config.rinse_sequence),
        ];
        for (name, sequence) in stages {
            ctx.check_stop()?;

            if sequence.is_empty() {
                continue;
            }
            let Some(target) = device.load_stored_position(name) else {
                if name == "clean" {
                    return Err(PatchError::Device(
                        "no stored clean position on this rig".to_string(),
                    ));
                }
                warn!("no stored rinse position, skipping rinse stage");
                continue;
            };
            let approach = target.with_z_offset(self.config.approach_height);

            ctx.set_status(format!("moving to {name} approach position"));
            let handle = device.move_to(approach, MoveSpeed::Fast)?;
            ctx.wait_for_move(handle.as_ref())?;
            ctx.check_stop()?;
            self.reset_position = Some(approach);

            ctx.set_status(format!("moving into {name} well"));
            let handle = device.move_to(target, MoveSpeed::Fast)?;
            ctx.wait_for_move(handle.as_ref())?;
            ctx.check_stop()?;

            for step in sequence {
                device.set_regulator_pressure(step.pressure)?;
                ctx.check_stop_for(Duration::from_secs_f64(step.dwell_secs))?;
            }
        }

        Ok(Outcome::done())
    }

    fn cleanup(&mut self, ctx: &StageContext, _interrupted: bool) -> Result<(), PatchError> {
        let device = ctx.device();
        if let Err(e) = device.set_regulator_pressure(0.0) {
            error!("failed to reset pressure after clean: {e}");
        }

        if let Some(position) = self.reset_position {
            // retreat to the last safe approach height; the move is issued
            // without waiting so cleanup cannot block
            device.move_to(position, MoveSpeed::Fast)?;
            device.report_pipette_state("out");
        }
        Ok(())
    }
}
