use crate::analysis::median;
use crate::config::{BathConfig, InitialConfig};
use crate::stage::{Outcome, StageProgram};
use crate::task::{StageContext, SAMPLE_POLL};
use crate::types::PatchStateId;
use crate::PatchError;

/// Samples beyond this count establish the immersion baseline.
const BASELINE_SAMPLES: usize = 8;

/// Monitors the tip while it sits in the recording chamber.
///
/// Waits for immersion, measures a median baseline resistance, then watches
/// for a broken or clogged tip relative to that baseline.
pub struct BathState {
    config: BathConfig,
}

impl BathState {
    pub fn new(config: BathConfig) -> Self {
        Self { config }
    }
}

impl StageProgram for BathState {
    fn id(&self) -> PatchStateId {
        PatchStateId::Bath
    }

    fn initial_config(&self) -> &InitialConfig {
        &self.config.init
    }

    fn has_algorithm(&self) -> bool {
        true
    }

    fn run(&mut self, ctx: &StageContext) -> Result<Outcome, PatchError> {
        let config = &self.config;
        let mut baseline: Option<f64> = None;
        let mut bath_resistances: Vec<f64> = Vec::new();

        loop {
            ctx.check_stop()?;

            let samples = ctx.drain_samples(SAMPLE_POLL);
            // if we're falling behind, just skip the extra test pulses
            let Some(sample) = samples.last() else {
                continue;
            };
            let ssr = sample.steady_state_resistance;

            let base = match baseline {
                Some(base) => base,
                None => {
                    if ssr <= config.bath_threshold {
                        // not in bath yet; restart the baseline window
                        bath_resistances.clear();
                        continue;
                    }
                    ctx.set_status(format!("bath detected: {:.1} MOhm", ssr / 1e6));
                    bath_resistances.push(ssr);
                    if bath_resistances.len() <= BASELINE_SAMPLES {
                        continue;
                    }
                    let base = median(&bath_resistances);
                    ctx.set_status(format!(
                        "initial resistance measured: {:.1} MOhm",
                        base / 1e6
                    ));
                    ctx.device().update_patch_record("initial_bath_resistance", base);
                    baseline = Some(base);
                    base
                }
            };

            if ssr < base + config.break_threshold {
                ctx.set_status("broken pipette detected");
                return Ok(Outcome::failed("Pipette broken", Some(PatchStateId::Broken)));
            }

            if ssr > base + config.clog_threshold {
                ctx.set_status("clogged pipette detected");
                return Ok(Outcome::failed("Pipette clogged", Some(PatchStateId::Fouled)));
            }
        }
    }
}
