pub mod contingency;
pub mod distribution;
pub mod feeder;
pub mod grid;
pub mod input;
mod log;
pub mod output;
pub mod program;
pub mod recovery;
pub mod risk;
pub mod scenario;
pub mod schedule;
pub mod solver;
pub mod state;
pub mod transmission;
pub mod utils;
use distribution::DistributionCase;
use input::{Input, Study};
use output::ResultStore;
use solver::SolveStatus;
use std::error::Error;
use std::time::Instant;
use transmission::TransmissionCase;

pub fn run(input_args: &InputArgs) -> Result<(), Box<dyn Error>> {
    log::show_greeting();

    let begin = Instant::now();
    log::input_reading_line(&input_args.path);
    let input = Input::build(&input_args.path)?;
    let config = &input.config;
    let oracle = config.solver.oracle();

    let mut store = ResultStore::new();
    match &input.study {
        Study::Distribution(study) => {
            let case = DistributionCase {
                feeder: &study.feeder,
                settings: &study.settings,
                schedule: &study.schedule,
                forecast: &study.forecast,
                prices: &study.prices,
                errors: &study.errors,
                num_scenarios: study.num_scenarios,
                num_holdout: study.num_holdout,
                initial_soc: &study.initial_soc,
            };
            distribution::run_mpc(
                &case,
                &config.risk_weights,
                study.num_epochs,
                &oracle,
                &mut store,
            )?;
        }
        Study::Transmission(study) => {
            let case = TransmissionCase {
                grid: &study.grid,
                settings: &study.settings,
                table: &study.table,
                samples: &study.samples,
                holdout: study.holdout.as_ref(),
            };
            transmission::run_sweep(
                &case,
                &study.epsilons,
                &config.risk_weights,
                &oracle,
                &mut store,
            )?;
        }
    }
    tracing::info!(
        records = store.len(),
        optimal = store.count_status(SolveStatus::Optimal),
        infeasible = store.count_status(SolveStatus::Infeasible),
        failed = store.count_status(SolveStatus::Failed),
        "sweep finished"
    );

    log::output_generation_line(&input_args.path);
    output::generate_outputs(&store, &input_args.path)?;

    log::show_farewell(begin.elapsed());

    Ok(())
}

pub struct InputArgs {
    pub path: String,
}

impl InputArgs {
    pub fn build(args: &[String]) -> Result<Self, &'static str> {
        if args.len() < 2 {
            return Err("Not enough arguments [PATH]");
        }

        let path = args[1].clone();

        Ok(Self { path })
    }
}
