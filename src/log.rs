use crate::solver::SolveStatus;
use std::time::Duration;

pub fn show_greeting() {
    println!("# dro-dispatch v{}", env!("CARGO_PKG_VERSION"));
}

pub fn input_reading_line(path: &str) {
    println!("\nReading input files from '{path}'");
}

/// Helper function for displaying the greeting data for the MPC sweep
pub fn mpc_greeting(
    num_risk_weights: usize,
    num_epochs: usize,
    horizon: usize,
) {
    println!("\n# Receding horizon");
    println!("- Risk weights: {num_risk_weights}");
    println!("- Epochs: {num_epochs}");
    println!("- Horizon: {horizon}\n");
}

/// Helper function for displaying the greeting data for the radius sweep
pub fn sweep_greeting(
    num_radii: usize,
    num_risk_weights: usize,
    num_scenarios: usize,
) {
    println!("\n# Radius sweep");
    println!("- Radii: {num_radii}");
    println!("- Risk weights: {num_risk_weights}");
    println!("- Scenarios: {num_scenarios}\n");
}

/// Helper function for displaying the sweep table header
pub fn sweep_table_header(position: &str) {
    println!(
        "{0: ^10} | {1: ^8} | {2: ^10} | {3: ^15} | {4: ^12} | {5: ^10}",
        "weight", position, "status", "objective ($)", "cvar", "time (s)"
    )
}

/// Helper function for displaying a divider for the sweep table
pub fn sweep_table_divider() {
    println!("{}", "-".repeat(80))
}

/// Helper function for displaying a row of the sweep table
pub fn sweep_table_row(
    risk_weight: f64,
    position: usize,
    status: &SolveStatus,
    objective: Option<f64>,
    cvar: f64,
    time: Duration,
) {
    let status = format!("{status:?}");
    match objective {
        Some(objective) => println!(
            "{0: >10.3} | {1: >8} | {2: >10} | {3: >15.4} | {4: >12.6} | {5: >10.2}",
            risk_weight,
            position,
            status,
            objective,
            cvar,
            time.as_millis() as f64 / 1000.0
        ),
        None => println!(
            "{0: >10.3} | {1: >8} | {2: >10} | {3: >15} | {4: >12} | {5: >10.2}",
            risk_weight,
            position,
            status,
            "-",
            "-",
            time.as_millis() as f64 / 1000.0
        ),
    }
}

pub fn output_generation_line(path: &str) {
    println!("\nWriting outputs to '{path}'");
}

pub fn show_farewell(time: Duration) {
    println!("\nTotal running time: {:.2} s", time.as_millis() as f64 / 1000.0)
}
