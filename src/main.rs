use gumdrop::Options;
use std::process;

use hatchling::prelude::*;
use hatchling::scenario::Scenario;

/// Exit code of a load test that was canceled before its test plan finished.
const EXIT_ABORTED: i32 = 2;

fn main() {
    let configuration = LoadTestConfiguration::parse_args_default_or_exit();

    if configuration.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return;
    }

    if configuration.scenario.is_empty() {
        eprintln!("Error: a scenario is required, set one with --scenario FILE");
        eprintln!("Run with -h to see all available options.");
        process::exit(1);
    }

    match run(configuration) {
        Ok(RunOutcome::Completed) => (),
        Ok(RunOutcome::Aborted) => process::exit(EXIT_ABORTED),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Build a load test from the scenario file and run it.
fn run(configuration: LoadTestConfiguration) -> Result<RunOutcome, HatchlingError> {
    let scenario = Scenario::from_file(&configuration.scenario)?;
    let tasks = scenario.tasks()?;

    let mut load_test = LoadTest::initialize_with_config(configuration);
    // The scenario's host is a default, --host still takes precedence.
    if let Some(host) = scenario.host.as_deref() {
        load_test = *load_test.set_default(LoadTestDefault::Host, host)?;
    }
    if let Some(auth) = scenario.auth {
        load_test = load_test.set_auth(auth);
    }
    for task in tasks {
        load_test = load_test.register_task(task);
    }

    Ok(load_test.execute()?.outcome)
}
