use gumdrop::Options;
use httpmock::MockServer;
use std::io::{self, BufRead};

use hatchling::config::LoadTestConfiguration;
use hatchling::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value
/// and if not using a test plan:
///  --host <mock-server>
///  --users 1
///  --hatch-rate 1
///  --run-time 1
///  --think-time 10ms
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> LoadTestConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using mock server if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    // A test plan can't be combined with the simple ramp options.
    if !configuration.contains(&"--test-plan") {
        // Default to testing with 1 user if not otherwise configured.
        if !configuration.contains(&"--users") {
            configuration.extend_from_slice(&["--users", "1"]);
        }

        // Default to hatch 1 user per second if not otherwise configured.
        if !configuration.contains(&"--hatch-rate") && !configuration.contains(&"--startup-time")
        {
            configuration.extend_from_slice(&["--hatch-rate", "1"]);
        }

        // Default to running for 1 second if not otherwise configured.
        if !configuration.contains(&"--run-time") {
            configuration.extend_from_slice(&["--run-time", "1"]);
        }
    }

    // Keep users busy instead of thinking for the default 1 to 5 seconds.
    if !configuration.contains(&"--think-time") {
        configuration.extend_from_slice(&["--think-time", "10ms"]);
    }

    // Parse these options to generate a LoadTestConfiguration.
    LoadTestConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Create a LoadTest from the configuration, tasks, and optional auth flow.
#[allow(dead_code)]
pub fn build_load_test(
    configuration: LoadTestConfiguration,
    tasks: Vec<Task>,
    auth: Option<AuthFlow>,
) -> LoadTest {
    let mut load_test = LoadTest::initialize_with_config(configuration);
    for task in tasks {
        load_test = load_test.register_task(task);
    }
    if let Some(auth) = auth {
        load_test = load_test.set_auth(auth);
    }
    load_test
}

/// Run the actual load test, returning the LoadTestReport.
#[allow(dead_code)]
pub fn run_load_test(load_test: LoadTest) -> LoadTestReport {
    load_test.execute().unwrap()
}

/// Register a mock endpoint that returns the same token to every login.
#[allow(dead_code)]
pub fn setup_auth_endpoints(server: &MockServer, login_status: u16) -> (httpmock::Mock, httpmock::Mock) {
    let register = server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/register");
        then.status(201);
    });
    let login = server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/login");
        then.status(login_status)
            .json_body(serde_json::json!({"token": "t0k3n"}));
    });
    (register, login)
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
