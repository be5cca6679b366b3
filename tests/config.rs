/// Validate that invalid load test configurations are rejected before any user is
/// launched.
use gumdrop::Options;
use httpmock::{Method::GET, Mock, MockServer};
use serial_test::serial;

mod common;

use hatchling::prelude::*;

// Paths used in load tests performed during these tests.
const INDEX_PATH: &str = "/";

fn setup_mock_server_endpoints(server: &MockServer) -> Mock {
    server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    })
}

// Run a load test expected to fail, asserting nothing was requested.
fn expect_error(custom: Vec<&str>) -> HatchlingError {
    let server = MockServer::start();
    let index = setup_mock_server_endpoints(&server);
    let configuration = common::build_configuration(&server, custom);
    let error = common::build_load_test(configuration, vec![Task::get("index", INDEX_PATH)], None)
        .execute()
        .unwrap_err();
    assert_eq!(index.hits(), 0);
    error
}

#[test]
#[serial]
/// A load test needs at least one task.
fn test_no_tasks() {
    let server = MockServer::start();
    let configuration = common::build_configuration(&server, vec![]);
    let error = common::build_load_test(configuration, vec![], None)
        .execute()
        .unwrap_err();
    assert!(matches!(error, HatchlingError::NoTasks { .. }));
}

#[test]
#[serial]
/// The host must be a valid base url.
fn test_invalid_host() {
    assert!(matches!(
        expect_error(vec!["--host", "not a host"]),
        HatchlingError::InvalidHost { .. }
    ));
    assert!(matches!(
        expect_error(vec!["--host", "mailto:load@test.com"]),
        HatchlingError::InvalidOption { .. }
    ));
}

#[test]
#[serial]
/// The minimum think time can't exceed the maximum.
fn test_invalid_think_time() {
    assert!(matches!(
        expect_error(vec!["--think-time", "5s,1s"]),
        HatchlingError::InvalidWaitTime { .. }
    ));
    // Unparseable think times are rejected while parsing options.
    assert!(LoadTestConfiguration::parse_args_default(&["--think-time", "soon"]).is_err());
}

#[test]
#[serial]
/// Simple ramp options can't be zero, or mixed with a test plan.
fn test_invalid_users() {
    match expect_error(vec!["--users", "0"]) {
        HatchlingError::InvalidOption { option, .. } => {
            assert_eq!(option, "`configuration.users`")
        }
        e => panic!("unexpected error: {}", e),
    }
    match expect_error(vec!["--test-plan", "10,1s", "--users", "5"]) {
        HatchlingError::InvalidOption { option, .. } => {
            assert_eq!(option, "`configuration.users`")
        }
        e => panic!("unexpected error: {}", e),
    }
    match expect_error(vec!["--test-plan", "10,1s", "--max-users", "0"]) {
        HatchlingError::InvalidOption { option, .. } => {
            assert_eq!(option, "`configuration.max_users`")
        }
        e => panic!("unexpected error: {}", e),
    }
}

#[test]
#[serial]
/// Timeouts must be greater than zero, and a request format needs a request log.
fn test_invalid_advanced_options() {
    match expect_error(vec!["--timeout", "0"]) {
        HatchlingError::InvalidOption { option, .. } => {
            assert_eq!(option, "`configuration.timeout`")
        }
        e => panic!("unexpected error: {}", e),
    }
    match expect_error(vec!["--request-format", "csv"]) {
        HatchlingError::InvalidOption { option, .. } => {
            assert_eq!(option, "`configuration.request_format`")
        }
        e => panic!("unexpected error: {}", e),
    }
}

#[test]
#[serial]
/// Time spans too long to count in milliseconds are rejected instead of wrapping.
fn test_overlong_time_spans() {
    match expect_error(vec!["--run-time", "5124095576030432h"]) {
        HatchlingError::InvalidOption { option, .. } => {
            assert_eq!(option, "`configuration.run_time`")
        }
        e => panic!("unexpected error: {}", e),
    }
    match expect_error(vec!["--timeout", "18446744073709551615"]) {
        HatchlingError::InvalidOption { option, .. } => {
            assert_eq!(option, "`configuration.timeout`")
        }
        e => panic!("unexpected error: {}", e),
    }
    assert!(LoadTestConfiguration::parse_args_default(&["--test-plan", "5,1s;0,5124095576030432h"])
        .is_err());
}

#[test]
#[serial]
/// Programmatic defaults are used when no option is set.
fn test_defaults() {
    let server = MockServer::start();
    let index = setup_mock_server_endpoints(&server);

    let configuration = LoadTestConfiguration::parse_args_default(&["--think-time", "10ms"])
        .expect("failed to parse options");
    let load_test = *LoadTest::initialize_with_config(configuration)
        .register_task(Task::get("index", INDEX_PATH))
        .set_default(LoadTestDefault::Host, server.base_url().as_str())
        .unwrap()
        .set_default(LoadTestDefault::Users, 2)
        .unwrap()
        .set_default(LoadTestDefault::HatchRate, "10")
        .unwrap()
        .set_default(LoadTestDefault::RunTime, 1)
        .unwrap()
        .set_default(LoadTestDefault::NoPrintMetrics, true)
        .unwrap();
    let report = load_test.execute().unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.metrics.users.spawned, 2);
    assert!(index.hits() > 0);
}
