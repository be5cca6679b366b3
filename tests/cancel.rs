/// Validate that Hatchling stops all users and returns its metrics when a load test
/// is canceled, either with SIGINT (control-c) or with a CancelHandle.
use httpmock::{Method::GET, Mock, MockServer};
use nix::sys::signal::{kill, SIGINT};
use nix::unistd::getpid;
use serial_test::serial;
use std::time::{Duration, Instant};

mod common;

use hatchling::prelude::*;

// Paths used in load tests performed during these tests.
const INDEX_PATH: &str = "/";

// Load test configuration.
const USERS: &str = "3";

// How the load test gets canceled.
enum CancelType {
    Signal,
    Handle,
}

// All tests in this file run against a common endpoint.
fn setup_mock_server_endpoints(server: &MockServer) -> Mock {
    server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    })
}

// Run a load test that would last an hour, and cancel it after 2 seconds.
fn run_canceled_test(cancel_type: CancelType) {
    let server = MockServer::start();
    let index = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(
        &server,
        vec![
            "--users",
            USERS,
            "--hatch-rate",
            "10",
            "--run-time",
            "1h",
            "--no-print-metrics",
        ],
    );
    let load_test = common::build_load_test(
        configuration,
        vec![Task::get("index", INDEX_PATH)],
        None,
    );

    let cancel = load_test.cancel_handle();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(2));
        match cancel_type {
            CancelType::Signal => {
                kill(getpid(), SIGINT).expect("failed to send SIGINT");
            }
            CancelType::Handle => cancel.cancel(),
        }
    });

    let started = Instant::now();
    let report = common::run_load_test(load_test);

    // The load test stopped long before its run time.
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(report.outcome, RunOutcome::Aborted);

    // Metrics collected before the cancel are all returned.
    let index_metrics = report.metrics.action("index").unwrap();
    assert!(index_metrics.request_count() > 0);
    assert_eq!(index_metrics.request_count(), index.hits());
    assert_eq!(report.metrics.users.spawned, 3);
    assert_eq!(report.metrics.users.forced_stops, 0);
    assert!(report.metrics.final_metrics);
}

#[test]
#[serial]
/// Cancel a load test with SIGINT.
fn test_cancel_signal() {
    run_canceled_test(CancelType::Signal);
}

#[test]
#[serial]
/// Cancel a load test with a CancelHandle.
fn test_cancel_handle() {
    run_canceled_test(CancelType::Handle);
}

#[test]
#[serial]
/// A load test that isn't canceled completes.
fn test_completed() {
    let server = MockServer::start();
    let index = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(&server, vec!["--no-print-metrics"]);
    let report = common::run_load_test(common::build_load_test(
        configuration,
        vec![Task::get("index", INDEX_PATH)],
        None,
    ));

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(index.hits() > 0);
}
