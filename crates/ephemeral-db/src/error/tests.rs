//! Unit tests for the instance error surface.

use std::error::Error as _;

use super::*;
use crate::supervisor::ProcessDiagnostics;

#[test]
fn locate_errors_are_environment_failures() {
    let error = InstanceError::from(LocateError::NotInstalled {
        marker: String::from("initdb"),
        searched: 3,
    });

    assert!(error.is_environment());
    assert!(error.to_string().contains("initdb"));
}

#[test]
fn identity_errors_are_environment_failures() {
    let error = InstanceError::from(IdentityError::MissingServiceAccount {
        account: String::from("mysql"),
    });

    assert!(error.is_environment());
    assert!(error.to_string().contains("mysql"));
}

#[test]
fn startup_errors_carry_process_output() {
    let error = InstanceError::from(StartupError::Exited {
        status: String::from("exit status: 3"),
        diagnostics: ProcessDiagnostics {
            stdout: String::from("starting"),
            stderr: String::from("boom"),
        },
    });

    assert!(!error.is_environment());
    let rendered = error.to_string();
    assert!(rendered.contains("OUT: starting"), "rendered: {rendered}");
    assert!(rendered.contains("ERR: boom"), "rendered: {rendered}");
}

#[test]
fn bootstrap_errors_keep_their_source_chain() {
    let error = InstanceError::from(BootstrapError::Spawn {
        program: String::from("initdb"),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    });

    let source = error.source().expect("bootstrap error exposes a source");
    assert!(source.downcast_ref::<std::io::Error>().is_some());
}
