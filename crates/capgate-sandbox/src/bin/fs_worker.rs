//! Minimal worker: reads one path through the broker
//!
//! Usage: capgate-fs-worker <path>
//!
//! Prints the `fs.read` result as JSON, then tries `fs.write` and prints
//! whether the capability object refused it.

use capgate_core::CapabilityError;
use capgate_sandbox::capabilities_from_env;
use serde_json::json;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: capgate-fs-worker <path>");
        return ExitCode::from(2);
    };

    let caps = match capabilities_from_env().await {
        Ok(caps) => caps,
        Err(e) => {
            eprintln!("capabilities unavailable: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match caps.call("fs", "read", json!({ "path": path })).await {
        Ok(result) => println!("{}", result),
        Err(e) => {
            eprintln!("fs.read failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    match caps.call("fs", "write", json!({ "path": path })).await {
        Err(CapabilityError::PermissionDenied { .. }) => println!("fs.write denied"),
        Ok(_) => println!("fs.write allowed"),
        Err(e) => {
            eprintln!("fs.write failed: {}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
