//! A worker process that serves a small set of built-in modules.
//! It is used to try out the process worker manager end to end.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use spindle_common::config::AppConfig;
use spindle_execution::codec::{ErrorKind, RemoteError, Value};
use spindle_execution::worker::{Method, MethodOutput, ModuleDefinition, ModuleRegistry};
use spindle_telemetry::telemetry::{init_telemetry, shutdown_telemetry, ResourceOptions};

fn data(args: &[Value], index: usize) -> JsonValue {
    match args.get(index) {
        Some(Value::Data(x)) => x.clone(),
        _ => JsonValue::Null,
    }
}

fn demo_module() -> ModuleDefinition {
    ModuleDefinition::new()
        .with_method(
            "echo",
            Method::new(1, |args| MethodOutput::ready(data(&args, 0))),
        )
        .with_method(
            "add",
            Method::new(2, |args| {
                let sum = (0..args.len())
                    .map(|i| data(&args, i).as_f64())
                    .sum::<Option<f64>>();
                match sum {
                    Some(x) => MethodOutput::ready(json!(x)),
                    None => MethodOutput::error(RemoteError::new(
                        ErrorKind::Type,
                        "all arguments must be numbers",
                    )),
                }
            }),
        )
        .with_method(
            "fail",
            Method::new(1, |args| {
                let message = data(&args, 0).as_str().unwrap_or("failed").to_string();
                MethodOutput::error(RemoteError::new(ErrorKind::Type, message))
            }),
        )
        .with_method(
            "sleep",
            Method::new(1, |args| {
                let millis = data(&args, 0).as_u64().unwrap_or(0);
                MethodOutput::pending(async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(Value::Data(json!(millis)))
                })
            }),
        )
        .with_method(
            "pid",
            Method::new(0, |_| MethodOutput::ready(json!(std::process::id()))),
        )
        .with_method(
            "exit",
            Method::new(1, |args| {
                let code = data(&args, 0).as_i64().unwrap_or(1);
                std::process::exit(i32::try_from(code).unwrap_or(1))
            }),
        )
}

fn registry() -> ModuleRegistry {
    ModuleRegistry::new()
        .with_module("demo", demo_module())
        .with_factory("broken", || {
            Err(RemoteError::new(
                ErrorKind::Syntax,
                "unexpected token in module broken",
            ))
        })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let resource = ResourceOptions { kind: "worker" };
        init_telemetry(&config.telemetry, resource)
    })?;

    runtime.block_on(spindle_execution::run_worker(Arc::new(registry())))?;

    shutdown_telemetry();

    Ok(())
}
