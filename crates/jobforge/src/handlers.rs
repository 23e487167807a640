//! A handful of illustrative handlers: a no-op, one that fails, one that
//! reports progress, and one that cooperates with cancellation. Registered
//! by the demo binary and reused by the end-to-end tests.

use std::thread;
use std::time::Duration;

use jobforge_worker::{ExecutionContext, HandlerError, HandlerRegistry};
use serde_json::Value;

pub const IDENTITY: &str = "identity";
pub const DIVIDE: &str = "divide";
pub const REPORT_PROGRESS: &str = "report_progress";
pub const CANCELLABLE_LOOP: &str = "cancellable_loop";
pub const SLEEP: &str = "sleep";

/// Register the example handlers used by the demo binary and the
/// end-to-end tests.
pub fn register_examples(registry: &mut HandlerRegistry) {
    registry.register(IDENTITY, identity);
    registry.register(DIVIDE, divide);
    registry.register(REPORT_PROGRESS, report_progress);
    registry.register(CANCELLABLE_LOOP, cancellable_loop);
    registry.register(SLEEP, sleep);
}

fn identity(_ctx: &ExecutionContext, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
    Ok(args)
}

/// Expects `args` to be `[numerator, denominator]`. Fails with a message
/// that mentions the division when the denominator is zero.
fn divide(_ctx: &ExecutionContext, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
    let pair = args.as_array().ok_or_else(|| HandlerError::failed("divide expects a [numerator, denominator] array"))?;
    let numerator = pair.first().and_then(Value::as_f64).unwrap_or(0.0);
    let denominator = pair.get(1).and_then(Value::as_f64).unwrap_or(0.0);
    if denominator == 0.0 {
        return Err(HandlerError::failed(format!("division by zero: {numerator} / {denominator}")));
    }
    Ok(Value::from(numerator / denominator))
}

/// Reports progress `0..total` with a short pause between steps. `args`
/// optionally carries the total step count (default 10).
fn report_progress(ctx: &ExecutionContext, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
    let total = args.as_u64().unwrap_or(10);
    for i in 0..=total {
        ctx.update_progress(i as f64, total as f64, Some("working"));
        thread::sleep(Duration::from_millis(20));
    }
    Ok(Value::from(total))
}

/// Loops, checking for cancellation each iteration, until either cancelled
/// or `args` iterations have elapsed (default 1000, i.e. "runs a while").
fn cancellable_loop(ctx: &ExecutionContext, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
    let iterations = args.as_u64().unwrap_or(1000);
    for _ in 0..iterations {
        ctx.check_for_cancel()?;
        thread::sleep(Duration::from_millis(20));
    }
    Ok(Value::from(iterations))
}

/// Sleeps for `args` milliseconds (default 200) without ever checking for
/// cancellation; used to exercise the non-cancellable scenario.
fn sleep(_ctx: &ExecutionContext, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
    let millis = args.as_u64().unwrap_or(200);
    thread::sleep(Duration::from_millis(millis));
    Ok(Value::Bool(true))
}
