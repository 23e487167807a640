//! The PROCESS-mode worker child process.
//!
//! A `PROCESS` worker pool re-invokes the host binary with a hidden
//! subprocess flag. The child reads one framed [`Message::StartJob`] off
//! stdin, looks the handler up by id in its own `HandlerRegistry`, and
//! frames `Progress`/`Result`/`Error` back on stdout as it runs. A second
//! thread keeps reading stdin for a `Cancel` frame so the parent can still
//! request cooperative cancellation after the job has started.

use std::io::{self, Read, Write};
use std::sync::Arc;

use jobforge_protocol::{pack_frame, Header, Message, OpCode, HEADER_SIZE};
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::context::{ExecutionContext, ProgressSink};
use crate::error::HandlerError;
use crate::framing::{ErrorPayload, ProgressPayload};
use crate::registry::HandlerRegistry;

/// The hidden CLI flag that tells the host binary's `main()` to run as a
/// PROCESS-mode worker child instead of its normal entry point.
pub const SUBPROCESS_FLAG: &str = "--jobforge-subprocess-worker";

struct StdoutProgressSink {
    stdout: std::sync::Mutex<io::Stdout>,
}

impl ProgressSink for StdoutProgressSink {
    fn report(&self, progress: f64, total_progress: f64, stage: Option<String>) {
        let payload = ProgressPayload { progress, total_progress, stage };
        if let Ok(frame) = pack_frame(OpCode::Progress, &payload) {
            let mut stdout = self.stdout.lock().expect("stdout lock poisoned");
            let _ = stdout.write_all(&frame);
            let _ = stdout.flush();
        }
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<(OpCode, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf)?;
    let header = Header::unpack(&header_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload)?;
    Ok((header.opcode, payload))
}

/// Never returns under normal operation: it always terminates the process.
/// Call this from `main()` as soon as the hidden subprocess flag is
/// detected, before any other engine machinery is constructed.
pub fn run_subprocess_entrypoint(registry: &HandlerRegistry) -> ! {
    let mut stdin = io::stdin();
    let exit_code = match read_frame(&mut stdin) {
        Ok((OpCode::Start, payload)) => match unpack_start(&payload) {
            Ok(start) => run_job(registry, start),
            Err(e) => {
                eprintln!("jobforge subprocess: malformed start frame: {e}");
                2
            }
        },
        Ok((other, _)) => {
            eprintln!("jobforge subprocess: expected START frame, got {other:?}");
            2
        }
        Err(e) => {
            eprintln!("jobforge subprocess: failed to read start frame: {e}");
            2
        }
    };
    std::process::exit(exit_code);
}

struct StartJobArgs {
    handler: String,
    args: Value,
    kwargs: Value,
    track_progress: bool,
    cancellable: bool,
}

fn unpack_start(payload: &[u8]) -> Result<StartJobArgs, jobforge_protocol::ProtocolError> {
    let message: Message = serde_json::from_slice(payload)?;
    match message {
        Message::StartJob { handler, args, kwargs, track_progress, cancellable, .. } => {
            Ok(StartJobArgs { handler, args, kwargs, track_progress, cancellable })
        }
        _other => Err(jobforge_protocol::ProtocolError::UnexpectedVariant(
            "expected StartJob as the first subprocess frame",
        )),
    }
}

fn run_job(registry: &HandlerRegistry, start: StartJobArgs) -> i32 {
    let Some(handler) = registry.get(&start.handler) else {
        write_error(&format!("no handler registered with id {:?}", start.handler), "", false);
        return 1;
    };

    let cancel = CancellationToken::new();
    spawn_cancel_listener(cancel.clone());

    let sink = Arc::new(StdoutProgressSink { stdout: std::sync::Mutex::new(io::stdout()) });
    let ctx = ExecutionContext::new(
        jobforge_protocol::JobId::new(),
        start.track_progress,
        start.cancellable,
        cancel,
        sink,
    );

    match handler(&ctx, start.args, start.kwargs) {
        Ok(value) => {
            if let Ok(frame) = pack_frame(OpCode::Result, &value) {
                let _ = io::stdout().write_all(&frame);
                let _ = io::stdout().flush();
            }
            0
        }
        Err(HandlerError::Cancelled) => {
            write_error("job was cancelled", "", true);
            0
        }
        Err(HandlerError::Failed { message, traceback }) => {
            write_error(&message, &traceback, false);
            1
        }
    }
}

fn write_error(message: &str, traceback: &str, cancelled: bool) {
    let payload = ErrorPayload {
        message: message.to_string(),
        traceback: traceback.to_string(),
        cancelled,
    };
    if let Ok(frame) = pack_frame(OpCode::Error, &payload) {
        let _ = io::stdout().write_all(&frame);
        let _ = io::stdout().flush();
    }
}

/// Spawn a background thread that keeps reading stdin for a `Cancel` frame
/// sent by the parent after the job has started, and sets `cancel` once one
/// arrives. Runs for the lifetime of the process; EOF just lets it exit.
fn spawn_cancel_listener(cancel: CancellationToken) {
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        loop {
            match read_frame(&mut stdin) {
                Ok((OpCode::Cancel, _)) => cancel.cancel(),
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });
}
