use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{Backend, BackendError};
use crate::config::SessionConfig;
use crate::protocol::Response;

/// Spawns one helper process per session and talks to it with one JSON
/// line per call: `{"action","params"}` out, `{"success","data","error"}` back.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
}

pub struct ProcessHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessBackend {
    pub fn new(command: &[String]) -> Result<Self, BackendError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| BackendError::Init("no backend command configured".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn spawn(&self, config: &SessionConfig) -> Result<ProcessHandle, BackendError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("MINDMAPD_CHARTTYPE", &config.charttype)
            .env("MINDMAPD_TURBO_MODE", if config.turbo_mode { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BackendError::Init(format!("failed to spawn {}: {}", self.program, e)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::Init("backend process has no stdio pipes".into()));
        };

        debug!("Spawned backend process {} (pid {})", self.program, child.id());
        Ok(ProcessHandle {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl Backend for ProcessBackend {
    type Handle = ProcessHandle;

    fn name(&self) -> &'static str {
        "process"
    }

    fn startup(&self) -> Result<(), BackendError> {
        let check = self.spawn(&SessionConfig::default())?;
        self.release(check);
        info!("Backend command {} is runnable", self.program);
        Ok(())
    }

    fn init(&self, config: &SessionConfig) -> Result<ProcessHandle, BackendError> {
        self.spawn(config)
    }

    fn execute(
        &self,
        handle: &mut ProcessHandle,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        let mut line = serde_json::to_vec(&json!({ "action": action, "params": params }))
            .map_err(|e| BackendError::Call(format!("failed to encode backend request: {}", e)))?;
        line.push(b'\n');
        handle.stdin.write_all(&line)?;
        handle.stdin.flush()?;

        let mut reply = String::new();
        if handle.stdout.read_line(&mut reply)? == 0 {
            return Err(BackendError::Call("backend process exited".into()));
        }

        let response = Response::decode(reply.trim_end().as_bytes())
            .map_err(|e| BackendError::Call(format!("malformed backend reply: {}", e)))?;
        if response.success {
            Ok(response.data.unwrap_or_else(|| json!({})))
        } else {
            Err(BackendError::Call(
                response.error.unwrap_or_else(|| "backend reported a failure".to_string()),
            ))
        }
    }

    fn release(&self, handle: ProcessHandle) {
        let ProcessHandle { mut child, stdin, stdout } = handle;
        drop(stdin);
        drop(stdout);
        if let Err(e) = child.kill() {
            debug!("Backend process already gone: {}", e);
        }
        if let Err(e) = child.wait() {
            warn!("Failed to reap backend process: {}", e);
        }
    }
}
