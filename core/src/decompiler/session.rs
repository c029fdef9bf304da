//! Owned session against the external disassembler process.
//!
//! The child is spawned in quiet pipe mode (`-q0`): commands go in on
//! stdin, each response comes back NUL-terminated on stdout. A single
//! writer task owns both ends; callers talk to it over a channel, so
//! commands are naturally serialized. A command timeout desynchronizes the
//! pipe, so it poisons the session: the child is killed and later commands
//! fail fast.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::DecompilerSettings;

#[derive(Debug, Error)]
pub enum DecompilerError {
    #[error("disassembler unavailable: {0}")]
    Unavailable(String),
    #[error("command {command:?} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("command {command:?} produced unparseable output: {message}")]
    Parse { command: String, message: String },
    #[error("session is closed")]
    Closed,
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("analysis soft-timeout at depth {}", depth.as_str())]
    AnalysisTimeout { depth: crate::model::AnalysisDepth },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Busy,
    Error,
    Closed,
}

struct Request {
    command: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<String, DecompilerError>>,
}

pub struct DecompilerSession {
    tx: std::sync::Mutex<Option<mpsc::Sender<Request>>>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
    state: Arc<std::sync::Mutex<SessionState>>,
    settings: DecompilerSettings,
    json_cache: Mutex<HashMap<String, Value>>,
    /// Temp file owned by this session, removed on close.
    temp_path: Option<PathBuf>,
}

impl DecompilerSession {
    /// Spawn the disassembler against `file_path` and wait for its startup
    /// banner. Fails with `Unavailable` when the binary cannot be spawned
    /// or does not speak the pipe protocol.
    pub async fn open(
        settings: &DecompilerSettings,
        file_path: &Path,
    ) -> Result<Self, DecompilerError> {
        Self::open_with_temp(settings, file_path, None).await
    }

    pub async fn open_with_temp(
        settings: &DecompilerSettings,
        file_path: &Path,
        temp_path: Option<PathBuf>,
    ) -> Result<Self, DecompilerError> {
        let mut child = Command::new(&settings.binary)
            .arg("-q0")
            .arg("-2")
            .arg(file_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| DecompilerError::Unavailable(format!("spawn failed: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DecompilerError::Unavailable("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DecompilerError::Unavailable("child stdout not captured".into()))?;
        let mut reader = BufReader::new(stdout);

        // The process emits one NUL once the binary is loaded.
        let mut banner = Vec::new();
        let startup = Duration::from_secs(settings.command_timeout_secs);
        tokio::time::timeout(startup, reader.read_until(0, &mut banner))
            .await
            .map_err(|_| DecompilerError::Unavailable("no startup banner before timeout".into()))?
            .map_err(|err| DecompilerError::Unavailable(format!("banner read failed: {err}")))?;

        let state = Arc::new(std::sync::Mutex::new(SessionState::Ready));
        let (tx, rx) = mpsc::channel::<Request>(8);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(command_loop(child, stdin, reader, rx, state.clone(), done_tx));

        Ok(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            done: Mutex::new(Some(done_rx)),
            state,
            settings: settings.clone(),
            json_cache: Mutex::new(HashMap::new()),
            temp_path,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue one command and return its raw text output.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<String, DecompilerError> {
        if self.state() != SessionState::Ready {
            return Err(DecompilerError::Closed);
        }

        let sender = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(DecompilerError::Closed);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request {
                command: command.to_string(),
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DecompilerError::Closed)?;

        reply_rx.await.map_err(|_| DecompilerError::Closed)?
    }

    /// Issue a JSON-producing command, retrying transient parse failures
    /// and timeouts with exponential backoff.
    pub async fn run_json(&self, command: &str, timeout: Duration) -> Result<Value, DecompilerError> {
        let mut attempt: u32 = 0;
        loop {
            match self.run_json_once(command, timeout).await {
                Ok(value) => return Ok(value),
                Err(err @ DecompilerError::Parse { .. }) => {
                    attempt += 1;
                    if attempt > self.settings.max_retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_millis(100 * (1 << attempt.min(6)));
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// As [`run_json`], with a per-session result cache keyed by command.
    pub async fn run_json_cached(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Value, DecompilerError> {
        if let Some(value) = self.json_cache.lock().await.get(command) {
            return Ok(value.clone());
        }
        let value = self.run_json(command, timeout).await?;
        self.json_cache
            .lock()
            .await
            .insert(command.to_string(), value.clone());
        Ok(value)
    }

    async fn run_json_once(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Value, DecompilerError> {
        let raw = self.run(command, timeout).await?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            // Empty output decodes as an empty collection for list commands.
            return Ok(Value::Array(Vec::new()));
        }
        serde_json::from_str(trimmed).map_err(|err| DecompilerError::Parse {
            command: command.to_string(),
            message: err.to_string(),
        })
    }

    /// Terminate the child and remove the session temp file. Safe to call
    /// more than once; the first call does the work.
    pub async fn close(&self) {
        let already_closed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let was = *state == SessionState::Closed;
            *state = SessionState::Closed;
            was
        };

        // Dropping the sender ends the command loop, which kills and reaps
        // the child; the done channel confirms it.
        {
            let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }
        if !already_closed {
            if let Some(done) = self.done.lock().await.take() {
                let _ = done.await;
            }
        }

        if let Some(path) = &self.temp_path {
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "temp file removal failed");
                }
            }
        }
    }
}

impl Drop for DecompilerSession {
    fn drop(&mut self) {
        // kill_on_drop on the child covers the process; the temp file gets a
        // best-effort synchronous removal.
        if let Some(path) = self.temp_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn command_loop(
    mut child: Child,
    mut stdin: tokio::process::ChildStdin,
    mut reader: BufReader<tokio::process::ChildStdout>,
    mut rx: mpsc::Receiver<Request>,
    state: Arc<std::sync::Mutex<SessionState>>,
    done: oneshot::Sender<()>,
) {
    while let Some(request) = rx.recv().await {
        {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            if *guard == SessionState::Closed || *guard == SessionState::Error {
                let _ = request.reply.send(Err(DecompilerError::Closed));
                continue;
            }
            *guard = SessionState::Busy;
        }

        let outcome = execute(&mut stdin, &mut reader, &request.command, request.timeout).await;

        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &outcome {
            // A timeout leaves an unread response in the pipe; the session
            // cannot be trusted afterwards.
            Err(DecompilerError::CommandTimeout { .. }) | Err(DecompilerError::Unavailable(_)) => {
                *guard = SessionState::Error;
                let _ = child.start_kill();
            }
            _ => {
                if *guard == SessionState::Busy {
                    *guard = SessionState::Ready;
                }
            }
        }
        drop(guard);

        let _ = request.reply.send(outcome);
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    {
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        *guard = SessionState::Closed;
    }
    let _ = done.send(());
}

async fn execute(
    stdin: &mut tokio::process::ChildStdin,
    reader: &mut BufReader<tokio::process::ChildStdout>,
    command: &str,
    timeout: Duration,
) -> Result<String, DecompilerError> {
    let line = format!("{command}\n");
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|err| DecompilerError::Unavailable(format!("stdin write failed: {err}")))?;
    stdin
        .flush()
        .await
        .map_err(|err| DecompilerError::Unavailable(format!("stdin flush failed: {err}")))?;

    let mut output = Vec::new();
    let read = tokio::time::timeout(timeout, reader.read_until(0, &mut output))
        .await
        .map_err(|_| DecompilerError::CommandTimeout {
            command: command.to_string(),
            timeout,
        })?
        .map_err(|err| DecompilerError::Unavailable(format!("stdout read failed: {err}")))?;

    if read == 0 {
        return Err(DecompilerError::Unavailable("disassembler closed the pipe".into()));
    }

    if output.last() == Some(&0) {
        output.pop();
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn settings_for(binary: &str) -> DecompilerSettings {
        DecompilerSettings {
            binary: binary.into(),
            command_timeout_secs: 5,
            max_retries: 2,
        }
    }

    /// A stand-in disassembler: replies to every line with a fixed
    /// NUL-terminated payload, preceded by the startup NUL.
    fn fake_pipe_script(dir: &Path, reply: &str) -> PathBuf {
        let path = dir.join("fake-r2.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "printf '\\0'").unwrap();
        writeln!(file, "while IFS= read -r _line; do").unwrap();
        writeln!(file, "  printf '%s\\0' '{reply}'").unwrap();
        writeln!(file, "done").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn session_round_trips_commands() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_pipe_script(dir.path(), "4.2.1");
        let target = dir.path().join("target.bin");
        std::fs::write(&target, b"MZ").unwrap();

        let session = DecompilerSession::open(
            &settings_for(script.to_str().unwrap()),
            &target,
        )
        .await
        .unwrap();

        let version = session.run("?V", Duration::from_secs(2)).await.unwrap();
        assert_eq!(version.trim(), "4.2.1");
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn json_commands_parse_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_pipe_script(dir.path(), r#"[{"name":"main","offset":4096,"size":32}]"#);
        let target = dir.path().join("target.bin");
        std::fs::write(&target, b"\x7fELF").unwrap();

        let session = DecompilerSession::open(
            &settings_for(script.to_str().unwrap()),
            &target,
        )
        .await
        .unwrap();

        let value = session
            .run_json_cached("aflj", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value[0]["name"], "main");

        let again = session
            .run_json_cached("aflj", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, again);
        session.close().await;
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.bin");
        std::fs::write(&target, b"MZ").unwrap();

        let result = DecompilerSession::open(
            &settings_for("/nonexistent/disassembler"),
            &target,
        )
        .await;
        assert!(matches!(result, Err(DecompilerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn commands_after_close_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_pipe_script(dir.path(), "ok");
        let target = dir.path().join("target.bin");
        std::fs::write(&target, b"MZ").unwrap();

        let session = DecompilerSession::open(
            &settings_for(script.to_str().unwrap()),
            &target,
        )
        .await
        .unwrap();
        session.close().await;

        let result = session.run("i", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DecompilerError::Closed)));
    }

    #[tokio::test]
    async fn temp_file_is_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_pipe_script(dir.path(), "ok");
        let blob = dir.path().join("upload.bin");
        std::fs::write(&blob, b"MZ payload").unwrap();

        let session = DecompilerSession::open_with_temp(
            &settings_for(script.to_str().unwrap()),
            &blob,
            Some(blob.clone()),
        )
        .await
        .unwrap();

        assert!(blob.exists());
        session.close().await;
        assert!(!blob.exists());
    }
}
