//! Process-spawn-and-listen backend adapter (§4.1, §4.10 "Gemini-like"):
//! the broker spawns a local process and waits for it to announce
//! readiness on stdout before treating the session as usable. Unlike
//! [`crate::subprocess::SubprocessAdapter`], a backend that never becomes
//! ready within the startup window is a hard failure rather than something
//! the reader loop discovers lazily.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use broker_domain::{config::timeouts, AdapterCapabilities, Availability, Error, Result, UnifiedMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::traits::{adapter_io_error, BackendAdapter, BackendHandle};
use crate::translators::claude_like::ClaudeLikeTranslator;
use crate::translators::Translator;

pub struct ProcessListenAdapter {
    name: String,
    command: String,
    args: Vec<String>,
    startup_timeout: Duration,
    clock: fn() -> i64,
}

impl ProcessListenAdapter {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>, clock: fn() -> i64) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            startup_timeout: Duration::from_millis(timeouts::PROCESS_STARTUP_MS),
            clock,
        }
    }
}

#[async_trait]
impl BackendAdapter for ProcessListenAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn start(&self, session_key: &str, cwd: Option<&str>) -> Result<BackendHandle> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| adapter_io_error("spawning process-listen backend", e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::BackendUnavailable("process stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::BackendUnavailable("process stdout not piped".into()))?;
        let mut reader = BufReader::new(stdout);

        if let Err(e) = wait_for_ready(&mut reader, self.startup_timeout).await {
            let _ = child.start_kill();
            return Err(e);
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<UnifiedMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<UnifiedMessage>>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let clock = self.clock;
        let session_key = session_key.to_string();

        tokio::spawn(async move {
            let mut stdin = stdin;
            let mut writer_translator = ClaudeLikeTranslator::new(clock);
            let mut reader_translator = ClaudeLikeTranslator::new(clock);

            loop {
                let mut line = String::new();
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                let native = writer_translator.from_unified(&message);
                                let json = serde_json::to_string(&native).unwrap_or_default();
                                if stdin.write_all(json.as_bytes()).await.is_err()
                                    || stdin.write_all(b"\n").await.is_err()
                                    || stdin.flush().await.is_err()
                                {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    bytes_read = reader.read_line(&mut line) => {
                        match bytes_read {
                            Ok(0) => break,
                            Ok(_) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() || !trimmed.starts_with('{') {
                                    continue;
                                }
                                if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                                    if let Ok(messages) = reader_translator.to_unified(&value) {
                                        for message in messages {
                                            if inbound_tx.send(Ok(message)).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = inbound_tx.send(Err(adapter_io_error("reading process stdout", e))).await;
                                break;
                            }
                        }
                    }
                }
            }

            let _ = stdin.shutdown().await;
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
            tracing::info!(%session_key, "process-listen backend adapter shut down");
        });

        Ok(BackendHandle::new(outbound_tx, inbound_rx, shutdown_tx))
    }
}

/// Block until a `{"type":"ready"}` frame appears on stdout, or the
/// startup timeout elapses (§4.1, §5 "process startup timeout").
async fn wait_for_ready(
    reader: &mut BufReader<tokio::process::ChildStdout>,
    startup_timeout: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| adapter_io_error("waiting for process readiness", e))?;
            if n == 0 {
                return Err(Error::BackendUnavailable(
                    "process exited before signaling readiness".into(),
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if value.get("type").and_then(serde_json::Value::as_str) == Some("ready") {
                    return Ok(());
                }
            }
        }
    };

    match tokio::time::timeout(startup_timeout, wait).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(
            "process did not signal readiness within startup timeout".into(),
        )),
    }
}
