//! Subprocess/NDJSON backend adapter (§4.1, §4.10 "Claude-like"): the
//! broker spawns a local CLI, writes one JSON object per line to its
//! stdin, and reads one JSON object per line from its stdout.

use std::process::Stdio;

use async_trait::async_trait;
use broker_domain::{AdapterCapabilities, Availability, Error, Result, UnifiedMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::traits::{adapter_io_error, BackendAdapter, BackendHandle};
use crate::translators::claude_like::ClaudeLikeTranslator;
use crate::translators::Translator;

/// Non-JSON lines tolerated on stdout before the session is declared
/// broken — a misconfigured CLI writing logs to stdout shouldn't spin
/// the reader task forever.
const MAX_SKIP_LINES: usize = 1000;

pub struct SubprocessAdapter {
    name: String,
    command: String,
    args: Vec<String>,
    clock: fn() -> i64,
}

impl SubprocessAdapter {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>, clock: fn() -> i64) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            clock,
        }
    }
}

#[async_trait]
impl BackendAdapter for SubprocessAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
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
            .map_err(|e| adapter_io_error("spawning subprocess backend", e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::BackendUnavailable("subprocess stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::BackendUnavailable("subprocess stdout not piped".into()))?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<UnifiedMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<UnifiedMessage>>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let clock = self.clock;
        let session_key = session_key.to_string();

        tokio::spawn(async move {
            let mut stdin = stdin;
            let mut reader = BufReader::new(stdout);
            let mut writer_translator = ClaudeLikeTranslator::new(clock);
            let mut reader_translator = ClaudeLikeTranslator::new(clock);
            let mut skipped = 0usize;

            loop {
                let mut line = String::new();
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                let native = writer_translator.from_unified(&message);
                                let json = serde_json::to_string(&native).unwrap_or_default();
                                if stdin.write_all(json.as_bytes()).await.is_err()
                                    || stdin.write_all(b"\n").await.is_err()
                                    || stdin.flush().await.is_err()
                                {
                                    let _ = inbound_tx
                                        .send(Err(adapter_io_error("writing to subprocess stdin", "broken pipe")))
                                        .await;
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    bytes_read = reader.read_line(&mut line) => {
                        match bytes_read {
                            Ok(0) => {
                                tracing::info!(%session_key, "subprocess backend closed stdout");
                                break;
                            }
                            Ok(_) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                if !trimmed.starts_with('{') {
                                    skipped += 1;
                                    if skipped >= MAX_SKIP_LINES {
                                        let _ = inbound_tx
                                            .send(Err(Error::BackendUnavailable(
                                                "subprocess backend produced too many non-JSON lines".into(),
                                            )))
                                            .await;
                                        break;
                                    }
                                    continue;
                                }
                                match serde_json::from_str::<serde_json::Value>(trimmed) {
                                    Ok(value) => match reader_translator.to_unified(&value) {
                                        Ok(messages) => {
                                            for message in messages {
                                                if inbound_tx.send(Ok(message)).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                        Err(e) => {
                                            let _ = inbound_tx.send(Err(e)).await;
                                        }
                                    },
                                    Err(e) => {
                                        let _ = inbound_tx.send(Err(Error::Json(e))).await;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = inbound_tx.send(Err(adapter_io_error("reading subprocess stdout", e))).await;
                                break;
                            }
                        }
                    }
                }
            }

            let _ = stdin.shutdown().await;
            let pid = child.id();
            let exit_code = match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(?status, %session_key, "subprocess backend exited");
                    status.code()
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, %session_key, "error waiting for subprocess backend");
                    None
                }
                Err(_) => {
                    tracing::warn!(%session_key, "subprocess backend did not exit in time, killing");
                    let _ = child.kill().await;
                    None
                }
            };
            broker_domain::TraceEvent::ProcessExited {
                session_id: session_key.clone(),
                pid,
                code: exit_code,
            }
            .emit();
        });

        Ok(BackendHandle::new(outbound_tx, inbound_rx, shutdown_tx))
    }
}
