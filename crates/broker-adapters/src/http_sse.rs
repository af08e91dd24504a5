//! HTTP/SSE backend adapter (§4.1, §4.10 "Codex/remote-like"): every
//! outbound message becomes one streaming POST to a remote endpoint;
//! the response body is framed as Server-Sent Events.

use async_trait::async_trait;
use broker_domain::{AdapterCapabilities, Availability, Error, Result, UnifiedMessage};
use tokio::sync::{mpsc, oneshot};

use crate::traits::{adapter_io_error, BackendAdapter, BackendHandle};
use crate::translators::sse_like::{drain_data_lines, SseLikeTranslator};

pub struct HttpSseAdapter {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
    clock: fn() -> i64,
}

impl HttpSseAdapter {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, api_key: Option<String>, clock: fn() -> i64) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key,
            client: reqwest::Client::new(),
            clock,
        }
    }
}

#[async_trait]
impl BackendAdapter for HttpSseAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: false,
            slash_commands: false,
            availability: Availability::Remote,
            teams: false,
        }
    }

    async fn start(&self, session_key: &str, _cwd: Option<&str>) -> Result<BackendHandle> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<UnifiedMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<UnifiedMessage>>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let clock = self.clock;
        let session_key = session_key.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    message = outbound_rx.recv() => match message {
                        Some(m) => m,
                        None => break,
                    },
                };

                let translator = SseLikeTranslator::new(clock);
                let mut request = client
                    .post(&endpoint)
                    .json(&serde_json::json!({
                        "stream": true,
                        "messages": [{ "role": "user", "content": message.all_text() }],
                    }));
                if let Some(key) = &api_key {
                    request = request.bearer_auth(key);
                }

                let response = match request.send().await {
                    Ok(resp) => resp,
                    Err(e) => {
                        let _ = inbound_tx
                            .send(Err(adapter_io_error("calling remote backend", e)))
                            .await;
                        continue;
                    }
                };

                if let Err(e) = stream_response(response, translator, &inbound_tx).await {
                    let _ = inbound_tx.send(Err(e)).await;
                }
            }
            tracing::info!(%session_key, "http/sse backend adapter shut down");
        });

        Ok(BackendHandle::new(outbound_tx, inbound_rx, shutdown_tx))
    }
}

async fn stream_response(
    mut response: reqwest::Response,
    mut translator: SseLikeTranslator,
    inbound_tx: &mpsc::Sender<Result<UnifiedMessage>>,
) -> Result<()> {
    let mut buffer = String::new();

    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for data in drain_data_lines(&mut buffer) {
                    for message in translator.parse_data_line(&data)? {
                        if inbound_tx.send(Ok(message)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            Ok(None) => {
                if !buffer.trim().is_empty() {
                    buffer.push_str("\n\n");
                    for data in drain_data_lines(&mut buffer) {
                        for message in translator.parse_data_line(&data)? {
                            let _ = inbound_tx.send(Ok(message)).await;
                        }
                    }
                }
                return Ok(());
            }
            Err(e) => return Err(Error::BackendUnavailable(format!("remote backend stream error: {e}"))),
        }
    }
}
