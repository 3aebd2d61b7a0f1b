//! Line-delimited JSON stdio framing (spec §6). One JSON object per line in
//! both directions; the process terminates cleanly when stdin closes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::dispatcher::Dispatcher;

#[derive(Debug, Deserialize)]
struct Request {
    tool: String,
    args: Value,
    id: String,
}

#[derive(Debug, Serialize)]
struct Response {
    id: String,
    #[serde(flatten)]
    body: crate::dispatcher::ToolResponse,
}

/// Reads newline-delimited JSON requests from `input` and writes responses
/// to `output` until `input` reaches EOF. Each request is dispatched as its
/// own task so a slow tool call never blocks the next request's read.
pub async fn serve<R, W>(dispatcher: std::sync::Arc<Dispatcher>, input: R, mut output: W) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(input).lines();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(256);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if output.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if output.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = output.flush().await;
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let tx = tx.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let response = handle_line(&dispatcher, &line).await;
            let serialized = serde_json::to_string(&response).unwrap_or_else(|e| {
                format!(r#"{{"id":"unknown","ok":false,"error":{{"kind":"internal","message":"{e}"}}}}"#)
            });
            let _ = tx.send(serialized).await;
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_line(dispatcher: &Dispatcher, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return Response {
                id: "unknown".to_string(),
                body: crate::dispatcher::ToolResponse {
                    ok: false,
                    result: None,
                    error: Some(crate::error::ErrorEnvelope {
                        kind: crate::error::ErrorKind::ConfigError,
                        message: format!("malformed request: {e}"),
                        host: None,
                    }),
                },
            };
        }
    };

    let body = dispatcher.dispatch(&request.tool, request.args).await;
    Response { id: request.id, body }
}
