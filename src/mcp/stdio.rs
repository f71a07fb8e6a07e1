//! Newline-delimited JSON-RPC over stdin/stdout
//!
//! Each input line carries one message or batch. Responses are written as a single line and
//! flushed immediately; notifications produce no output.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::mcp::{rpc::json_rpc_error, server::handle_json_rpc_payload};
use crate::AppState;

pub async fn serve_stdio(state: AppState) -> std::io::Result<()> {
    info!("serving MCP over stdio");
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    serve_lines(&state, reader, writer).await
}

/// Runs until the reader reaches EOF or the shutdown token fires. Lines that are not UTF-8
/// or not JSON are answered with a parse error; only I/O failures end the loop early.
pub async fn serve_lines<R, W>(state: &AppState, mut reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let read = tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!("stdio transport stopping on shutdown");
                break;
            }
            read = reader.read_until(b'\n', &mut buffer) => read?,
        };

        if read == 0 {
            debug!("stdin closed");
            break;
        }

        let response = match std::str::from_utf8(&buffer) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match serde_json::from_str::<Value>(line.trim()) {
                Ok(payload) => handle_json_rpc_payload(state, payload).await,
                Err(_) => Some(json_rpc_error(None, -32700, "Parse error")),
            },
            Err(err) => {
                warn!(error = %err, "discarding stdin line that is not valid UTF-8");
                Some(json_rpc_error(None, -32700, "Parse error"))
            }
        };

        if let Some(response) = response {
            let mut encoded = response.to_string();
            encoded.push('\n');
            writer.write_all(encoded.as_bytes()).await?;
            writer.flush().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::serve_lines;
    use crate::testing::{state_with, MockUpstream};

    async fn run(input: &str) -> Vec<Value> {
        run_bytes(input.as_bytes()).await
    }

    async fn run_bytes(input: &[u8]) -> Vec<Value> {
        let state = state_with(Arc::new(MockUpstream::default()), None);
        let mut output = Vec::new();
        serve_lines(&state, input, &mut output)
            .await
            .expect("serve lines");

        String::from_utf8(output)
            .expect("utf8 output")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[tokio::test]
    async fn answers_each_request_on_its_own_line() {
        let responses = run(concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list","params":{}}"#,
            "\n",
        ))
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"], json!({}));
        assert_eq!(responses[1]["id"], 2);
        assert!(responses[1]["result"]["tools"].is_array());
    }

    #[tokio::test]
    async fn notifications_and_blank_lines_produce_no_output() {
        let responses = run(concat!(
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            "   \n",
        ))
        .await;

        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn malformed_line_yields_parse_error_and_continues() {
        let responses = run(concat!(
            "{oops\n",
            r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#,
            "\n",
        ))
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[1]["id"], 7);
    }

    #[tokio::test]
    async fn invalid_utf8_line_yields_parse_error_and_continues() {
        let mut input = b"\xff\xfe\n".to_vec();
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":8,"method":"ping"}"#);
        input.push(b'\n');

        let responses = run_bytes(&input).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[1]["id"], 8);
        assert_eq!(responses[1]["result"], json!({}));
    }

    #[tokio::test]
    async fn final_line_without_newline_is_answered() {
        let responses = run(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 3);
    }

    #[tokio::test]
    async fn stops_when_shutdown_is_cancelled() {
        let state = state_with(Arc::new(MockUpstream::default()), None);
        state.shutdown.cancel();
        let (reader, _writer_side) = tokio::io::duplex(64);
        let mut output = Vec::new();

        serve_lines(&state, tokio::io::BufReader::new(reader), &mut output)
            .await
            .expect("serve lines");
        assert!(output.is_empty());
    }
}
