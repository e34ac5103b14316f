//! The stdio↔HTTP bridge: one line of JSON-RPC in on stdin, one line out on
//! stdout, each forwarded to a remote `POST /mcp` endpoint with injected
//! auth headers. No JSON-RPC parsing happens here beyond pulling `id` out
//! of a request well enough to stamp a synthetic error response when the
//! upstream call itself fails — everything else is forwarded verbatim, so
//! this process never needs to agree with the server on the full method
//! table.

use std::time::Duration;

use reqwest::{header::HeaderValue, Client};
use serde_json::Value;

/// Read once at process start, then attached to every request this process
/// forwards.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub subscription_key: String,
    pub upstream_api_key: Option<String>,
    pub upstream_api_secret: Option<String>,
}

impl Credentials {
    /// Reads `USER_EMAIL` / `SUBSCRIPTION_KEY` (required) and the optional
    /// `UPSTREAM_API_KEY` / `UPSTREAM_API_SECRET` pass-through pair.
    pub fn from_env() -> Result<Self, BridgeError> {
        let email = std::env::var("USER_EMAIL").map_err(|_| BridgeError::MissingEnv("USER_EMAIL"))?;
        let subscription_key =
            std::env::var("SUBSCRIPTION_KEY").map_err(|_| BridgeError::MissingEnv("SUBSCRIPTION_KEY"))?;
        Ok(Self {
            email,
            subscription_key,
            upstream_api_key: std::env::var("UPSTREAM_API_KEY").ok(),
            upstream_api_secret: std::env::var("UPSTREAM_API_SECRET").ok(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the client once; a fresh client reuses one connection pool across
/// every line this process forwards for the lifetime of the session.
pub fn build_client(timeout: Duration) -> Result<Client, BridgeError> {
    Client::builder().timeout(timeout).build().map_err(BridgeError::ClientBuild)
}

/// Posts one line verbatim to `endpoint`, with credentials injected as
/// headers, and returns the response body verbatim. Never parses the line
/// as JSON beyond what [`forward_line`]'s caller already extracted for the
/// failure path — a malformed line is the remote server's problem to
/// reject, not this process's.
async fn post_line(client: &Client, endpoint: &str, creds: &Credentials, line: &str) -> Result<String, reqwest::Error> {
    let mut request = client
        .post(endpoint)
        .header("content-type", "application/json")
        .header("x-user-email", header_value(&creds.email))
        .header("x-subscription-key", header_value(&creds.subscription_key))
        .body(line.to_string());

    if let Some(key) = &creds.upstream_api_key {
        request = request.header("x-upstream-api-key", header_value(key));
    }
    if let Some(secret) = &creds.upstream_api_secret {
        request = request.header("x-upstream-api-secret", header_value(secret));
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if status.is_server_error() {
        // A 5xx is the caller's cue to synthesize a JSON-RPC error; return
        // the body text as the error context rather than swallowing it.
        return Ok(synthetic_error_body(None, &format!("upstream returned {status}: {}", truncate(&body, 200))));
    }

    Ok(body)
}

fn header_value(value: &str) -> HeaderValue {
    // Header values from USER_EMAIL/SUBSCRIPTION_KEY are operator-controlled
    // config, not untrusted client input; an invalid value here is a
    // startup-time configuration error, not a request-time one.
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Best-effort extraction of the JSON-RPC `id` from a raw input line, used
/// only to stamp a synthetic error response when the line itself couldn't
/// be forwarded (transport failure, not a parse failure — a parse failure
/// is the remote server's job to report).
fn extract_id(line: &str) -> Option<Value> {
    serde_json::from_str::<Value>(line).ok().and_then(|v| v.get("id").cloned())
}

fn synthetic_error_body(id: Option<Value>, message: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32000, "message": message },
    })
    .to_string()
}

/// Forwards one stdin line, returning the stdout line to write. Transport
/// failures (connect/timeout/non-JSON 5xx body) are translated into a
/// JSON-RPC error response carrying the original request's `id`, so the
/// local peer always sees well-formed framing even when the network isn't
/// cooperating.
pub async fn forward_line(client: &Client, endpoint: &str, creds: &Credentials, line: &str) -> String {
    match post_line(client, endpoint, creds, line).await {
        Ok(body) => body,
        Err(e) => {
            let id = extract_id(line);
            let reason = if e.is_timeout() {
                "upstream request timed out".to_string()
            } else if e.is_connect() {
                "failed to reach upstream endpoint".to_string()
            } else {
                "upstream request failed".to_string()
            };
            tracing::warn!(error = %e, "bridge request failed, synthesizing error response");
            synthetic_error_body(id, &reason)
        }
    }
}

/// Runs the read-forward-write loop until stdin hits EOF. Lines are
/// processed one at a time — each stdout line is flushed before the next
/// stdin line is read — so per-connection order is always request order,
/// with no reordering possible even under retries.
pub async fn run(
    client: Client,
    endpoint: String,
    creds: Credentials,
    stdin: impl tokio::io::AsyncBufRead + Unpin,
    mut stdout: impl tokio::io::AsyncWrite + Unpin,
) -> Result<(), BridgeError> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = forward_line(&client, &endpoint, &creds, &line).await;
        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds() -> Credentials {
        Credentials {
            email: "user@example.com".into(),
            subscription_key: "fm_sub_abcdefgh12345678".into(),
            upstream_api_key: None,
            upstream_api_secret: None,
        }
    }

    #[tokio::test]
    async fn forwards_body_verbatim_and_injects_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("x-user-email", "user@example.com"))
            .and(header("x-subscription-key", "fm_sub_abcdefgh12345678"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#))
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let endpoint = format!("{}/mcp", server.uri());
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let response = forward_line(&client, &endpoint, &creds(), line).await;

        assert_eq!(response, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
    }

    #[tokio::test]
    async fn connect_failure_yields_a_jsonrpc_error_with_the_original_id() {
        let client = build_client(Duration::from_millis(200)).unwrap();
        let line = r#"{"jsonrpc":"2.0","id":"a1","method":"ping"}"#;
        let response = forward_line(&client, "http://127.0.0.1:1/mcp", &creds(), line).await;

        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["id"], "a1");
        assert_eq!(parsed["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn server_5xx_is_translated_not_forwarded_raw() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let endpoint = format!("{}/mcp", server.uri());
        let line = r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#;
        let response = forward_line(&client, &endpoint, &creds(), line).await;

        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["error"]["code"], -32000);
        assert!(parsed["error"]["message"].as_str().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn three_lines_in_quick_succession_preserve_order_and_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/mcp")).respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200)
                .set_body_string(serde_json::json!({"jsonrpc":"2.0","id":body["id"],"result":{}}).to_string())
        }).mount(&server).await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let endpoint = format!("{}/mcp", server.uri());
        let lines = [
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#,
        ];

        let mut ids = Vec::new();
        for line in lines {
            let response = forward_line(&client, &endpoint, &creds(), line).await;
            let parsed: Value = serde_json::from_str(&response).unwrap();
            ids.push(parsed["id"].as_i64().unwrap());
        }

        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn extract_id_reads_the_id_field_without_full_validation() {
        assert_eq!(extract_id(r#"{"id":7,"method":"x"}"#), Some(Value::from(7)));
        assert_eq!(extract_id("not json"), None);
        assert_eq!(extract_id(r#"{"method":"x"}"#), None);
    }

    #[test]
    fn credentials_from_env_requires_both_core_variables() {
        // SAFETY-equivalent: tests run single-threaded per-process env
        // mutation is the conventional pattern for this kind of test in
        // this crate; no other test in this module reads these names.
        std::env::remove_var("USER_EMAIL");
        std::env::remove_var("SUBSCRIPTION_KEY");
        assert!(matches!(Credentials::from_env(), Err(BridgeError::MissingEnv("USER_EMAIL"))));

        std::env::set_var("USER_EMAIL", "a@b.com");
        assert!(matches!(Credentials::from_env(), Err(BridgeError::MissingEnv("SUBSCRIPTION_KEY"))));

        std::env::set_var("SUBSCRIPTION_KEY", "fm_sub_abcdefgh");
        let creds = Credentials::from_env().unwrap();
        assert_eq!(creds.email, "a@b.com");

        std::env::remove_var("USER_EMAIL");
        std::env::remove_var("SUBSCRIPTION_KEY");
    }
}
