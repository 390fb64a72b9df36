use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::errors::{HarnessError, HarnessResult};

/// Port of the control server inside the VM.
pub const SERVER_PORT: u16 = 5000;
/// Uniform timeout for every controller request.
pub const HOMO_TIMEOUT_SECS: u64 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Json(Value),
    /// Sent as-is; still labelled JSON like every POST.
    Raw(String),
    /// URL-encoded form fields.
    Form(Vec<(String, String)>),
}

/// Method, optional port and path of one controller request, plus its body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub port: Option<u16>,
    pub path: String,
    pub payload: Payload,
    /// Keep a JSON `error` field in the reply instead of failing on it.
    pub tolerate_embedded_error: bool,
}

fn query_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(GET|POST)(:\d+)?(.+)$").expect("static regex"))
}

impl FromStr for RequestSpec {
    type Err = HarnessError;

    /// `"POST:5000/setup/execute"` or `"GET/vars"`.
    fn from_str(query: &str) -> Result<Self, Self::Err> {
        let caps = query_regex()
            .captures(query.trim())
            .ok_or_else(|| HarnessError::Controller(format!("bad request query: {query}")))?;
        let method = if &caps[1] == "GET" { Method::Get } else { Method::Post };
        let port = caps
            .get(2)
            .map(|p| p.as_str()[1..].parse::<u16>())
            .transpose()
            .map_err(|e| HarnessError::Controller(format!("bad port in {query}: {e}")))?;
        Ok(Self {
            method,
            port,
            path: caps[3].to_string(),
            payload: Payload::Empty,
            tolerate_embedded_error: false,
        })
    }
}

impl RequestSpec {
    pub fn json(mut self, body: Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    pub fn raw(mut self, body: impl Into<String>) -> Self {
        self.payload = Payload::Raw(body.into());
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.payload = Payload::Form(fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        self
    }

    pub fn tolerate_embedded_error(mut self) -> Self {
        self.tolerate_embedded_error = true;
        self
    }

    pub fn url(&self, host: &str, default_port: u16) -> String {
        format!("http://{}:{}{}", host, self.port.unwrap_or(default_port), self.path)
    }
}

/// Body of a successful reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn json(&self) -> HarnessResult<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A failure reported inside a 200 reply: a non-null `error` or
/// `"status": "error"`.
pub fn embedded_error(body: &[u8]) -> Option<String> {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
        return None;
    };
    match map.get("error") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s.is_empty() => {}
        Some(Value::Bool(false)) => {}
        Some(Value::String(s)) => return Some(s.clone()),
        Some(other) => return Some(other.to_string()),
    }
    match map.get("status").and_then(Value::as_str) {
        Some(s) if s.eq_ignore_ascii_case("error") => Some(
            map.get("message")
                .and_then(Value::as_str)
                .unwrap_or("status: error")
                .to_string(),
        ),
        _ => None,
    }
}

/// One host, one default port, one timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    host: String,
    default_port: u16,
    timeout_secs: u64,
}

impl HttpTransport {
    pub fn new(host: impl Into<String>, default_port: u16, timeout_secs: u64) -> HarnessResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            host: host.into(),
            default_port,
            timeout_secs,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Sends one request. Transport errors, timeouts, non-2xx statuses and
    /// embedded error payloads all come back as `Err`.
    pub async fn send(&self, spec: &RequestSpec) -> HarnessResult<Reply> {
        let url = spec.url(&self.host, self.default_port);
        tracing::debug!(url = %url, method = ?spec.method, "controller request");

        let builder = match (spec.method, &spec.payload) {
            (Method::Get, _) => self.client.get(&url),
            // reqwest sets the form content type itself
            (Method::Post, Payload::Form(_)) => self.client.post(&url),
            (Method::Post, _) => self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json"),
        };
        let builder = match &spec.payload {
            Payload::Empty => builder,
            Payload::Json(body) => builder.body(serde_json::to_vec(body)?),
            Payload::Raw(body) => builder.body(body.clone()),
            Payload::Form(fields) => builder.form(fields),
        };

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.classify(e))?.to_vec();

        if !status.is_success() {
            tracing::warn!(url = %url, status = status.as_u16(), "controller request failed");
            return Err(HarnessError::Controller(format!(
                "{} returned {}: {}",
                spec.path,
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        if !spec.tolerate_embedded_error {
            if let Some(err) = embedded_error(&body) {
                tracing::warn!(url = %url, error = %err, "controller reported an error");
                return Err(HarnessError::Controller(format!("{}: {}", spec.path, err)));
            }
        }
        Ok(Reply { status: status.as_u16(), body })
    }

    fn classify(&self, err: reqwest::Error) -> HarnessError {
        if err.is_timeout() {
            HarnessError::Timeout(self.timeout_secs)
        } else {
            HarnessError::Http(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_strings_parse() {
        let spec: RequestSpec = "POST:5000/chimerax/run".parse().unwrap();
        assert_eq!(spec.method, Method::Post);
        assert_eq!(spec.port, Some(5000));
        assert_eq!(spec.path, "/chimerax/run");

        let spec: RequestSpec = "GET/vars".parse().unwrap();
        assert_eq!((spec.method, spec.port), (Method::Get, None));
        assert_eq!(spec.url("10.0.0.2", 8000), "http://10.0.0.2:8000/vars");

        assert!("PUT/x".parse::<RequestSpec>().is_err());
        assert!("POST:99999/x".parse::<RequestSpec>().is_err());
    }

    #[test]
    fn embedded_errors_are_detected() {
        assert_eq!(embedded_error(br#"{"error": "boom"}"#).as_deref(), Some("boom"));
        assert_eq!(
            embedded_error(br#"{"status": "error", "message": "no such file"}"#).as_deref(),
            Some("no such file")
        );
        assert_eq!(embedded_error(br#"{"error": null, "status": "success"}"#), None);
        assert_eq!(embedded_error(b"OK"), None);
        assert_eq!(embedded_error(b"\x89PNG"), None);
    }

    #[test]
    fn builders_set_payload() {
        let spec = "POST/dump".parse::<RequestSpec>().unwrap().raw("[\"a\"]");
        assert_eq!(spec.payload, Payload::Raw("[\"a\"]".into()));
        let spec = spec.json(json!({"k": 1})).tolerate_embedded_error();
        assert!(spec.tolerate_embedded_error);
        assert!(matches!(spec.payload, Payload::Json(_)));
        let spec = spec.form(&[("file_path", "/tmp/a.json")]);
        assert_eq!(spec.payload, Payload::Form(vec![("file_path".into(), "/tmp/a.json".into())]));
    }

    #[tokio::test]
    async fn unreachable_host_is_an_error_not_a_panic() {
        let transport = HttpTransport::new("127.0.0.1", 1, 2).unwrap();
        let spec: RequestSpec = "GET/screenshot".parse().unwrap();
        assert!(transport.send(&spec).await.is_err());
    }
}
