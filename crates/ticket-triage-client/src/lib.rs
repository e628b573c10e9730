use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use ticket_triage_core::{
    ClassificationClient, ClassificationError, ClassificationResponse, FeedError, Prediction,
    TicketFeed, TicketId, TicketRecord,
};
use tracing::{debug, warn};

pub const DEFAULT_CLASSIFIER_URL: &str = "http://127.0.0.1:5000/predict";

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    support_tickets: &'a [String],
}

/// Blocking client for the urgency prediction endpoint. One call is one HTTP
/// round trip; retries belong to the caller.
#[derive(Debug, Clone)]
pub struct HttpClassificationClient {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpClassificationClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self { agent: build_http_agent(timeout), endpoint: endpoint.into() }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ClassificationClient for HttpClassificationClient {
    fn classify(&self, messages: &[String]) -> Result<ClassificationResponse, ClassificationError> {
        if messages.is_empty() {
            return Ok(ClassificationResponse::default());
        }

        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .send_json(PredictRequest { support_tickets: messages })
            .map_err(classification_error_from_ureq)?;

        let body: Value = serde_json::from_reader(response.into_reader())
            .map_err(|err| ClassificationError::MalformedBody(err.to_string()))?;
        let Value::Array(entries) = body else {
            return Err(ClassificationError::MalformedBody(
                "expected a JSON array of predictions".to_string(),
            ));
        };

        debug!(requested = messages.len(), returned = entries.len(), "classification response");
        let predictions = entries.iter().map(prediction_from_entry).collect();
        Ok(ClassificationResponse::new(predictions).align_to(messages.len()))
    }
}

fn prediction_from_entry(entry: &Value) -> Prediction {
    Prediction::from_service(
        entry.get("class").and_then(Value::as_str),
        entry.get("score").and_then(Value::as_f64),
    )
}

/// Reads the default support ticket list from an upstream JSON endpoint
/// returning `[{"Identity", "Company", "Message", ...}]`.
#[derive(Debug, Clone)]
pub struct HttpTicketFeed {
    agent: ureq::Agent,
    url: String,
}

impl HttpTicketFeed {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self { agent: build_http_agent(timeout), url: url.into() }
    }
}

impl TicketFeed for HttpTicketFeed {
    fn fetch(&self) -> Result<Vec<TicketRecord>, FeedError> {
        let response = self
            .agent
            .get(&self.url)
            .set("Accept", "application/json")
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(status, _) => {
                    FeedError::Transport(format!("feed responded with status {status}"))
                }
                ureq::Error::Transport(transport) => FeedError::Transport(transport.to_string()),
            })?;

        let body: Value = serde_json::from_reader(response.into_reader())
            .map_err(|err| FeedError::MalformedBody(err.to_string()))?;
        let Value::Array(entries) = body else {
            return Err(FeedError::MalformedBody("expected a JSON array of tickets".to_string()));
        };

        let total = entries.len();
        let tickets = entries.iter().filter_map(ticket_from_feed_entry).collect::<Vec<_>>();
        if tickets.len() < total {
            warn!(
                dropped = total - tickets.len(),
                "skipped feed entries without identity or company"
            );
        }
        Ok(tickets)
    }
}

fn ticket_from_feed_entry(entry: &Value) -> Option<TicketRecord> {
    let id = match entry.get("Identity")? {
        Value::String(raw) => TicketId::parse(raw).ok()?,
        Value::Number(number) => TicketId::parse(&number.to_string()).ok()?,
        _ => return None,
    };
    let customer = entry.get("Company").and_then(Value::as_str)?;
    let message = entry.get("Message").and_then(Value::as_str).unwrap_or_default();
    Some(TicketRecord::new(id, customer, message))
}

fn build_http_agent(timeout: Duration) -> ureq::Agent {
    let timeout = timeout.max(Duration::from_millis(100));
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .try_proxy_from_env(false)
        .build()
}

fn classification_error_from_ureq(err: ureq::Error) -> ClassificationError {
    match err {
        ureq::Error::Status(status, _) => ClassificationError::Service { status },
        ureq::Error::Transport(transport) => {
            ClassificationError::Transport(format!("{:?}: {transport}", transport.kind()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use ticket_triage_core::{Confidence, Urgency};

    struct MockResponse {
        status: u16,
        body: String,
    }

    struct CapturedRequest {
        request_line: String,
        body: String,
    }

    fn reason_phrase(status: u16) -> &'static str {
        match status {
            400 => "Bad Request",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "OK",
        }
    }

    fn read_request(stream: &std::net::TcpStream) -> CapturedRequest {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader
            .read_line(&mut request_line)
            .unwrap_or_else(|err| panic!("failed to read request line: {err}"));

        let mut content_length = 0_usize;
        loop {
            let mut header = String::new();
            reader
                .read_line(&mut header)
                .unwrap_or_else(|err| panic!("failed to read header: {err}"));
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0_u8; content_length];
        reader.read_exact(&mut body).unwrap_or_else(|err| panic!("failed to read body: {err}"));
        CapturedRequest {
            request_line: request_line.trim_end().to_string(),
            body: String::from_utf8_lossy(&body).to_string(),
        }
    }

    fn spawn_mock_server(
        response: MockResponse,
    ) -> (String, thread::JoinHandle<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to bind test server: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("failed to read local addr: {err}"));
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener
                .accept()
                .unwrap_or_else(|err| panic!("failed to accept connection: {err}"));
            let captured = read_request(&stream);
            let payload = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                response.status,
                reason_phrase(response.status),
                response.body.len(),
                response.body
            );
            stream
                .write_all(payload.as_bytes())
                .unwrap_or_else(|err| panic!("failed to write response: {err}"));
            captured
        });
        (format!("http://{addr}"), handle)
    }

    fn messages(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_string()).collect()
    }

    fn client_for(base_url: &str) -> HttpClassificationClient {
        HttpClassificationClient::new(format!("{base_url}/predict"), Duration::from_secs(2))
    }

    fn join(handle: thread::JoinHandle<CapturedRequest>) -> CapturedRequest {
        handle.join().unwrap_or_else(|_| panic!("mock server thread panicked"))
    }

    // Test IDs: TCLI-001
    #[test]
    fn classify_posts_messages_and_maps_predictions() {
        let (base_url, handle) = spawn_mock_server(MockResponse {
            status: 200,
            body: r#"[{"class":"High","score":0.91},{"class":"Low","score":0.4}]"#.to_string(),
        });

        let response = client_for(&base_url)
            .classify(&messages(&["server down", "password reset"]))
            .unwrap_or_else(|err| panic!("classification should succeed: {err}"));
        let captured = join(handle);

        assert_eq!(captured.request_line, "POST /predict HTTP/1.1");
        let sent: Value = serde_json::from_str(&captured.body)
            .unwrap_or_else(|err| panic!("request body should be JSON: {err}"));
        assert_eq!(sent, serde_json::json!({"support_tickets": ["server down", "password reset"]}));

        let predictions = response.predictions();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].urgency, Urgency::High);
        assert_eq!(predictions[0].confidence.to_string(), "91%");
        assert_eq!(predictions[1].confidence, Confidence::from_score(0.4).unwrap_or_default());
        assert_eq!(response.padded(), 0);
    }

    // Test IDs: TCLI-002
    #[test]
    fn short_and_malformed_responses_degrade_to_unknown() {
        let (base_url, handle) = spawn_mock_server(MockResponse {
            status: 200,
            body: r#"[{"class":"Severe","score":0.5}]"#.to_string(),
        });

        let response = client_for(&base_url)
            .classify(&messages(&["a", "b", "c"]))
            .unwrap_or_else(|err| panic!("short response should not fail: {err}"));
        join(handle);

        assert_eq!(response.len(), 3);
        assert_eq!(response.padded(), 2);
        assert!(response.predictions().iter().all(|prediction| *prediction == Prediction::UNKNOWN));
    }

    // Test IDs: TCLI-003
    #[test]
    fn error_status_is_a_service_error() {
        let (base_url, handle) = spawn_mock_server(MockResponse {
            status: 500,
            body: r#"{"error":"model not loaded"}"#.to_string(),
        });

        let result = client_for(&base_url).classify(&messages(&["a"]));
        join(handle);

        assert_eq!(result, Err(ClassificationError::Service { status: 500 }));
    }

    // Test IDs: TCLI-004
    #[test]
    fn non_array_body_is_malformed() {
        let (base_url, handle) = spawn_mock_server(MockResponse {
            status: 200,
            body: r#"{"predictions":[]}"#.to_string(),
        });

        let result = client_for(&base_url).classify(&messages(&["a"]));
        join(handle);

        assert!(matches!(result, Err(ClassificationError::MalformedBody(_))));
    }

    // Test IDs: TCLI-005
    #[test]
    fn unreachable_service_is_a_transport_error() {
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .unwrap_or_else(|err| panic!("failed to reserve a port: {err}"));
        let client = HttpClassificationClient::new(
            format!("http://127.0.0.1:{port}/predict"),
            Duration::from_millis(300),
        );

        let result = client.classify(&messages(&["a"]));
        assert!(matches!(&result, Err(err) if err.is_transient()), "unexpected result: {result:?}");
    }

    // Test IDs: TCLI-006
    #[test]
    fn empty_request_makes_no_call() {
        let client =
            HttpClassificationClient::new("http://127.0.0.1:9/predict", Duration::from_millis(100));
        let response = client
            .classify(&[])
            .unwrap_or_else(|err| panic!("empty request should be a no-op: {err}"));
        assert!(response.is_empty());
    }

    // Test IDs: TCLI-007
    #[test]
    fn feed_maps_identity_company_and_message() {
        let (base_url, handle) = spawn_mock_server(MockResponse {
            status: 200,
            body: r#"[
                {"Identity": 101, "Company": "Acme", "Message": "vpn down", "Label": "x", "Sentiment": "neg"},
                {"Identity": "T-2", "Company": "Globex", "Message": "invoice"},
                {"Identity": 103, "Message": "no company"}
            ]"#
            .to_string(),
        });

        let tickets = HttpTicketFeed::new(format!("{base_url}/tickets"), Duration::from_secs(2))
            .fetch()
            .unwrap_or_else(|err| panic!("feed should load: {err}"));
        let captured = join(handle);

        assert_eq!(captured.request_line, "GET /tickets HTTP/1.1");
        let ids = tickets.iter().map(|ticket| ticket.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["101", "T-2"]);
        assert_eq!(tickets[0].customer, "Acme");
        assert_eq!(tickets[0].urgency, Urgency::Unclassified);
    }
}
