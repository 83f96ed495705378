//! HTTP delivery of NDJSON batches to the ingest endpoint.

use super::agent::{Agent, AgentConfig, BatchSink};
use crate::config::types::{DaemonError, Result};
use std::time::Duration;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Whole-request limit, connect included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Posts each batch as one `application/x-ndjson` request body.
pub struct HttpSink {
    agent: ureq::Agent,
}

impl HttpSink {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .build(),
        }
    }
}

impl Default for HttpSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchSink for HttpSink {
    fn deliver(&self, ingest_url: &str, body: &str) -> Result<()> {
        match self
            .agent
            .post(ingest_url)
            .set("Content-Type", NDJSON_CONTENT_TYPE)
            .send_string(body)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(DaemonError::Delivery(format!(
                "{} answered HTTP {}",
                ingest_url, code
            ))),
            Err(e) => Err(DaemonError::Delivery(format!("{}: {}", ingest_url, e))),
        }
    }
}

impl Agent<HttpSink> {
    /// Agent that posts to `config.ingest_url`.
    pub fn http(config: AgentConfig) -> Self {
        Agent::new(config, HttpSink::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ErrorKind;
    use crate::telemetry::Event;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    struct Captured {
        request_line: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl Captured {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    /// One-shot HTTP listener answering with `status`.
    fn ingest_server(status: &'static str) -> (String, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/ingest/tal", listener.local_addr().unwrap());

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();

            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                let (k, v) = line.split_once(':').unwrap();
                headers.push((k.trim().to_string(), v.trim().to_string()));
            }

            let length: usize = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .map(|(_, v)| v.parse().unwrap())
                .unwrap_or(0);
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            )
            .unwrap();
            stream.flush().unwrap();

            Captured {
                request_line: request_line.trim_end().to_string(),
                headers,
                body: String::from_utf8(body).unwrap(),
            }
        });
        (url, handle)
    }

    #[test]
    fn batch_is_posted_as_ndjson() {
        let (url, server) = ingest_server("200 OK");
        let agent = Agent::http(AgentConfig {
            ingest_url: url,
            run_id: "r-http".to_string(),
            batch_size: 2,
            ..AgentConfig::default()
        });

        agent.record(Event::new("call"));
        agent.record(Event::new("return"));
        let captured = server.join().unwrap();

        assert_eq!(captured.request_line, "POST /ingest/tal HTTP/1.1");
        assert_eq!(captured.header("content-type"), Some("application/x-ndjson"));

        let lines: Vec<serde_json::Value> = captured
            .body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "call");
        assert_eq!(lines[1]["kind"], "return");
        assert_eq!(lines[1]["runId"], "r-http");
        assert_eq!(agent.pending(), 0);
    }

    #[test]
    fn error_status_is_a_delivery_failure() {
        let (url, server) = ingest_server("500 Internal Server Error");
        let err = HttpSink::new().deliver(&url, "{}\n").unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, DaemonError::Delivery(_)));
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn refused_connection_is_a_delivery_failure() {
        let url = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}/ingest/tal", listener.local_addr().unwrap())
        };

        let err = HttpSink::new().deliver(&url, "{}\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
