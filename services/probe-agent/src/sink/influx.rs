//! InfluxDB v2 sink speaking line protocol over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sitemon_model::ProbeResult;
use tracing::{debug, error};

use super::{MetricsSink, SinkError};

/// Measurement holding one point per probe result.
const RESULTS_MEASUREMENT: &str = "testresults";

/// Measurement holding one point per test record.
const CASES_MEASUREMENT: &str = "testcases";

/// Connection parameters, as found in the credentials file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// InfluxDB v2 write client.
pub struct InfluxSink {
    client: reqwest::Client,
    config: InfluxConfig,
    hostname: String,
}

impl InfluxSink {
    /// Create a sink reporting results as written by `hostname`.
    pub fn new(config: InfluxConfig, hostname: impl Into<String>) -> Result<Self, SinkError> {
        if config.url.trim().is_empty() || config.bucket.trim().is_empty() {
            return Err(SinkError::Config("url and bucket are required".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            config,
            hostname: hostname.into(),
        })
    }

    fn write_url(&self) -> String {
        format!("{}/api/v2/write", self.config.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn write(&self, result: &ProbeResult) -> Result<(), SinkError> {
        let body = line_protocol(result, &self.hostname);
        debug!(probe = %result.probe_name, lines = body.lines().count(), "Writing points");

        let response = self
            .client
            .post(self.write_url())
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "InfluxDB rejected write");
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Render a result as InfluxDB line protocol.
pub(crate) fn line_protocol(result: &ProbeResult, hostname: &str) -> String {
    let timestamp = result.finished_at.timestamp_millis();
    let probe = escape_tag(&result.probe_name);
    let site = escape_tag(&result.site);

    let mut fields = vec![
        format!("result={}", result.overall_passed),
        format!("message={}", quote_field(&result.summary())),
        format!("testtime={}", result.test_duration_secs()),
        format!("hostname={}", quote_field(hostname)),
    ];
    if let Some(handle) = &result.handle {
        fields.push(format!("handle={}", quote_field(handle.as_str())));
    }
    if let Some(runtime) = result.runtime_secs {
        fields.push(format!("runtime={runtime}"));
    }
    if let Some(efficiency) = result.cpu_efficiency {
        fields.push(format!("cpu_efficiency={efficiency}"));
    }

    let mut lines = vec![format!(
        "{RESULTS_MEASUREMENT},test_name={probe},site={site} {} {timestamp}",
        fields.join(",")
    )];
    for test in &result.tests {
        lines.push(format!(
            "{CASES_MEASUREMENT},test_name={probe},site={site},case={} passed={},message={} {timestamp}",
            escape_tag(&test.test),
            test.passed,
            quote_field(&test.message),
        ));
    }

    let mut body = lines.join("\n");
    body.push('\n');
    body
}

fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ',' | '=' | ' ' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

fn quote_field(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use sitemon_model::{JobHandle, JobInstance, ProbeFailure, TestResult};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::testing::probe;

    fn passing_result() -> ProbeResult {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut inst = JobInstance::pending(&probe("disk check", 300, 120), start);
        inst.external_handle = Some(JobHandle::new("42"));
        ProbeResult::completed(
            &inst,
            None,
            Ok(vec![TestResult {
                test: "read,write".to_string(),
                passed: true,
                message: "said \"ok\"".to_string(),
            }]),
            start + Duration::seconds(30),
        )
        .with_usage(Some(25.0), Some(0.5))
    }

    fn config(url: String) -> InfluxConfig {
        InfluxConfig {
            url,
            token: "secret".to_string(),
            org: "grid".to_string(),
            bucket: "probes".to_string(),
        }
    }

    #[test]
    fn test_line_protocol_escaping() {
        let body = line_protocol(&passing_result(), "worker-1");
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "testresults,test_name=disk\\ check,site=site-a result=true,\
             message=\"Job succeeded\",testtime=30,hostname=\"worker-1\",\
             handle=\"42\",runtime=25,cpu_efficiency=0.5 1700000030000"
        );
        assert_eq!(
            lines[1],
            "testcases,test_name=disk\\ check,site=site-a,case=read\\,write \
             passed=true,message=\"said \\\"ok\\\"\" 1700000030000"
        );
    }

    #[test]
    fn test_failure_has_no_case_points() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let inst = JobInstance::pending(&probe("disk-check", 300, 120), now);
        let result = ProbeResult::failure(&inst, &ProbeFailure::Timeout, now);

        let body = line_protocol(&result, "worker-1");
        assert_eq!(body.lines().count(), 1);
        assert!(body.contains("result=false"));
        assert!(body.contains("message=\"Job failed - timeout\""));
        assert!(!body.contains("handle="));
    }

    #[tokio::test]
    async fn test_write_posts_line_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .and(query_param("org", "grid"))
            .and(query_param("bucket", "probes"))
            .and(query_param("precision", "ms"))
            .and(header("Authorization", "Token secret"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = InfluxSink::new(config(server.uri()), "worker-1").unwrap();
        sink.write(&passing_result()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(body.starts_with("testresults,"));
    }

    #[tokio::test]
    async fn test_write_surfaces_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let sink = InfluxSink::new(config(server.uri()), "worker-1").unwrap();
        let err = sink.write(&passing_result()).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected { status: 401, .. }));
    }

    #[test]
    fn test_rejects_empty_url() {
        assert!(matches!(
            InfluxSink::new(config(String::new()), "worker-1"),
            Err(SinkError::Config(_))
        ));
    }
}
