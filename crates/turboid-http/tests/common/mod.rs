//! Common test utilities for integration tests
//!
//! Wraps a wiremock server that plays an identity host and an OpenID provider
//! on the loopback interface.

#![allow(dead_code)]

use turboid_http::{HtmlDiscovery, HttpTransport, HttpTransportConfig, SsrfPolicy};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// Mock identity host and provider
pub struct MockOpenIdServer {
    pub server: MockServer,
    pub base_url: String,
}

impl MockOpenIdServer {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self { server, base_url }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Serve an HTML page at `page_path`
    pub async fn mock_page(&self, page_path: &str, html: &str) {
        Mock::given(method("GET"))
            .and(path(page_path))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/html; charset=utf-8")
                    .set_body_string(html),
            )
            .mount(&self.server)
            .await;
    }

    /// Redirect `from` to `location`
    pub async fn mock_redirect(&self, from: &str, status: u16, location: &str) {
        Mock::given(method("GET"))
            .and(path(from))
            .respond_with(ResponseTemplate::new(status).insert_header("Location", location))
            .mount(&self.server)
            .await;
    }

    /// Answer POSTs to `endpoint_path` with a key-value form body
    pub async fn mock_kv_reply(&self, endpoint_path: &str, status: u16, body: &str) {
        Mock::given(method("POST"))
            .and(path(endpoint_path))
            .respond_with(
                ResponseTemplate::new(status)
                    .insert_header("Content-Type", "text/plain")
                    .set_body_string(body),
            )
            .mount(&self.server)
            .await;
    }
}

/// Configuration allowing only the loopback mock server
pub fn local_config() -> HttpTransportConfig {
    HttpTransportConfig {
        ssrf_policy: SsrfPolicy::local_only(),
        ..HttpTransportConfig::default()
    }
}

pub fn transport() -> HttpTransport {
    HttpTransport::with_config(local_config()).unwrap()
}

pub fn discovery() -> HtmlDiscovery {
    HtmlDiscovery::with_config(local_config()).unwrap()
}

/// Identity page advertising the given links
pub fn identity_page(links: &[(&str, &str)]) -> String {
    let tags: String = links
        .iter()
        .map(|(rel, href)| format!("    <link rel=\"{rel}\" href=\"{href}\">\n"))
        .collect();
    format!("<!DOCTYPE html>\n<html>\n<head>\n<title>Identity</title>\n{tags}</head>\n<body>hello</body>\n</html>\n")
}
