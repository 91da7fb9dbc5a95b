use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use crate::delayer::Delayer;

const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const API_READ_TIMEOUT: Duration = Duration::from_secs(2);
const API_USER_AGENT: &str = "cbox";
const API_RETRIES: u32 = 1;

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Minimal GET-only transport used to reach the stove controllers.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(API_CONNECT_TIMEOUT)
            .timeout(API_CONNECT_TIMEOUT + API_READ_TIMEOUT)
            .user_agent(API_USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(ReqwestClient { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(HttpResponse { status, body })
    }
}

/// A single request understood by the controller's `sendmsg.lua` endpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum StoveCommand {
    FetchState,
    Power(bool),
    TargetTemperature(i64),
    FloatTargetTemperature(f64),
    FanSpeed(u8),
    PowerLevel(String),
    Timer(bool),
}

impl StoveCommand {
    pub fn to_vendor_string(&self) -> String {
        match self {
            StoveCommand::FetchState => "GET ALLS".to_string(),
            StoveCommand::Power(true) => "CMD ON".to_string(),
            StoveCommand::Power(false) => "CMD OFF".to_string(),
            StoveCommand::TargetTemperature(t) => format!("SET SETP {}", t),
            StoveCommand::FloatTargetTemperature(t) => format!("SET STPF {}", t),
            StoveCommand::FanSpeed(code) => format!("SET RFAN {}", code),
            StoveCommand::PowerLevel(level) => format!("SET POWR {}", level),
            StoveCommand::Timer(on) => format!("SET CSST {}", if *on { "1" } else { "0" }),
        }
    }
}

pub struct PalazzettiApi<H: HttpClient> {
    http: H,
    delayer: Delayer,
    retries: u32,
    last_successful_response: Option<Instant>,
}

impl<H: HttpClient> PalazzettiApi<H> {
    pub fn new(http: H) -> Self {
        PalazzettiApi {
            http,
            delayer: Delayer::new(vec![1.0], 2.0),
            retries: API_RETRIES,
            last_successful_response: None,
        }
    }

    /// Sends a raw command to the controller at `hostname`.
    ///
    /// Returns `None` once the retry budget is exhausted; callers treat that
    /// as "no data this cycle".
    pub async fn send_command(&mut self, hostname: &str, command: &str) -> Option<Value> {
        let url = format!("http://{}/cgi-bin/sendmsg.lua?cmd={}", hostname, command);
        let mut retries_left = self.retries;

        loop {
            debug!("API call: {}", url);

            match self.get_json(&url).await {
                Ok(value) => {
                    self.last_successful_response = Some(Instant::now());
                    return Some(value);
                }
                Err(e) if retries_left > 0 => {
                    debug!("API call failed: {:#}. Retrying.", e);
                    retries_left -= 1;
                    tokio::time::sleep(self.delayer.next()).await;
                }
                Err(e) => {
                    debug!("API call failed: {:#}. No more retry.", e);
                    return None;
                }
            }
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = match self.http.get(url).await {
            Ok(response) => response,
            Err(e) => {
                warn!("API request to {} failed: {:#}", url, e);
                return Err(e);
            }
        };

        if !(200..300).contains(&response.status) {
            anyhow::bail!("status code {}", response.status);
        }

        debug!("API response: {}", response.body);

        serde_json::from_str(&response.body).context("Malformed JSON in API response")
    }

    pub async fn send(&mut self, hostname: &str, command: &StoveCommand) -> Option<Value> {
        self.send_command(hostname, &command.to_vendor_string()).await
    }

    pub async fn fetch_state(&mut self, hostname: &str) -> Option<Value> {
        self.send(hostname, &StoveCommand::FetchState).await
    }

    pub fn last_successful_response_age(&self) -> Option<Duration> {
        self.last_successful_response.map(|t| t.elapsed())
    }
}

#[cfg(test)]
pub use mock::MockHttpClient;

#[cfg(test)]
mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// Scripted HTTP client. Responses are queued per hostname; the last
    /// queued response for a host keeps being returned once the rest are used
    /// up. Unknown hosts behave like a refused connection.
    #[derive(Clone, Default)]
    pub struct MockHttpClient {
        routes: Arc<Mutex<HashMap<String, VecDeque<HttpResponse>>>>,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, hostname: &str, status: u16, body: &str) {
            self.routes
                .lock()
                .unwrap()
                .entry(hostname.to_string())
                .or_default()
                .push_back(HttpResponse {
                    status,
                    body: body.to_string(),
                });
        }

        pub fn forget(&self, hostname: &str) {
            self.routes.lock().unwrap().remove(hostname);
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        pub fn clear_requests(&self) {
            self.requests.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get(&self, url: &str) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(url.to_string());

            let host = url
                .strip_prefix("http://")
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default();

            let mut routes = self.routes.lock().unwrap();
            let queue = routes
                .get_mut(host)
                .filter(|queue| !queue.is_empty())
                .ok_or_else(|| anyhow::anyhow!("connection refused"))?;

            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap())
            } else {
                Ok(queue.front().unwrap().clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_command_strings() {
        assert_eq!(StoveCommand::FetchState.to_vendor_string(), "GET ALLS");
        assert_eq!(StoveCommand::Power(true).to_vendor_string(), "CMD ON");
        assert_eq!(StoveCommand::Power(false).to_vendor_string(), "CMD OFF");
        assert_eq!(
            StoveCommand::TargetTemperature(21).to_vendor_string(),
            "SET SETP 21"
        );
        assert_eq!(
            StoveCommand::FloatTargetTemperature(21.4).to_vendor_string(),
            "SET STPF 21.4"
        );
        assert_eq!(StoveCommand::FanSpeed(7).to_vendor_string(), "SET RFAN 7");
        assert_eq!(
            StoveCommand::PowerLevel("3".to_string()).to_vendor_string(),
            "SET POWR 3"
        );
        assert_eq!(StoveCommand::Timer(true).to_vendor_string(), "SET CSST 1");
        assert_eq!(StoveCommand::Timer(false).to_vendor_string(), "SET CSST 0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_request() {
        let http = MockHttpClient::new();
        http.respond("stove.local", 200, r#"{"SUCCESS": true}"#);
        let mut api = PalazzettiApi::new(http.clone());

        assert!(api.last_successful_response_age().is_none());

        let value = api.send("stove.local", &StoveCommand::Power(false)).await;

        assert_eq!(value, Some(serde_json::json!({"SUCCESS": true})));
        assert_eq!(
            http.requests(),
            vec!["http://stove.local/cgi-bin/sendmsg.lua?cmd=CMD OFF".to_string()]
        );
        assert!(api.last_successful_response_age().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_successful_response_age_follows_clock() {
        let http = MockHttpClient::new();
        http.respond("stove.local", 200, r#"{"DATA": {}}"#);
        let mut api = PalazzettiApi::new(http);

        api.fetch_state("stove.local").await;
        tokio::time::advance(Duration::from_secs(45)).await;

        assert_eq!(
            api.last_successful_response_age(),
            Some(Duration::from_secs(45))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_once_then_succeeds() {
        let http = MockHttpClient::new();
        http.respond("stove.local", 503, "");
        http.respond("stove.local", 200, r#"{"DATA": {}}"#);
        let mut api = PalazzettiApi::new(http.clone());

        let value = api.fetch_state("stove.local").await;

        assert_eq!(value, Some(serde_json::json!({"DATA": {}})));
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_polls_degrade_to_no_data() {
        let http = MockHttpClient::new();
        http.respond("stove.local", 500, "");
        let mut api = PalazzettiApi::new(http.clone());

        for poll in 1..=3 {
            assert_eq!(api.fetch_state("stove.local").await, None);
            // One initial attempt plus at most one retry per poll
            assert_eq!(http.requests().len(), poll * 2);
        }
        assert!(api.last_successful_response_age().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_is_a_failure() {
        let http = MockHttpClient::new();
        http.respond("stove.local", 200, "<html>");
        let mut api = PalazzettiApi::new(http.clone());

        assert_eq!(api.fetch_state("stove.local").await, None);
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host() {
        let http = MockHttpClient::new();
        let mut api = PalazzettiApi::new(http.clone());

        assert_eq!(api.fetch_state("nowhere.local").await, None);
        assert_eq!(http.requests().len(), 2);
    }
}
