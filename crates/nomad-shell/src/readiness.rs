use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

const LISTENING_KEYWORDS: &[&str] = &["http server listening", "server listening", "listening on"];

pub trait ReadinessProbe: Send + Sync {
    fn detect(&self, line: &str) -> Option<u16>;
}

/// Log-scraping probe for the backend's announcement formats.
///
/// 1. `... Server is ready at http://<host>:<port>` yields the port directly.
/// 2. A line mentioning a listening keyword yields the trailing `:<port>`
///    token, or failing that the `port` field of the line parsed as JSON.
#[derive(Debug, Clone)]
pub struct LogAnnouncementProbe {
    ready_at: Regex,
    trailing_port: Regex,
}

impl LogAnnouncementProbe {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ready_at: Regex::new(
                r"(?i)server is ready at https?://(?:\[[^\]\s]+\]|[^\s/:\[]+):(\d{1,5})",
            )
            .context("invalid ready-announcement pattern")?,
            trailing_port: Regex::new(r":(\d{2,5})/?\s*$")
                .context("invalid trailing-port pattern")?,
        })
    }

    fn listening_port(&self, line: &str) -> Option<u16> {
        let lowered = line.to_lowercase();
        if !LISTENING_KEYWORDS
            .iter()
            .any(|keyword| lowered.contains(keyword))
        {
            return None;
        }

        if let Some(port) = self
            .trailing_port
            .captures(line)
            .and_then(|captures| captures.get(1))
            .and_then(|m| parse_port(m.as_str()))
        {
            return Some(port);
        }

        match serde_json::from_str::<Value>(line) {
            Ok(value) => json_port(&value),
            Err(err) => {
                debug!("listening line is neither port-suffixed nor JSON: {err}");
                None
            }
        }
    }
}

impl ReadinessProbe for LogAnnouncementProbe {
    fn detect(&self, line: &str) -> Option<u16> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(port) = self
            .ready_at
            .captures(line)
            .and_then(|captures| captures.get(1))
            .and_then(|m| parse_port(m.as_str()))
        {
            return Some(port);
        }

        self.listening_port(line)
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.parse::<u16>().ok().filter(|port| *port != 0)
}

fn json_port(value: &Value) -> Option<u16> {
    let port = value.get("port")?;
    if let Some(number) = port.as_u64() {
        return u16::try_from(number).ok().filter(|port| *port != 0);
    }
    port.as_str().and_then(parse_port)
}

pub fn backend_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
