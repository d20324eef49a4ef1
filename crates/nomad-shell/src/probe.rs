use nomad_types::{Response, ShellEvent};
use serde::Serialize;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::app::AppMessage;
use crate::handoff::HandoffEvent;
use crate::retry::{LoadError, LoadErrorKind};
use crate::surface::{ErrorPage, Surface, Ticket};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(tag = "view", rename_all = "lowercase")]
enum ViewLine<'a> {
    Loading,
    Live {
        url: &'a str,
    },
    Error {
        url: &'a str,
        message: &'a str,
        attempts: u32,
    },
}

pub struct ProbeSurface<W> {
    sender: Sender<AppMessage>,
    out: W,
    probe_timeout: Duration,
}

impl<W: Write> ProbeSurface<W> {
    pub fn new(sender: Sender<AppMessage>, out: W, probe_timeout: Duration) -> Self {
        Self {
            sender,
            out,
            probe_timeout,
        }
    }

    fn emit<V: Serialize>(&mut self, value: &V) {
        let line = match serde_json::to_string(value) {
            Ok(line) => line,
            Err(err) => {
                warn!("failed to serialize output line: {err}");
                return;
            }
        };
        if let Err(err) = writeln!(self.out, "{line}").and_then(|()| self.out.flush()) {
            warn!("failed to write output line: {err}");
        }
    }

    fn spawn_probe<F>(&self, url: &str, report: F)
    where
        F: FnOnce(Result<(), LoadError>) -> HandoffEvent + Send + 'static,
    {
        let url = url.to_string();
        let sender = self.sender.clone();
        let timeout = self.probe_timeout;
        thread::spawn(move || {
            let outcome = probe_http(&url, timeout);
            if let Err(err) = &outcome {
                debug!("probe of {url} failed: {err}");
            }
            let _ = sender.send(AppMessage::Handoff(report(outcome)));
        });
    }
}

impl<W: Write> Surface for ProbeSurface<W> {
    fn has_window(&self) -> bool {
        true
    }

    fn show_loading(&mut self) {
        self.emit(&ViewLine::Loading);
    }

    fn load_visible(&mut self, url: &str, ticket: Ticket) {
        info!("loading {url}");
        self.emit(&ViewLine::Live { url });
        self.spawn_probe(url, move |outcome| match outcome {
            Ok(()) => HandoffEvent::VisibleLoaded { ticket },
            Err(error) => HandoffEvent::VisibleFailed { ticket, error },
        });
    }

    fn show_error(&mut self, page: &ErrorPage) {
        self.emit(&ViewLine::Error {
            url: &page.url,
            message: &page.message,
            attempts: page.attempts,
        });
    }

    fn create_preload(&mut self, url: &str, ticket: Ticket) {
        self.spawn_probe(url, move |outcome| match outcome {
            Ok(()) => HandoffEvent::PreloadLoaded { ticket },
            Err(error) => HandoffEvent::PreloadFailed { ticket, error },
        });
    }

    fn destroy_preload(&mut self, ticket: Ticket) {
        debug!("preload {ticket} discarded");
    }

    fn deliver(&mut self, event: &ShellEvent) {
        self.emit(event);
    }

    fn respond(&mut self, response: &Response) {
        self.emit(response);
    }
}

/// Connects to `raw` and, for plain http, checks that `GET` answers below 500.
pub fn probe_http(raw: &str, timeout: Duration) -> Result<(), LoadError> {
    let url = Url::parse(raw).map_err(|err| LoadError::other(format!("invalid url {raw}: {err}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| LoadError::other(format!("url has no host: {raw}")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| LoadError::other(format!("url has no port: {raw}")))?;

    let addrs = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|err| LoadError::new(LoadErrorKind::Unreachable, err.to_string()))?;
    let mut last_error = LoadError::new(LoadErrorKind::Unreachable, format!("no address for {raw}"));
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(err) => last_error = connect_error(&err),
        }
    }
    let Some(stream) = stream else {
        return Err(last_error);
    };
    if url.scheme() != "http" {
        return Ok(());
    }

    let code = request_status(stream, &url, &host, port, timeout)
        .map_err(|err| match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => LoadError::timeout(),
            _ => LoadError::other(format!("request to {raw} failed: {err}")),
        })?;
    if code >= 500 {
        return Err(LoadError::other(format!("{raw} answered HTTP {code}")));
    }
    Ok(())
}

fn connect_error(err: &io::Error) -> LoadError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => LoadError::connection_refused(err.to_string()),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            LoadError::new(LoadErrorKind::Timeout, err.to_string())
        }
        _ => LoadError::new(LoadErrorKind::Unreachable, err.to_string()),
    }
}

fn request_status(
    mut stream: TcpStream,
    url: &Url,
    host: &str,
    port: u16,
    timeout: Duration,
) -> io::Result<u16> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let path = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n"
    )?;
    stream.flush()?;

    let mut status_line = String::new();
    BufReader::new(stream).read_line(&mut status_line)?;
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|_| status_line.starts_with("HTTP/"))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed status line: {:?}", status_line.trim_end()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((mut socket, _)) = listener.accept() {
                let mut buffer = [0_u8; 1024];
                let _ = socket.read(&mut buffer);
                let _ = socket.write_all(response.as_bytes());
            }
        });
        port
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn probe_accepts_successful_response() {
        let port = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        probe_http(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn probe_rejects_server_errors_as_non_transient() {
        let port = serve_once("HTTP/1.1 502 Bad Gateway\r\n\r\n");
        let err = probe_http(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(2))
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::Other);
        assert!(err.message.contains("502"));
    }

    #[test]
    fn probe_reports_refused_connection_as_transient() {
        let port = closed_port();
        let err = probe_http(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(2))
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::ConnectionRefused);
        assert!(err.is_transient());
    }

    #[test]
    fn surface_writes_json_lines_and_posts_outcomes() {
        let (tx, rx) = mpsc::channel();
        let mut out = Vec::new();
        {
            let mut surface = ProbeSurface::new(tx, &mut out, Duration::from_secs(2));
            surface.show_loading();
            surface.respond(&Response::ok(3, serde_json::json!({"pong": true})));
            surface.create_preload(&format!("http://127.0.0.1:{}/", closed_port()), 9);
        }

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines[0], serde_json::json!({"view": "loading"}));
        assert_eq!(lines[1]["id"], 3);

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            AppMessage::Handoff(HandoffEvent::PreloadFailed { ticket, error }) => {
                assert_eq!(ticket, 9);
                assert!(error.is_transient());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
