//! External receiver process adapter.
//!
//! Runs a third-party mirroring receiver as a child process and watches its
//! log output. Log lines are translated into [`BackendEvent`]s, which
//! [`ExternalFeeds`] applies to the registry. The external process renders
//! video itself, so its feeds carry placeholder frames.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::MirroringBackend;
use crate::decode::{DecodedFrame, PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH};
use crate::registry::{FeedId, StreamRegistry};

/// How long the child gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How often placeholder frames of external feeds are refreshed.
const PLACEHOLDER_REFRESH: Duration = Duration::from_millis(500);

const MIRROR_START_MARKER: &str = "raop_rtp_mirror starting mirroring";
const MIRROR_COMPONENT: &str = "raop_rtp_mirror";
const AUTHENTICATED_MARKER: &str = "Authenticated";

/// A session lifecycle event reported by the external receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A device started mirroring.
    Connected { name: String },
    /// A device stopped mirroring.
    Disconnected { name: String },
    /// A device's frame should be refreshed.
    Frame { name: String },
}

/// Turns external receiver log lines into [`BackendEvent`]s.
///
/// The receiver logs the authenticated device name before mirroring starts,
/// so the parser remembers it for the following start and stop lines.
#[derive(Debug, Default)]
pub struct LogEventParser {
    current: Option<String>,
}

impl LogEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the device the receiver is currently talking to.
    pub fn current_device(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Parses one line of output.
    pub fn parse_line(&mut self, line: &str) -> Option<BackendEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(name) = authenticated_name(line) {
            tracing::info!(device = %name, "External receiver authenticated device");
            self.current = Some(name.to_string());
        }

        if line.contains(MIRROR_START_MARKER) {
            return self
                .current
                .clone()
                .map(|name| BackendEvent::Connected { name });
        }

        if is_mirror_stop(line) {
            return self
                .current
                .take()
                .map(|name| BackendEvent::Disconnected { name });
        }

        None
    }
}

/// Returns the word following `Authenticated`, if any.
fn authenticated_name(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once(AUTHENTICATED_MARKER)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    rest.split_whitespace().next()
}

fn is_mirror_stop(line: &str) -> bool {
    line.find(MIRROR_COMPONENT)
        .map(|at| line[at + MIRROR_COMPONENT.len()..].contains("stopped"))
        .unwrap_or(false)
}

/// Feeds published on behalf of the external receiver.
pub struct ExternalFeeds {
    registry: Arc<StreamRegistry>,
    active: HashMap<String, FeedId>,
    placeholder: DecodedFrame,
}

impl ExternalFeeds {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self {
            registry,
            active: HashMap::new(),
            placeholder: DecodedFrame::placeholder(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT),
        }
    }

    /// Applies an event to the registry.
    ///
    /// Returns the feed the event touched, if any.
    pub fn apply(&mut self, event: BackendEvent) -> Option<FeedId> {
        match event {
            BackendEvent::Connected { name } => {
                // A device that reconnects gets a fresh feed
                if let Some(old) = self.active.remove(&name) {
                    self.registry.unregister(old);
                }

                let feed_id = self.registry.next_feed_id();
                let client_id = format!("uxplay_{}_{}", name, unix_timestamp());
                if let Err(e) = self.registry.register(feed_id, &name) {
                    tracing::warn!(client_id = %client_id, error = %e, "Refusing external feed");
                    return None;
                }
                tracing::info!(client_id = %client_id, feed_id = %feed_id, "External mirroring started");
                self.registry.update_frame(feed_id, self.placeholder.clone());
                self.active.insert(name, feed_id);
                Some(feed_id)
            }
            BackendEvent::Disconnected { name } => {
                let feed_id = self.active.remove(&name)?;
                self.registry.unregister(feed_id);
                tracing::info!(device = %name, feed_id = %feed_id, "External mirroring stopped");
                Some(feed_id)
            }
            BackendEvent::Frame { name } => {
                let feed_id = *self.active.get(&name)?;
                self.registry
                    .update_frame(feed_id, self.placeholder.clone())
                    .then_some(feed_id)
            }
        }
    }

    /// Issues a [`BackendEvent::Frame`] for every active device.
    pub fn refresh(&mut self) {
        let names: Vec<String> = self.active.keys().cloned().collect();
        for name in names {
            self.apply(BackendEvent::Frame { name });
        }
    }

    /// Unregisters every feed.
    pub fn clear(&mut self) {
        for (_, feed_id) in self.active.drain() {
            self.registry.unregister(feed_id);
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl Drop for ExternalFeeds {
    fn drop(&mut self) {
        self.clear();
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Backend that delegates to an external receiver binary.
#[derive(Debug, Clone)]
pub struct ExternalProcessBackend {
    binary: PathBuf,
    display_name: String,
    extra_args: Vec<String>,
}

impl ExternalProcessBackend {
    pub fn new(binary: PathBuf, display_name: String, extra_args: Vec<String>) -> Self {
        Self {
            binary,
            display_name,
            extra_args,
        }
    }

    /// Command-line arguments passed to the receiver.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            self.display_name.clone(),
            // No audio
            "-p".to_string(),
            "-reset".to_string(),
            "5".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        Command::new(&self.binary)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary.display()))
    }
}

#[async_trait]
impl MirroringBackend for ExternalProcessBackend {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn run(
        &self,
        registry: Arc<StreamRegistry>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut child = self.spawn()?;
        tracing::info!(binary = %self.binary.display(), pid = ?child.id(), "External receiver started");

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        let mut parser = LogEventParser::new();
        let mut feeds = ExternalFeeds::new(registry);
        let mut refresh = tokio::time::interval(PLACEHOLDER_REFRESH);

        let exited = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break None,
                Some(line) = line_rx.recv() => {
                    tracing::debug!(target: "mirrorwall::external", "{}", line);
                    if let Some(event) = parser.parse_line(&line) {
                        feeds.apply(event);
                    }
                }
                _ = refresh.tick() => feeds.refresh(),
                status = child.wait() => break Some(status),
            }
        };
        feeds.clear();

        match exited {
            None => terminate(&mut child).await,
            Some(status) => {
                let status = status.context("Failed to wait for external receiver")?;
                anyhow::bail!("External receiver exited unexpectedly: {}", status)
            }
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Sends SIGTERM, waits [`TERMINATE_GRACE_PERIOD`], then kills.
async fn terminate(child: &mut Child) -> anyhow::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
    }

    match tokio::time::timeout(TERMINATE_GRACE_PERIOD, child.wait()).await {
        Ok(status) => {
            let status = status.context("Failed to wait for external receiver")?;
            tracing::info!(%status, "External receiver stopped");
            Ok(())
        }
        Err(_) => {
            tracing::warn!(pid, "External receiver ignored SIGTERM, killing");
            child
                .kill()
                .await
                .context("Failed to kill external receiver")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_tracks_device_lifecycle() {
        let mut parser = LogEventParser::new();
        assert_eq!(parser.parse_line("raop_ntp starting"), None);
        assert_eq!(parser.parse_line("Authenticated Kitchen-iPad via pin"), None);
        assert_eq!(parser.current_device(), Some("Kitchen-iPad"));

        assert_eq!(
            parser.parse_line("raop_rtp_mirror starting mirroring"),
            Some(BackendEvent::Connected {
                name: "Kitchen-iPad".to_string()
            })
        );
        assert_eq!(
            parser.parse_line("raop_rtp_mirror: video stream stopped"),
            Some(BackendEvent::Disconnected {
                name: "Kitchen-iPad".to_string()
            })
        );
        assert_eq!(parser.current_device(), None);
    }

    #[test]
    fn test_parser_ignores_start_without_device() {
        let mut parser = LogEventParser::new();
        assert_eq!(parser.parse_line("raop_rtp_mirror starting mirroring"), None);
        assert_eq!(parser.parse_line("raop_rtp_mirror stopped"), None);
    }

    #[test]
    fn test_parser_requires_whitespace_after_marker() {
        let mut parser = LogEventParser::new();
        parser.parse_line("AuthenticatedX nobody");
        assert_eq!(parser.current_device(), None);
        parser.parse_line("  Authenticated   Phone  ");
        assert_eq!(parser.current_device(), Some("Phone"));
    }

    #[test]
    fn test_stop_must_follow_component() {
        assert!(is_mirror_stop("raop_rtp_mirror thread stopped"));
        assert!(!is_mirror_stop("stopped raop_rtp_mirror"));
        assert!(!is_mirror_stop("raop_rtp stopped"));
    }

    #[test]
    fn test_feeds_follow_events() {
        let registry = Arc::new(StreamRegistry::new(4));
        let mut feeds = ExternalFeeds::new(Arc::clone(&registry));

        let first = feeds
            .apply(BackendEvent::Connected {
                name: "Phone".to_string(),
            })
            .unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].display_name, "Phone");
        assert!(snapshot[0].latest_frame.as_ref().unwrap().is_placeholder());

        assert_eq!(
            feeds.apply(BackendEvent::Frame {
                name: "Phone".to_string()
            }),
            Some(first)
        );

        // Reconnect gets a new feed
        let second = feeds
            .apply(BackendEvent::Connected {
                name: "Phone".to_string(),
            })
            .unwrap();
        assert!(second > first);
        assert_eq!(registry.len(), 1);

        feeds.apply(BackendEvent::Disconnected {
            name: "Phone".to_string(),
        });
        assert!(registry.is_empty());
        assert!(feeds.is_empty());
    }

    #[test]
    fn test_feeds_respect_capacity() {
        let registry = Arc::new(StreamRegistry::new(1));
        let mut feeds = ExternalFeeds::new(Arc::clone(&registry));
        feeds.apply(BackendEvent::Connected { name: "a".into() });
        assert_eq!(feeds.apply(BackendEvent::Connected { name: "b".into() }), None);
        assert_eq!(feeds.len(), 1);

        drop(feeds);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_args_include_name() {
        let backend = ExternalProcessBackend::new(
            PathBuf::from("uxplay"),
            "Wall".to_string(),
            vec!["-fs".to_string()],
        );
        assert_eq!(backend.args(), ["-n", "Wall", "-p", "-reset", "5", "-fs"]);
    }

    #[tokio::test]
    async fn test_run_registers_feed_until_shutdown() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-receiver");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'Authenticated Phone'\necho 'raop_rtp_mirror starting mirroring'\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = ExternalProcessBackend::new(script, "Wall".to_string(), Vec::new());
        let registry = Arc::new(StreamRegistry::new(4));
        let shutdown = CancellationToken::new();
        let task = {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { backend.run(registry, shutdown).await })
        };

        for _ in 0..100 {
            if !registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(registry.snapshot()[0].display_name, "Phone");

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }
}
