//! One capture session: listener, flush loop and the log they share.
//!
//! A session is created when capture starts and consumed by
//! [`CaptureSession::stop`]; nothing outlives it except what the sink
//! already received and the returned [`SessionReport`]. Dropping a session
//! without stopping it cancels both loops.

use std::net::SocketAddr;

use chrono::Local;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::aggregator::{AggregatorHandle, LogAggregator};
use crate::config::{Config, Mode};
use crate::error::Result;
use crate::forward::{ForwardNotice, Forwarder};
use crate::model::{DecodedPacket, ExporterStats, LogEntry};
use crate::network::{ListenerStats, PacketListener};
use crate::pattern::PatternExtractor;

/// Receives rendered log text, at most once per flush.
///
/// Called from the flush loop; implementations should not block.
pub trait TextSink: Send + 'static {
    fn on_decoded_text(&mut self, text: String);
}

impl<F> TextSink for F
where
    F: FnMut(String) + Send + 'static,
{
    fn on_decoded_text(&mut self, text: String) {
        self(text)
    }
}

/// What a stopped session leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub listener: ListenerStats,
    /// Final log buffer contents.
    pub log: String,
}

pub struct CaptureSession {
    mode: Mode,
    listener: PacketListener,
    log: AggregatorHandle,
    flush_guard: DropGuard,
    flush_task: JoinHandle<LogAggregator>,
}

impl CaptureSession {
    pub async fn start<S: TextSink>(config: &Config, sink: S) -> Result<Self> {
        Self::start_with_notices(config, sink, None).await
    }

    /// Start a session. Forwarding outcomes, if any, are published on
    /// `notices`.
    pub async fn start_with_notices<S: TextSink>(
        config: &Config,
        sink: S,
        notices: Option<UnboundedSender<ForwardNotice>>,
    ) -> Result<Self> {
        config.validate()?;

        let extractor = match config.mode {
            Mode::Raw => None,
            Mode::Pattern => Some(PatternExtractor::new(
                &config.start_marker,
                &config.end_marker,
            )?),
        };
        let forwarder = match (&extractor, &config.forward_url) {
            (Some(_), Some(url)) => {
                let forwarder = Forwarder::new(url.as_str())?;
                log::info!("Forwarding matches to {}", forwarder.url());
                Some(match notices {
                    Some(tx) => forwarder.with_notices(tx),
                    None => forwarder,
                })
            }
            _ => None,
        };

        let aggregator = LogAggregator::new(config.max_log_buffer, config.update_interval());
        let log = aggregator.handle();
        if config.mode == Mode::Raw {
            log.append(LogEntry::text(format!(
                "=== CAPTURE STARTED AT {} ===\nTarget App: {}\n\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                config.target_app
            )));
        }

        let mut listener = PacketListener::new(config.listener());
        let append = aggregator.handle();
        listener
            .start(move |packet: DecodedPacket| {
                route(&packet, extractor.as_ref(), forwarder.as_ref(), &append);
            })
            .await?;

        let cancel = CancellationToken::new();
        let flush_task = tokio::spawn(flush_loop(aggregator, config.mode, sink, cancel.clone()));

        Ok(Self {
            mode: config.mode,
            listener,
            log,
            flush_guard: cancel.drop_guard(),
            flush_task,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> ListenerStats {
        self.listener.stats()
    }

    /// Append side of the session log, for orchestrator notes.
    pub fn log(&self) -> &AggregatorHandle {
        &self.log
    }

    /// Stop receiving, append the closing banner (and exporter statistics
    /// when given), deliver a final flush and return the report. The sink is
    /// not called after this returns.
    pub async fn stop(self, exporter: Option<ExporterStats>) -> Result<SessionReport> {
        let CaptureSession {
            mode,
            mut listener,
            log,
            flush_guard,
            flush_task,
        } = self;

        let listener_stats = listener.stop().await;

        if mode == Mode::Raw {
            log.append(LogEntry::text(format!(
                "=== CAPTURE STOPPED AT {} ===\n",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            )));
            if let Some(stats) = exporter {
                log.append(stats.to_entry());
            }
        }

        drop(flush_guard);
        let aggregator = flush_task.await?;

        Ok(SessionReport {
            listener: listener_stats,
            log: aggregator.buffer().as_str().to_string(),
        })
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("mode", &self.mode)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

fn route(
    packet: &DecodedPacket,
    extractor: Option<&PatternExtractor>,
    forwarder: Option<&Forwarder>,
    entries: &AggregatorHandle,
) {
    let Some(extractor) = extractor else {
        entries.append(LogEntry::packet(packet));
        return;
    };

    if let Some(found) = extractor.extract(&packet.payload) {
        log::debug!("Pattern match from {}: {}", packet.source, found);
        entries.append(LogEntry::matched(&found));
        if let Some(forwarder) = forwarder {
            forwarder.forward(found);
        }
    }
}

async fn flush_loop<S: TextSink>(
    mut aggregator: LogAggregator,
    mode: Mode,
    mut sink: S,
    cancel: CancellationToken,
) -> LogAggregator {
    let handle = aggregator.handle();
    let period = handle.interval();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = handle.flush_requested() => {}
        }
        render(&mut aggregator, mode, &mut sink);
    }

    render(&mut aggregator, mode, &mut sink);
    aggregator
}

fn render<S: TextSink>(aggregator: &mut LogAggregator, mode: Mode, sink: &mut S) {
    let Some(flush) = aggregator.flush() else {
        return;
    };
    let text = match mode {
        Mode::Raw => flush.text,
        Mode::Pattern => flush.latest.trim_end().to_string(),
    };
    sink.on_decoded_text(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn test_config(mode: Mode) -> Config {
        Config {
            port: 0,
            bind_address: "127.0.0.1".parse().unwrap(),
            mode,
            update_interval_ms: 50,
            export_format: crate::decoder::ExportFormat::Raw,
            ..Config::default()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(String) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (seen, move |text| sink_seen.lock().unwrap().push(text))
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (_, sink) = recorder();
        let config = Config {
            update_interval_ms: 0,
            ..test_config(Mode::Raw)
        };
        assert!(CaptureSession::start(&config, sink).await.is_err());
    }

    #[tokio::test]
    async fn test_banners_and_stats_in_final_log() {
        let (seen, sink) = recorder();
        let mut config = test_config(Mode::Raw);
        config.target_app = "com.example.app".to_string();

        let session = CaptureSession::start(&config, sink).await.unwrap();
        let report = session
            .stop(Some(ExporterStats {
                packets_received: 7,
                ..Default::default()
            }))
            .await
            .unwrap();

        assert!(report.log.starts_with("=== CAPTURE STARTED AT "));
        assert!(report.log.contains("Target App: com.example.app\n\n"));
        assert!(report.log.contains("=== CAPTURE STOPPED AT "));
        assert!(report.log.contains("Packets received: 7\n"));
        assert_eq!(seen.lock().unwrap().last(), Some(&report.log));
    }

    #[tokio::test]
    async fn test_notes_appended_through_log_handle() {
        let (_, sink) = recorder();
        let session = CaptureSession::start(&test_config(Mode::Raw), sink)
            .await
            .unwrap();
        session.log().append(LogEntry::text("exporter restarted\n"));

        let report = session.stop(None).await.unwrap();
        let note = report.log.find("exporter restarted\n").unwrap();
        assert!(note < report.log.find("=== CAPTURE STOPPED AT ").unwrap());
    }

    #[tokio::test]
    async fn test_no_sink_calls_after_stop() {
        let (seen, sink) = recorder();
        let config = test_config(Mode::Raw);

        let session = CaptureSession::start(&config, sink).await.unwrap();
        session.stop(None).await.unwrap();
        let calls = seen.lock().unwrap().len();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.lock().unwrap().len(), calls);
    }
}
