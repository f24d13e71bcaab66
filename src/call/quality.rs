//! Quality Monitor
//!
//! Tastet die Transport-Statistik periodisch ab, leitet aus den Deltas
//! Loss-Prozent und Bitrate ab und klassifiziert das Ergebnis über die
//! feste Schwellen-Tabelle. Jeder Tick geht als Sample an die State
//! Machine — auch bei unverändertem Level; ob daraus eine Recovery
//! wird, entscheidet die State Machine, nicht der Monitor.

use crate::transport::{PeerLink, RawTransportStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// QUALITY LEVEL
// ============================================================================

/// Diskretes Qualitäts-Level eines Samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLevel {
    /// Reine Funktion über (Loss-Prozent, Round-Trip-Latenz) — die
    /// einzige Stelle, an der die Schwellwerte existieren. Kein
    /// Gedächtnis, keine Hysterese.
    pub fn classify(packet_loss_pct: f64, round_trip_ms: f64) -> Self {
        if packet_loss_pct > 5.0 || round_trip_ms > 300.0 {
            QualityLevel::Poor
        } else if packet_loss_pct > 2.0 || round_trip_ms > 150.0 {
            QualityLevel::Fair
        } else if packet_loss_pct > 1.0 || round_trip_ms > 100.0 {
            QualityLevel::Good
        } else {
            QualityLevel::Excellent
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityLevel::Excellent => f.write_str("excellent"),
            QualityLevel::Good => f.write_str("good"),
            QualityLevel::Fair => f.write_str("fair"),
            QualityLevel::Poor => f.write_str("poor"),
        }
    }
}

// ============================================================================
// QUALITY SAMPLE
// ============================================================================

/// Ein Messpunkt; nur das jeweils letzte Sample wird gehalten
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    pub bitrate_kbps: f64,
    pub packet_loss_pct: f64,
    pub round_trip_ms: f64,
    pub jitter_ms: f64,
    pub level: QualityLevel,
}

impl QualitySample {
    /// Sample aus zwei aufeinanderfolgenden Roh-Messungen
    ///
    /// Ohne Vorgänger-Messung zählen die kumulativen Werte als Delta.
    pub fn from_raw(
        prev: Option<&RawTransportStats>,
        raw: &RawTransportStats,
        elapsed: Duration,
    ) -> Self {
        let zero = RawTransportStats::default();
        let prev = prev.unwrap_or(&zero);

        let bytes_delta = raw.bytes_sent.saturating_sub(prev.bytes_sent);
        let sent_delta = raw.packets_sent.saturating_sub(prev.packets_sent);
        let lost_delta = raw.packets_lost.saturating_sub(prev.packets_lost);

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let bitrate_kbps = bytes_delta as f64 * 8.0 / 1000.0 / secs;

        let packet_loss_pct = if sent_delta > 0 {
            (lost_delta as f64 / sent_delta as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        Self {
            bitrate_kbps,
            packet_loss_pct,
            round_trip_ms: raw.round_trip_ms,
            jitter_ms: raw.jitter_ms,
            level: QualityLevel::classify(packet_loss_pct, raw.round_trip_ms),
        }
    }
}

// ============================================================================
// QUALITY MONITOR
// ============================================================================

/// Periodischer Abtaster der Transport-Statistik
#[derive(Debug, Default)]
pub struct QualityMonitor {
    task: Option<JoinHandle<()>>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet die Abtastung; ein schon laufender Monitor wird ersetzt
    pub fn start(
        &mut self,
        link: Arc<dyn PeerLink>,
        interval: Duration,
        tx: mpsc::Sender<QualitySample>,
    ) {
        self.stop();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Der erste Interval-Tick feuert sofort — überspringen,
            // damit Samples sauber im Raster liegen
            ticker.tick().await;

            let mut prev: Option<RawTransportStats> = None;
            loop {
                ticker.tick().await;

                match link.stats().await {
                    Ok(raw) => {
                        let sample = QualitySample::from_raw(prev.as_ref(), &raw, interval);
                        prev = Some(raw);
                        if tx.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Tick überspringen, Timer läuft weiter
                        tracing::warn!("Skipping quality sample: {}", e);
                    }
                }
            }
        });

        self.task = Some(task);
    }

    /// Stoppt die Abtastung; idempotent
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
