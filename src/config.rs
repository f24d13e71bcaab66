//! Engine-Konfiguration
//!
//! Timings und ICE-Server. Die Traversal-Server kommen über einen
//! `IceServerProvider` — eine opake, auffrischbare Konfigurationsquelle,
//! die pro Anruf neu befragt wird (TURN-Credentials laufen ab).

use async_trait::async_trait;
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN-Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

/// Liefert die aktuell gültigen Traversal-Server
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn ice_servers(&self) -> Vec<RTCIceServer>;
}

/// Statische Server-Liste (STUN, optional TURN)
#[derive(Debug, Clone)]
pub struct StaticIceServers {
    servers: Vec<RTCIceServer>,
}

impl StaticIceServers {
    pub fn new(servers: Vec<RTCIceServer>) -> Self {
        Self { servers }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }
}

impl Default for StaticIceServers {
    fn default() -> Self {
        Self::new(default_ice_servers())
    }
}

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.servers.clone()
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Konfiguration der Call-Engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Abtast-Intervall des Quality Monitors
    pub quality_interval: Duration,

    /// Karenzzeit nach `disconnected`, bevor Recovery startet
    pub disconnect_grace: Duration,

    /// Obergrenze für einen Recovery-Versuch, danach `failed`
    pub recovery_ceiling: Duration,

    /// So viele Poor-Samples in Folge lösen Recovery aus
    pub poor_streak_limit: u32,

    /// Kapazität des Engine-Event-Broadcasts
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quality_interval: Duration::from_millis(2000),
            disconnect_grace: Duration::from_secs(3),
            recovery_ceiling: Duration::from_secs(15),
            poor_streak_limit: 4,
            event_capacity: 100,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn turn_server_is_appended_with_credentials() {
        let provider = StaticIceServers::default().with_turn_server(
            "turn:turn.example.com:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        );

        let servers = provider.ice_servers().await;
        assert_eq!(servers.len(), 2);

        let turn = &servers[1];
        assert_eq!(turn.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(turn.username, "user");
        assert_eq!(turn.credential, "secret");
    }
}
