//! Observational hooks for sessions, connections and peer links
//!
//! The core only ever calls into a [`MetricsSink`]; nothing it returns
//! feeds back into session behavior.

use parking_lot::Mutex;

/// Receiver of session events. Every method defaults to a no-op.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn session_added(&self, _client_key: &str, _peer: bool) {}

    fn session_removed(&self, _client_key: &str, _peer: bool) {}

    fn connection_added(&self, _client_key: &str, _proto: &str, _address: &str) {}

    fn connection_removed(&self, _client_key: &str, _proto: &str, _address: &str) {}

    fn bytes_transmitted(&self, _client_key: &str, _bytes: usize) {}

    fn bytes_transmit_error(&self, _client_key: &str, _bytes: usize) {}

    fn bytes_received(&self, _client_key: &str, _bytes: usize) {}

    fn peer_attempt(&self, _peer: &str) {}

    fn peer_connected(&self, _peer: &str) {}

    fn peer_disconnected(&self, _peer: &str) {}

    /// Seconds spent waiting on the transport since the last pong or error
    fn liveness_elapsed(&self, _seconds: f64) {}

    /// One transport message of the given kind was read
    fn transport_message(&self, _kind: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    SessionAdded { client_key: String, peer: bool },
    SessionRemoved { client_key: String, peer: bool },
    ConnectionAdded { client_key: String, proto: String, address: String },
    ConnectionRemoved { client_key: String, proto: String, address: String },
    BytesTransmitted { client_key: String, bytes: usize },
    BytesTransmitError { client_key: String, bytes: usize },
    BytesReceived { client_key: String, bytes: usize },
    PeerAttempt(String),
    PeerConnected(String),
    PeerDisconnected(String),
    LivenessElapsed(f64),
    TransportMessage(String),
}

/// Keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Liveness samples recorded so far
    pub fn liveness_samples(&self) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                MetricEvent::LivenessElapsed(seconds) => Some(*seconds),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: MetricEvent) {
        self.events.lock().push(event);
    }
}

impl MetricsSink for RecordingMetrics {
    fn session_added(&self, client_key: &str, peer: bool) {
        self.push(MetricEvent::SessionAdded {
            client_key: client_key.to_string(),
            peer,
        });
    }

    fn session_removed(&self, client_key: &str, peer: bool) {
        self.push(MetricEvent::SessionRemoved {
            client_key: client_key.to_string(),
            peer,
        });
    }

    fn connection_added(&self, client_key: &str, proto: &str, address: &str) {
        self.push(MetricEvent::ConnectionAdded {
            client_key: client_key.to_string(),
            proto: proto.to_string(),
            address: address.to_string(),
        });
    }

    fn connection_removed(&self, client_key: &str, proto: &str, address: &str) {
        self.push(MetricEvent::ConnectionRemoved {
            client_key: client_key.to_string(),
            proto: proto.to_string(),
            address: address.to_string(),
        });
    }

    fn bytes_transmitted(&self, client_key: &str, bytes: usize) {
        self.push(MetricEvent::BytesTransmitted {
            client_key: client_key.to_string(),
            bytes,
        });
    }

    fn bytes_transmit_error(&self, client_key: &str, bytes: usize) {
        self.push(MetricEvent::BytesTransmitError {
            client_key: client_key.to_string(),
            bytes,
        });
    }

    fn bytes_received(&self, client_key: &str, bytes: usize) {
        self.push(MetricEvent::BytesReceived {
            client_key: client_key.to_string(),
            bytes,
        });
    }

    fn peer_attempt(&self, peer: &str) {
        self.push(MetricEvent::PeerAttempt(peer.to_string()));
    }

    fn peer_connected(&self, peer: &str) {
        self.push(MetricEvent::PeerConnected(peer.to_string()));
    }

    fn peer_disconnected(&self, peer: &str) {
        self.push(MetricEvent::PeerDisconnected(peer.to_string()));
    }

    fn liveness_elapsed(&self, seconds: f64) {
        self.push(MetricEvent::LivenessElapsed(seconds));
    }

    fn transport_message(&self, kind: &str) {
        self.push(MetricEvent::TransportMessage(kind.to_string()));
    }
}

// Metric names, kept stable for existing dashboards.

/// Sessions added (counter, labels: clientkey, peer).
pub const TOTAL_ADD_WEBSOCKET_SESSION: &str = "session_server_total_add_websocket_session";
/// Sessions removed (counter, labels: clientkey, peer).
pub const TOTAL_REMOVE_WEBSOCKET_SESSION: &str = "session_server_total_remove_websocket_session";
/// Logical connections added (counter, labels: clientkey, proto, addr).
pub const TOTAL_ADD_CONNECTIONS: &str = "session_server_total_add_connections";
/// Logical connections removed (counter, labels: clientkey, proto, addr).
pub const TOTAL_REMOVE_CONNECTIONS: &str = "session_server_total_remove_connections";
/// Bytes written to logical connections (counter, labels: clientkey).
pub const TOTAL_TRANSMIT_BYTES: &str = "session_server_total_transmit_bytes";
/// Bytes whose write failed (counter, labels: clientkey).
pub const TOTAL_TRANSMIT_ERROR_BYTES: &str = "session_server_total_transmit_error_bytes";
/// Bytes received for logical connections (counter, labels: clientkey).
pub const TOTAL_RECEIVE_BYTES: &str = "session_server_total_receive_bytes";
/// Peer link attempts (counter, labels: peer).
pub const TOTAL_PEER_WS_ATTEMPT: &str = "session_server_total_peer_ws_attempt";
/// Peer links established (counter, labels: peer).
pub const TOTAL_PEER_WS_CONNECTED: &str = "session_server_total_peer_ws_connected";
/// Peer links lost (counter, labels: peer).
pub const TOTAL_PEER_WS_DISCONNECTED: &str = "session_server_total_peer_ws_disconnected";
/// Seconds waited between pongs or errors (histogram).
pub const SECONDS_ELAPSED_AFTER_PONG_OR_ERR: &str = "session_server_seconds_elapsed_after_pong_or_err";
/// Transport messages read (counter, labels: type).
pub const TOTAL_MESSAGE_TYPE: &str = "session_server_total_websocket_message_type";

/// Liveness histogram buckets (seconds)
pub const LIVENESS_BUCKETS: &[f64] = &[15.0, 30.0, 45.0, 60.0];

/// Records through the `metrics` facade; install an exporter (for example
/// `metrics-exporter-prometheus`) to publish them
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    pub fn new() -> Self {
        metrics::describe_counter!(TOTAL_ADD_WEBSOCKET_SESSION, "Total count of added websocket sessions");
        metrics::describe_counter!(TOTAL_REMOVE_WEBSOCKET_SESSION, "Total count of removed websocket sessions");
        metrics::describe_counter!(TOTAL_ADD_CONNECTIONS, "Total count of added connections");
        metrics::describe_counter!(TOTAL_REMOVE_CONNECTIONS, "Total count of removed connections");
        metrics::describe_counter!(TOTAL_TRANSMIT_BYTES, "Total bytes transmitted");
        metrics::describe_counter!(TOTAL_TRANSMIT_ERROR_BYTES, "Total bytes of failed transmissions");
        metrics::describe_counter!(TOTAL_RECEIVE_BYTES, "Total bytes received");
        metrics::describe_counter!(TOTAL_PEER_WS_ATTEMPT, "Total count of attempts to connect to peers");
        metrics::describe_counter!(TOTAL_PEER_WS_CONNECTED, "Total count of connected peer sessions");
        metrics::describe_counter!(TOTAL_PEER_WS_DISCONNECTED, "Total count of disconnected peer sessions");
        metrics::describe_histogram!(
            SECONDS_ELAPSED_AFTER_PONG_OR_ERR,
            metrics::Unit::Seconds,
            "The seconds elapsed after receiving a pong or an error"
        );
        metrics::describe_counter!(TOTAL_MESSAGE_TYPE, "Total count of transport messages by type");
        Self
    }
}

fn peer_label(peer: bool) -> &'static str {
    if peer {
        "true"
    } else {
        "false"
    }
}

impl MetricsSink for PrometheusMetrics {
    fn session_added(&self, client_key: &str, peer: bool) {
        metrics::counter!(TOTAL_ADD_WEBSOCKET_SESSION, "clientkey" => client_key.to_string(), "peer" => peer_label(peer))
            .increment(1);
    }

    fn session_removed(&self, client_key: &str, peer: bool) {
        metrics::counter!(TOTAL_REMOVE_WEBSOCKET_SESSION, "clientkey" => client_key.to_string(), "peer" => peer_label(peer))
            .increment(1);
    }

    fn connection_added(&self, client_key: &str, proto: &str, address: &str) {
        metrics::counter!(
            TOTAL_ADD_CONNECTIONS,
            "clientkey" => client_key.to_string(),
            "proto" => proto.to_string(),
            "addr" => address.to_string()
        )
        .increment(1);
    }

    fn connection_removed(&self, client_key: &str, proto: &str, address: &str) {
        metrics::counter!(
            TOTAL_REMOVE_CONNECTIONS,
            "clientkey" => client_key.to_string(),
            "proto" => proto.to_string(),
            "addr" => address.to_string()
        )
        .increment(1);
    }

    fn bytes_transmitted(&self, client_key: &str, bytes: usize) {
        metrics::counter!(TOTAL_TRANSMIT_BYTES, "clientkey" => client_key.to_string()).increment(bytes as u64);
    }

    fn bytes_transmit_error(&self, client_key: &str, bytes: usize) {
        metrics::counter!(TOTAL_TRANSMIT_ERROR_BYTES, "clientkey" => client_key.to_string()).increment(bytes as u64);
    }

    fn bytes_received(&self, client_key: &str, bytes: usize) {
        metrics::counter!(TOTAL_RECEIVE_BYTES, "clientkey" => client_key.to_string()).increment(bytes as u64);
    }

    fn peer_attempt(&self, peer: &str) {
        metrics::counter!(TOTAL_PEER_WS_ATTEMPT, "peer" => peer.to_string()).increment(1);
    }

    fn peer_connected(&self, peer: &str) {
        metrics::counter!(TOTAL_PEER_WS_CONNECTED, "peer" => peer.to_string()).increment(1);
    }

    fn peer_disconnected(&self, peer: &str) {
        metrics::counter!(TOTAL_PEER_WS_DISCONNECTED, "peer" => peer.to_string()).increment(1);
    }

    fn liveness_elapsed(&self, seconds: f64) {
        metrics::histogram!(SECONDS_ELAPSED_AFTER_PONG_OR_ERR).record(seconds);
    }

    fn transport_message(&self, kind: &str) {
        metrics::counter!(TOTAL_MESSAGE_TYPE, "type" => kind.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_metrics_keeps_order() {
        let metrics = RecordingMetrics::new();
        metrics.session_added("agent-1", false);
        metrics.liveness_elapsed(12.5);
        metrics.peer_connected("server-b");

        assert_eq!(
            metrics.events(),
            vec![
                MetricEvent::SessionAdded {
                    client_key: "agent-1".to_string(),
                    peer: false
                },
                MetricEvent::LivenessElapsed(12.5),
                MetricEvent::PeerConnected("server-b".to_string()),
            ]
        );
        assert_eq!(metrics.liveness_samples(), vec![12.5]);

        metrics.clear();
        assert!(metrics.events().is_empty());
    }

    #[test]
    fn test_prometheus_metrics_without_recorder() {
        // No recorder installed: every call is a no-op
        let metrics = PrometheusMetrics::new();
        metrics.session_added("agent-1", true);
        metrics.bytes_received("agent-1", 42);
        metrics.liveness_elapsed(3.0);
    }
}
