//! Stats adapters: normalize each architecture's native stats report into
//! latency, jitter, packet loss and egress readings.
//!
//! Reports arrive as `{"connections":[{"id": …, "stats":[…]}]}`, where each
//! entry is an RTCStats-like object tagged by `type`. The two architectures
//! expose different entries for the same question, so each metric is read
//! through an ordered chain of probes; the first probe with a usable value
//! wins and an exhausted chain is [`StatsUnavailable`], never zero.

use fanout_common::models::Architecture;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsReport {
    #[serde(default)]
    pub connections: Vec<ConnectionStats>,
}

impl StatsReport {
    pub fn parse(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionStats {
    pub id: String,
    #[serde(default)]
    pub stats: Vec<StatsEntry>,
}

/// The subset of RTCStats the adapters read. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum StatsEntry {
    CandidatePair {
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        nominated: bool,
        #[serde(default)]
        current_round_trip_time: Option<f64>,
    },
    RemoteInboundRtp {
        #[serde(default)]
        round_trip_time: Option<f64>,
        #[serde(default)]
        jitter: Option<f64>,
        #[serde(default)]
        packets_lost: Option<i64>,
    },
    InboundRtp {
        #[serde(default)]
        jitter: Option<f64>,
        #[serde(default)]
        packets_lost: Option<i64>,
    },
    OutboundRtp {
        #[serde(default)]
        bytes_sent: Option<u64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{metric} not available")]
pub struct StatsUnavailable {
    pub metric: &'static str,
}

const fn unavailable(metric: &'static str) -> StatsUnavailable {
    StatsUnavailable { metric }
}

/// One way of reading a round-trip time off a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RttProbe {
    /// `remote-inbound-rtp.roundTripTime`, from RTCP receiver reports.
    RemoteInbound,
    /// `currentRoundTripTime` of the nominated candidate pair.
    NominatedPair,
    /// `currentRoundTripTime` of the succeeded (transport) candidate pair.
    ActivePair,
}

impl RttProbe {
    fn read(self, conn: &ConnectionStats) -> Option<f64> {
        conn.stats
            .iter()
            .find_map(|entry| self.value(entry).filter(|rtt| rtt.is_finite() && *rtt > 0.0))
    }

    fn value(self, entry: &StatsEntry) -> Option<f64> {
        match (self, entry) {
            (
                RttProbe::RemoteInbound,
                StatsEntry::RemoteInboundRtp {
                    round_trip_time, ..
                },
            ) => *round_trip_time,
            (
                RttProbe::NominatedPair,
                StatsEntry::CandidatePair {
                    nominated: true,
                    current_round_trip_time,
                    ..
                },
            ) => *current_round_trip_time,
            (
                RttProbe::ActivePair,
                StatsEntry::CandidatePair {
                    state,
                    nominated,
                    current_round_trip_time,
                },
            ) if *nominated || state.as_deref() == Some("succeeded") => *current_round_trip_time,
            _ => None,
        }
    }
}

/// Strategy for reading one architecture's stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsAdapter {
    /// Presenter holds one peer connection per viewer; RTT is end to end.
    DirectPeer,
    /// Presenter holds one send transport to the relay; RTT covers that hop
    /// only and jitter is not observable on the sending side.
    Relay,
}

impl StatsAdapter {
    pub fn for_architecture(architecture: Architecture) -> Self {
        match architecture {
            Architecture::Mesh => StatsAdapter::DirectPeer,
            Architecture::Relay => StatsAdapter::Relay,
        }
    }

    fn rtt_probes(self) -> &'static [RttProbe] {
        match self {
            StatsAdapter::DirectPeer => &[RttProbe::RemoteInbound, RttProbe::NominatedPair],
            StatsAdapter::Relay => &[RttProbe::ActivePair, RttProbe::RemoteInbound],
        }
    }

    /// Round-trip time in milliseconds on one presenter connection.
    pub fn sample_latency(self, conn: &ConnectionStats) -> Result<f64, StatsUnavailable> {
        self.rtt_probes()
            .iter()
            .find_map(|probe| probe.read(conn))
            .map(|secs| secs * 1000.0)
            .ok_or(unavailable("latency"))
    }

    /// Jitter in milliseconds as reported back to the presenter.
    pub fn sample_jitter(self, conn: &ConnectionStats) -> Result<f64, StatsUnavailable> {
        match self {
            StatsAdapter::Relay => Err(unavailable("jitter")),
            StatsAdapter::DirectPeer => conn
                .stats
                .iter()
                .find_map(|entry| match entry {
                    StatsEntry::RemoteInboundRtp { jitter, .. } => *jitter,
                    _ => None,
                })
                .filter(|j| j.is_finite() && *j > 0.0)
                .map(|secs| secs * 1000.0)
                .ok_or(unavailable("jitter")),
        }
    }

    /// Cumulative packets lost on a viewer's receiving connection. Zero is a
    /// valid reading; negative counters (duplicates) clamp to zero.
    pub fn sample_packet_loss(self, conn: &ConnectionStats) -> Result<u64, StatsUnavailable> {
        let mut seen = false;
        let mut total = 0u64;
        for entry in &conn.stats {
            if let StatsEntry::InboundRtp { packets_lost, .. } = entry {
                seen = true;
                total = total.saturating_add(packets_lost.unwrap_or(0).max(0) as u64);
            }
        }
        if seen {
            Ok(total)
        } else {
            Err(unavailable("packets lost"))
        }
    }

    /// Total bytes the presenter has sent over all its connections.
    pub fn sample_resource_usage(self, report: &StatsReport) -> Result<u64, StatsUnavailable> {
        let sent: Vec<u64> = report
            .connections
            .iter()
            .flat_map(|c| c.stats.iter())
            .filter_map(|entry| match entry {
                StatsEntry::OutboundRtp { bytes_sent } => *bytes_sent,
                _ => None,
            })
            .collect();
        if sent.is_empty() {
            return Err(unavailable("bytes sent"));
        }
        Ok(sent.into_iter().fold(0u64, u64::saturating_add))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn(stats: serde_json::Value) -> ConnectionStats {
        serde_json::from_value(json!({"id": "c", "stats": stats})).unwrap()
    }

    #[test]
    fn unknown_entry_types_are_tolerated() {
        let c = conn(json!([
            {"type": "codec", "mimeType": "video/VP8"},
            {"type": "candidate-pair", "nominated": true, "currentRoundTripTime": 0.04}
        ]));
        assert_eq!(c.stats[0], StatsEntry::Other);
        assert_eq!(StatsAdapter::DirectPeer.sample_latency(&c), Ok(40.0));
    }

    #[test]
    fn direct_peer_prefers_remote_inbound_rtt() {
        let c = conn(json!([
            {"type": "candidate-pair", "nominated": true, "currentRoundTripTime": 0.05},
            {"type": "remote-inbound-rtp", "roundTripTime": 0.03, "jitter": 0.006}
        ]));
        let a = StatsAdapter::DirectPeer;
        assert_eq!(a.sample_latency(&c), Ok(30.0));
        assert_eq!(a.sample_jitter(&c), Ok(6.0));
    }

    #[test]
    fn zero_rtt_falls_through_to_next_probe() {
        let c = conn(json!([
            {"type": "remote-inbound-rtp", "roundTripTime": 0.0},
            {"type": "candidate-pair", "nominated": true, "currentRoundTripTime": 0.02}
        ]));
        assert_eq!(StatsAdapter::DirectPeer.sample_latency(&c), Ok(20.0));

        let empty = conn(json!([{"type": "remote-inbound-rtp", "roundTripTime": 0.0}]));
        assert_eq!(
            StatsAdapter::DirectPeer.sample_latency(&empty),
            Err(StatsUnavailable { metric: "latency" })
        );
    }

    #[test]
    fn relay_reads_transport_pair_and_never_jitter() {
        let c = conn(json!([
            {"type": "candidate-pair", "state": "succeeded", "currentRoundTripTime": 0.012},
            {"type": "remote-inbound-rtp", "roundTripTime": 0.09, "jitter": 0.004}
        ]));
        let a = StatsAdapter::Relay;
        assert_eq!(a.sample_latency(&c), Ok(12.0));
        assert!(a.sample_jitter(&c).is_err());
    }

    #[test]
    fn packet_loss_keeps_zero_and_clamps_negative() {
        let a = StatsAdapter::DirectPeer;
        let zero = conn(json!([{"type": "inbound-rtp", "packetsLost": 0}]));
        assert_eq!(a.sample_packet_loss(&zero), Ok(0));
        let negative = conn(json!([{"type": "inbound-rtp", "packetsLost": -3}]));
        assert_eq!(a.sample_packet_loss(&negative), Ok(0));
        let none = conn(json!([{"type": "outbound-rtp", "bytesSent": 10}]));
        assert!(a.sample_packet_loss(&none).is_err());
    }

    #[test]
    fn egress_sums_all_connections() {
        let report = StatsReport::parse(json!({"connections": [
            {"id": "a", "stats": [{"type": "outbound-rtp", "bytesSent": 1000}]},
            {"id": "b", "stats": [{"type": "outbound-rtp", "bytesSent": 500}]}
        ]}))
        .unwrap();
        assert_eq!(StatsAdapter::DirectPeer.sample_resource_usage(&report), Ok(1500));
        assert!(
            StatsAdapter::Relay
                .sample_resource_usage(&StatsReport::default())
                .is_err()
        );
    }
}
