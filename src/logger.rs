use tracing_subscriber::{filter::LevelFilter, fmt::time::ChronoLocal, EnvFilter};

use crate::config::{DEFAULT_LOG_FILTER, LOGGING_ENABLED};
use crate::peer::types::{CandidateKind, IceCandidate};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init() {
    let filter = if LOGGING_ENABLED {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::default().add_directive(LevelFilter::OFF.into())
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_owned()))
        .with_target(true)
        .try_init();
}

/// Trickle-ICE trace of one candidate
pub fn dump_candidate(label: &str, peer: &str, cand: &IceCandidate) {
    tracing::trace!(
        "Trickle {label} [{peer}]: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.username_fragment
    );
}

/// Counts of locally gathered candidates by type
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GatheringSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl GatheringSummary {
    pub fn record(&mut self, cand: &IceCandidate) {
        match cand.kind() {
            CandidateKind::Host => self.host += 1,
            CandidateKind::ServerReflexive => self.srflx += 1,
            CandidateKind::Relay => self.relay += 1,
            CandidateKind::PeerReflexive | CandidateKind::Unknown => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log(&self, peer: &str) {
        tracing::debug!(
            "Candidate analysis [{peer}]: {} host, {} srflx, {} relay",
            self.host,
            self.srflx,
            self.relay
        );
        if self.relay == 0 {
            tracing::warn!("No TURN relay candidates for {peer}; connection through NAT may fail");
        }
    }
}
