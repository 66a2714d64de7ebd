use std::collections::VecDeque;

use tracing::{info, warn};

use super::types::IceCandidate;

/// Remote candidates received before the remote description was set.
/// Drained in arrival order.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.pending.drain(..)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }
    summary
}

pub fn log_candidate_summary(session: &str, candidates: &[IceCandidate]) {
    if candidates.is_empty() {
        return;
    }
    let s = analyze_candidates(candidates);
    info!(
        session,
        host = s.host,
        srflx = s.srflx,
        relay = s.relay,
        "local candidate summary"
    );
    if s.relay == 0 {
        warn!(session, "no TURN relay candidates gathered; connection through NAT may fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drains_in_arrival_order() {
        let mut q = CandidateQueue::default();
        for i in 0..4 {
            q.push(IceCandidate::new(format!("c{i}")));
        }
        let drained: Vec<String> = q.drain().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["c0", "c1", "c2", "c3"]);
        assert!(q.is_empty());
    }

    #[test]
    fn summary_counts_candidate_types() {
        let cands = vec![
            IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
            IceCandidate::new("candidate:2 1 udp 1 1.2.3.4 5001 typ srflx raddr 10.0.0.1"),
            IceCandidate::new("candidate:3 1 udp 1 5.6.7.8 5002 typ relay raddr 1.2.3.4"),
            IceCandidate::new("candidate:4 1 udp 1 10.0.0.2 5003 typ host"),
        ];
        assert_eq!(
            analyze_candidates(&cands),
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }
}
