//! Per-link round-trip metrics derived from ping/pong.

use std::collections::VecDeque;

/// Number of RTT samples kept for jitter.
pub const RTT_WINDOW: usize = 10;

/// Coarse link quality grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    /// Composite score >= 90
    Excellent,
    /// Composite score >= 70
    Good,
    /// Composite score >= 50
    Poor,
    /// Composite score >= 30
    Unstable,
    /// Anything lower
    Critical,
}

/// RTT history and ping accounting for one link.
#[derive(Debug, Clone, Default)]
pub struct LinkMetrics {
    rtt_history: VecDeque<u64>,
    pings_sent: u64,
    pings_lost: u64,
}

impl LinkMetrics {
    /// Count an outgoing ping.
    pub fn record_ping(&mut self) {
        self.pings_sent += 1;
    }

    /// Record the RTT of an answered ping.
    pub fn record_rtt(&mut self, rtt_ms: u64) {
        self.rtt_history.push_back(rtt_ms);
        if self.rtt_history.len() > RTT_WINDOW {
            self.rtt_history.pop_front();
        }
    }

    /// Count a ping whose pong never arrived in time.
    pub fn record_loss(&mut self) {
        self.pings_lost += 1;
    }

    /// Most recent RTT in milliseconds.
    pub fn last_rtt_ms(&self) -> Option<u64> {
        self.rtt_history.back().copied()
    }

    /// Standard deviation of the RTT window; zero with fewer than two samples.
    pub fn jitter_ms(&self) -> f64 {
        if self.rtt_history.len() < 2 {
            return 0.0;
        }
        let n = self.rtt_history.len() as f64;
        let mean = self.rtt_history.iter().sum::<u64>() as f64 / n;
        let variance =
            self.rtt_history.iter().map(|&rtt| (rtt as f64 - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt()
    }

    /// Percentage of pings that went unanswered.
    pub fn packet_loss_percent(&self) -> f64 {
        if self.pings_sent == 0 {
            return 0.0;
        }
        self.pings_lost as f64 * 100.0 / self.pings_sent as f64
    }

    /// Quality grade, `None` until the first RTT sample.
    pub fn quality(&self) -> Option<LinkQuality> {
        let rtt = self.last_rtt_ms()?;
        Some(grade(rtt, self.packet_loss_percent(), self.jitter_ms()))
    }
}

/// Weighted score: RTT 40%, loss 35%, jitter 25%.
pub fn grade(rtt_ms: u64, loss_percent: f64, jitter_ms: f64) -> LinkQuality {
    let rtt_score = match rtt_ms {
        0..50 => 100.0,
        50..100 => 80.0,
        100..200 => 60.0,
        200..500 => 40.0,
        _ => 20.0,
    };
    let loss_score = step_score(loss_percent, [0.5, 1.0, 3.0, 10.0]);
    let jitter_score = step_score(jitter_ms, [10.0, 20.0, 50.0, 100.0]);

    let composite = rtt_score * 0.4 + loss_score * 0.35 + jitter_score * 0.25;
    if composite >= 90.0 {
        LinkQuality::Excellent
    } else if composite >= 70.0 {
        LinkQuality::Good
    } else if composite >= 50.0 {
        LinkQuality::Poor
    } else if composite >= 30.0 {
        LinkQuality::Unstable
    } else {
        LinkQuality::Critical
    }
}

fn step_score(value: f64, thresholds: [f64; 4]) -> f64 {
    const SCORES: [f64; 4] = [100.0, 80.0, 60.0, 40.0];
    thresholds.iter().zip(SCORES).find(|(limit, _)| value < **limit).map_or(20.0, |(_, s)| s)
}
