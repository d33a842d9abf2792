//! Flush scheduling for input reports relayed over BLE notifications
//!
//! [`Relay`] holds no I/O: the daemon feeds it reports and clock ticks with
//! the current [`Instant`] and sends whatever it reports as due. After a
//! successful send the daemon calls [`Relay::mark_flushed`]; a send that
//! would block leaves the report pending.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::filter::ReportFilter;

/// Relay loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Answering queued attribute protocol calls
    DrainingProtocol,
    /// Waiting on device nodes and the flush timer
    PollingHardware,
    ShuttingDown,
}

/// Why a pending report is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The periodic flush interval elapsed
    Timer,
    /// The interface has no filter, every report is sent
    Unfiltered,
    /// The filter detected a meaningful change
    Filter,
    /// A filter flush was held back and the throttle window is over
    ThrottleExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTiming {
    /// Longest time a pending report waits
    pub flush_interval: Duration,
    /// Shortest time between two filter-triggered flushes
    pub flush_throttle: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
            flush_throttle: Duration::from_millis(20),
        }
    }
}

#[derive(Debug)]
struct InterfaceState {
    filter: Option<&'static ReportFilter<'static>>,
    /// Last value folded in by the filter
    baseline: Vec<u8>,
    /// Latest report not yet sent, empty when nothing is pending
    pending: Vec<u8>,
    last_flush: Instant,
    throttled: bool,
}

impl InterfaceState {
    fn due(&self, now: Instant, timing: &RelayTiming) -> Option<FlushReason> {
        if self.pending.is_empty() {
            return None;
        }
        let since = now.saturating_duration_since(self.last_flush);
        if since >= timing.flush_interval {
            Some(FlushReason::Timer)
        } else if self.throttled && since >= timing.flush_throttle {
            Some(FlushReason::ThrottleExpired)
        } else if self.filter.is_none() {
            // Retry of an unfiltered report whose send would have blocked
            Some(FlushReason::Unfiltered)
        } else {
            None
        }
    }
}

/// Per-interface flush state for every relayed interface
#[derive(Debug)]
pub struct Relay {
    timing: RelayTiming,
    interfaces: Vec<InterfaceState>,
}

impl Relay {
    /// One entry of `filters` per interface
    pub fn new(
        timing: RelayTiming,
        filters: Vec<Option<&'static ReportFilter<'static>>>,
        now: Instant,
    ) -> Self {
        let interfaces = filters
            .into_iter()
            .map(|filter| InterfaceState {
                filter,
                baseline: vec![0; filter.map(|f| f.report_size).unwrap_or(0)],
                pending: Vec::new(),
                last_flush: now,
                throttled: false,
            })
            .collect();
        Self { timing, interfaces }
    }

    pub fn timing(&self) -> &RelayTiming {
        &self.timing
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Bytes waiting to be sent on `iface`
    pub fn pending(&self, iface: usize) -> &[u8] {
        &self.interfaces[iface].pending
    }

    /// Take in a report read from the device. Returns a reason when the
    /// pending report should be sent now.
    pub fn on_report(&mut self, iface: usize, report: &[u8], now: Instant) -> Option<FlushReason> {
        let timing = self.timing;
        let state = &mut self.interfaces[iface];
        state.pending.clear();
        state.pending.extend_from_slice(report);

        let since = now.saturating_duration_since(state.last_flush);
        if since >= timing.flush_interval {
            debug!("Timeout triggering flush on interface {iface}");
            if state.baseline.len() == report.len() {
                state.baseline.copy_from_slice(report);
            }
            return Some(FlushReason::Timer);
        }

        let Some(filter) = state.filter else {
            return Some(FlushReason::Unfiltered);
        };

        if filter.evaluate(&mut state.baseline, report) {
            debug!("Filter triggering flush on interface {iface}");
            if since < timing.flush_throttle {
                debug!("Flushing too fast, throttling...");
                state.throttled = true;
                return None;
            }
            return Some(FlushReason::Filter);
        }

        if state.throttled && since >= timing.flush_throttle {
            return Some(FlushReason::ThrottleExpired);
        }
        None
    }

    /// Interfaces whose pending report became due without a new report
    pub fn on_tick(&mut self, now: Instant) -> Vec<(usize, FlushReason)> {
        let timing = self.timing;
        self.interfaces
            .iter()
            .enumerate()
            .filter_map(|(i, state)| state.due(now, &timing).map(|reason| (i, reason)))
            .collect()
    }

    /// Record a completed send of the pending report
    pub fn mark_flushed(&mut self, iface: usize, now: Instant) {
        let state = &mut self.interfaces[iface];
        state.pending.clear();
        state.last_flush = now;
        state.throttled = false;
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) can report
    /// something, given what is pending now
    pub fn next_deadline(&self) -> Option<Instant> {
        self.interfaces
            .iter()
            .filter(|s| !s.pending.is_empty())
            .map(|s| {
                if s.throttled {
                    s.last_flush + self.timing.flush_throttle
                } else {
                    s.last_flush + self.timing.flush_interval
                }
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AnalogChannel, DECK_FILTER};

    const MS: Duration = Duration::from_millis(1);

    static ANALOG_ONLY: ReportFilter<'static> = ReportFilter {
        report_size: 8,
        priority_mask: &[0xFF, 0, 0, 0, 0, 0, 0, 0],
        analog: &[AnalogChannel {
            offset: 4,
            width: 2,
            threshold: 0x100,
        }],
    };

    fn relay(filter: Option<&'static ReportFilter<'static>>, t0: Instant) -> Relay {
        Relay::new(RelayTiming::default(), vec![filter], t0)
    }

    /// Send whatever is due, the way the daemon does
    fn deliver(relay: &mut Relay, iface: usize, now: Instant, sent: &mut Vec<Vec<u8>>) {
        sent.push(relay.pending(iface).to_vec());
        relay.mark_flushed(iface, now);
    }

    #[test]
    fn test_unfiltered_always_flushes() {
        let t0 = Instant::now();
        let mut relay = relay(None, t0);
        for n in 0..5u32 {
            let now = t0 + n * MS;
            assert_eq!(relay.on_report(0, &[n as u8], now), Some(FlushReason::Unfiltered));
            relay.mark_flushed(0, now);
        }
        assert!(relay.on_tick(t0 + 10 * MS).is_empty());
    }

    #[test]
    fn test_unfiltered_retries_pending() {
        let t0 = Instant::now();
        let mut relay = relay(None, t0);
        assert!(relay.on_report(0, &[1], t0 + MS).is_some());
        // Send would have blocked: still pending on the next tick
        assert_eq!(relay.on_tick(t0 + 2 * MS), vec![(0, FlushReason::Unfiltered)]);
    }

    #[test]
    fn test_priority_change_flushes_after_throttle() {
        let t0 = Instant::now();
        let mut relay = relay(Some(&ANALOG_ONLY), t0);

        assert_eq!(
            relay.on_report(0, &[1, 0, 0, 0, 0, 0, 0, 0], t0 + 30 * MS),
            Some(FlushReason::Filter)
        );
        relay.mark_flushed(0, t0 + 30 * MS);

        // Button released 5 ms later: inside the throttle window
        assert_eq!(relay.on_report(0, &[0; 8], t0 + 35 * MS), None);
        assert!(relay.on_tick(t0 + 40 * MS).is_empty());
        assert_eq!(relay.next_deadline(), Some(t0 + 50 * MS));
        assert_eq!(
            relay.on_tick(t0 + 50 * MS),
            vec![(0, FlushReason::ThrottleExpired)]
        );
        assert_eq!(relay.pending(0), &[0; 8]);
    }

    #[test]
    fn test_analog_threshold() {
        let t0 = Instant::now();
        let mut relay = relay(Some(&ANALOG_ONLY), t0);
        let mut report = [0u8; 8];

        report[4..6].copy_from_slice(&0x00FFu16.to_le_bytes());
        assert_eq!(relay.on_report(0, &report, t0 + 30 * MS), None);

        report[4..6].copy_from_slice(&0x01FFu16.to_le_bytes());
        assert_eq!(
            relay.on_report(0, &report, t0 + 60 * MS),
            Some(FlushReason::Filter)
        );
    }

    #[test]
    fn test_timer_flush_bypasses_filter() {
        let t0 = Instant::now();
        let mut relay = relay(Some(&ANALOG_ONLY), t0);
        assert_eq!(
            relay.on_report(0, &[0, 9, 9, 9, 0, 0, 0, 0], t0 + 250 * MS),
            Some(FlushReason::Timer)
        );
    }

    #[test]
    fn test_sub_threshold_stream_flushes_once_on_timer() {
        let t0 = Instant::now();
        let mut relay = relay(Some(&DECK_FILTER), t0);
        let mut sent = Vec::new();

        // Ten samples 4 ms apart; only bytes outside the priority mask change,
        // the left stick drifts by less than its threshold.
        let mut latest = [0u8; 64];
        for n in 0..10u32 {
            let now = t0 + (n + 1) * 4 * MS;
            let mut report = [0u8; 64];
            report[4..8].copy_from_slice(&n.to_le_bytes());
            report[48..50].copy_from_slice(&(0x10 * n as u16).to_le_bytes());
            latest = report;

            if relay.on_report(0, &report, now).is_some() {
                deliver(&mut relay, 0, now, &mut sent);
            }
            for (iface, _) in relay.on_tick(now) {
                deliver(&mut relay, iface, now, &mut sent);
            }
        }
        assert!(sent.is_empty());

        let tick = t0 + 250 * MS;
        let due = relay.on_tick(tick);
        assert_eq!(due, vec![(0, FlushReason::Timer)]);
        for (iface, _) in due {
            deliver(&mut relay, iface, tick, &mut sent);
        }
        assert_eq!(sent, vec![latest.to_vec()]);

        // Nothing left once flushed
        assert!(relay.on_tick(tick + 300 * MS).is_empty());
    }

    #[test]
    fn test_empty_relay() {
        let relay = Relay::new(RelayTiming::default(), Vec::new(), Instant::now());
        assert!(relay.is_empty());
        assert_eq!(relay.next_deadline(), None);
    }
}
