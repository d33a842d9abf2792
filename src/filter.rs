//! Adaptive flush filter for HID input reports
//!
//! BLE notifications are expensive, so input reports are forwarded only when
//! something meaningful changed: any bit under the priority mask (buttons),
//! or an analog field (stick, trigger) moving by at least its threshold.

use crate::error::{PassthruError, Result};

/// A slowly varying little-endian field inside a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogChannel {
    pub offset: usize,
    /// 1, 2, 4 or 8 bytes
    pub width: usize,
    /// Minimum absolute change that justifies a flush
    pub threshold: u64,
}

/// Declarative description of one report layout
#[derive(Debug, Clone, Copy)]
pub struct ReportFilter<'a> {
    /// Exact report length the filter applies to
    pub report_size: usize,
    /// Bits whose change always flushes, compared one 32-bit word at a time
    pub priority_mask: &'a [u8],
    /// Checked in order when no priority bit changed
    pub analog: &'a [AnalogChannel],
}

/// Read an unsigned little-endian integer of `width` bytes at `offset`.
///
/// Returns `None` for unsupported widths or when the field runs past the end
/// of `buf`.
pub fn read_uint_le(buf: &[u8], offset: usize, width: usize) -> Option<u64> {
    if !matches!(width, 1 | 2 | 4 | 8) {
        return None;
    }
    let bytes = buf.get(offset..offset.checked_add(width)?)?;
    Some(
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
    )
}

fn word(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl ReportFilter<'_> {
    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.report_size % 4 != 0 {
            return Err(PassthruError::InvalidFilter(format!(
                "report size {} is not a multiple of 4",
                self.report_size
            )));
        }
        if self.priority_mask.len() != self.report_size {
            return Err(PassthruError::InvalidFilter(format!(
                "priority mask is {} bytes, report is {}",
                self.priority_mask.len(),
                self.report_size
            )));
        }
        for ch in self.analog {
            if !matches!(ch.width, 1 | 2 | 4 | 8) {
                return Err(PassthruError::InvalidFilter(format!(
                    "channel at {} has unsupported width {}",
                    ch.offset, ch.width
                )));
            }
            if ch.offset + ch.width > self.report_size {
                return Err(PassthruError::InvalidFilter(format!(
                    "channel at {} extends past the report",
                    ch.offset
                )));
            }
        }
        Ok(())
    }

    /// Decide whether `incoming` is worth forwarding compared to `baseline`,
    /// then fold `incoming` into `baseline`.
    ///
    /// Reports of the wrong size, or a filter whose size is not a whole
    /// number of words, never flush and leave the baseline untouched.
    pub fn evaluate(&self, baseline: &mut [u8], incoming: &[u8]) -> bool {
        let size = self.report_size;
        if size % 4 != 0
            || incoming.len() != size
            || baseline.len() != size
            || self.priority_mask.len() != size
        {
            return false;
        }

        let mut flush = false;
        let mut masked = Vec::with_capacity(size / 4);
        for at in (0..size).step_by(4) {
            let mask = word(self.priority_mask, at);
            let old = word(baseline, at) & mask;
            let new = word(incoming, at) & mask;
            flush |= old != new;
            masked.push(new);
        }

        if !flush {
            flush = self.analog.iter().any(|ch| {
                match (
                    read_uint_le(baseline, ch.offset, ch.width),
                    read_uint_le(incoming, ch.offset, ch.width),
                ) {
                    (Some(old), Some(new)) => old.abs_diff(new) >= ch.threshold,
                    _ => false,
                }
            });
        }

        // Priority bits commit through the masked words, everything else
        // copies straight from the incoming report.
        for (n, at) in (0..size).step_by(4).enumerate() {
            let mask = word(self.priority_mask, at);
            let merged = (masked[n] & mask) | (word(incoming, at) & !mask);
            baseline[at..at + 4].copy_from_slice(&merged.to_ne_bytes());
        }

        flush
    }
}

// === Built-in filters ===

pub const VID_VALVE: u16 = 0x28de;
pub const PID_STEAM_DECK: u16 = 0x1205;
/// USB interface carrying the Deck's raw controller reports
pub const DECK_RAW_INTERFACE: usize = 2;

const DECK_PRIORITY_MASK: [u8; 64] = {
    let mut mask = [0u8; 64];
    let mut i = 8;
    while i < 16 {
        mask[i] = 0xFF;
        i += 1;
    }
    mask
};

const fn deck_axis(offset: usize) -> AnalogChannel {
    AnalogChannel {
        offset,
        width: 2,
        threshold: 0x400,
    }
}

const DECK_ANALOG: [AnalogChannel; 6] = [
    // Triggers
    deck_axis(44),
    deck_axis(46),
    // Left stick
    deck_axis(48),
    deck_axis(50),
    // Right stick
    deck_axis(52),
    deck_axis(54),
];

/// Steam Deck controller input report
pub static DECK_FILTER: ReportFilter<'static> = ReportFilter {
    report_size: 64,
    priority_mask: &DECK_PRIORITY_MASK,
    analog: &DECK_ANALOG,
};

/// Filter for a given device interface, `None` when every report flushes
pub fn filter_for(vid: u16, pid: u16, interface: usize) -> Option<&'static ReportFilter<'static>> {
    match (vid, pid, interface) {
        (VID_VALVE, PID_STEAM_DECK, DECK_RAW_INTERFACE) => Some(&DECK_FILTER),
        _ => None,
    }
}
