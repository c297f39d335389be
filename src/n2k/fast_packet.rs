//! NMEA2000 fast-packet reassembler.
//!
//! Grounded on `find_pgn()` in `original_source/driver_nmea2000.c`: unit
//! binding/locking, sticky GPS-vs-AIS PGN-list selection, and the
//! fragment-index state machine for payloads spanning multiple CAN
//! frames (§4.3).

use super::can_frame::{CanFrame, CanId};
use super::pgn::{search_pgnlist, PgnEntry, PgnOutput, AIS_PGN, GPS_PGN};

/// A completed PGN ready for its handler to run, or the fragment state
/// still waiting on more CAN frames.
pub enum Reassembly {
    /// Not enough fragments yet.
    Pending,
    /// Unknown/foreign unit, or an unrecognized PGN — nothing to do.
    Ignored,
    /// Fragment index didn't match; reassembly reset (§4.3's "fast error").
    Desynced,
    /// Full payload ready; call `entry.handler(&payload)`.
    Complete { entry: PgnEntry, payload: Vec<u8> },
}

#[derive(Default)]
struct FastPacketState {
    sequence_and_index: u8,
    expected_index: u8,
    fast_packet_len: usize,
    buf: Vec<u8>,
}

/// Per-device reassembly state: unit binding, sticky PGN-list choice,
/// and the in-progress fast-packet fragment buffer.
#[derive(Default)]
pub struct Reassembler {
    unit: Option<u8>,
    /// Once a PGN with `class != 0` (housekeeping) is seen, the list it
    /// came from (GPS or AIS) is locked in for all further lookups.
    pgnlist: Option<&'static [PgnEntry]>,
    fast: FastPacketState,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, frame: &CanFrame) -> Reassembly {
        let id = CanId::decode(frame.can_id);

        match self.unit {
            None => self.unit = Some(id.source_unit),
            Some(bound) if bound != id.source_unit => return Reassembly::Ignored,
            _ => {}
        }

        let list = self.pgnlist.unwrap_or(GPS_PGN);
        let entry = match search_pgnlist(id.pgn, list) {
            Some(e) => e,
            None => {
                // Not in the currently-selected list; only try the other
                // list (and stick to it) if no list has been locked yet.
                if self.pgnlist.is_none() {
                    if let Some(e) = search_pgnlist(id.pgn, AIS_PGN) {
                        self.pgnlist = Some(AIS_PGN);
                        e
                    } else {
                        return Reassembly::Ignored;
                    }
                } else {
                    return Reassembly::Ignored;
                }
            }
        };
        if self.pgnlist.is_none() && entry.class > 0 {
            self.pgnlist = Some(list);
        }

        let payload = frame.payload();
        if !entry.fast {
            return Reassembly::Complete {
                entry: *entry,
                payload: payload.to_vec(),
            };
        }

        if payload.is_empty() {
            return Reassembly::Ignored;
        }

        let seq_idx = payload[0];
        let fragment_index = seq_idx & 0x1f;

        if fragment_index == 0 {
            self.fast = FastPacketState {
                sequence_and_index: seq_idx,
                expected_index: 1,
                fast_packet_len: payload.get(1).copied().unwrap_or(0) as usize,
                buf: payload[2.min(payload.len())..].to_vec(),
            };
            Reassembly::Pending
        } else if seq_idx == self.fast.expected_index {
            for &b in &payload[1..] {
                if self.fast.buf.len() < self.fast.fast_packet_len {
                    self.fast.buf.push(b);
                }
            }
            if self.fast.buf.len() == self.fast.fast_packet_len {
                let payload = std::mem::take(&mut self.fast.buf);
                self.fast = FastPacketState::default();
                Reassembly::Complete { entry: *entry, payload }
            } else {
                self.fast.expected_index = self.fast.expected_index.wrapping_add(1);
                Reassembly::Pending
            }
        } else {
            self.fast = FastPacketState::default();
            Reassembly::Desynced
        }
    }
}

pub fn dispatch(entry: &PgnEntry, payload: &[u8]) -> PgnOutput {
    (entry.handler)(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(can_id: u32, data: &[u8]) -> CanFrame {
        let mut d = [0u8; 8];
        d[..data.len()].copy_from_slice(data);
        CanFrame {
            can_id,
            dlc: data.len() as u8,
            data: d,
        }
    }

    fn pgn_129029_can_id(unit: u8) -> u32 {
        (3u32 << 26) | (0x1F805u32 << 8) | unit as u32
    }

    #[test]
    fn single_frame_pgn_completes_immediately() {
        let mut r = Reassembler::new();
        let can_id = (3u32 << 26) | (129025u32 << 8) | 1;
        let result = r.feed(&frame(can_id, &[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(matches!(result, Reassembly::Complete { .. }));
    }

    #[test]
    fn fast_packet_reassembles_across_frames() {
        let mut r = Reassembler::new();
        let can_id = pgn_129029_can_id(5);

        // fragment 0: seq/idx byte 0x00, length byte 43, then 6 payload bytes
        let f0 = frame(can_id, &[0x00, 43, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(r.feed(&f0), Reassembly::Pending));

        // fragments 1..=6 each carry 7 bytes; 6 + 6*7 = 48 >= 43
        for idx in 1..=6u8 {
            let mut payload = [0u8; 8];
            payload[0] = idx;
            let result = r.feed(&frame(can_id, &payload));
            if idx < 6 {
                assert!(matches!(result, Reassembly::Pending), "idx {idx}");
            } else {
                assert!(matches!(result, Reassembly::Complete { .. }));
            }
        }
    }

    #[test]
    fn unexpected_fragment_index_desyncs() {
        let mut r = Reassembler::new();
        let can_id = pgn_129029_can_id(5);
        let f0 = frame(can_id, &[0x00, 43, 0, 0, 0, 0, 0, 0]);
        r.feed(&f0);
        let bad = frame(can_id, &[9, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(r.feed(&bad), Reassembly::Desynced));
    }

    #[test]
    fn frames_from_other_units_are_ignored_once_bound() {
        let mut r = Reassembler::new();
        let can_id_a = pgn_129029_can_id(1);
        let can_id_b = pgn_129029_can_id(2);
        r.feed(&frame(can_id_a, &[0x00, 43, 0, 0, 0, 0, 0, 0]));
        let result = r.feed(&frame(can_id_b, &[1, 0, 0, 0, 0, 0, 0, 0]));
        assert!(matches!(result, Reassembly::Ignored));
    }
}
