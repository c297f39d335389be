//! NMEA2000-over-CAN support: raw frame decode, fast-packet
//! reassembly, and the PGN decode table (§4.3).

pub mod can_frame;
pub mod fast_packet;
pub mod pgn;

pub use can_frame::{CanFrame, CanId};
pub use fast_packet::{Reassembler, Reassembly};
pub use pgn::{PgnEntry, PgnOutput};
