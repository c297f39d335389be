//! Line-oriented client command protocol (§4.5).
//!
//! A request line is a run of single-letter verbs, each optionally
//! followed by `=value` to set rather than query; no separators between
//! verbs (`PQ` asks for position and DOPs in one request). The reply is
//! one line, `GPSD` followed by the requested verbs' `verb=value`
//! phrases in the order asked, `?` standing in for a verb whose value
//! isn't available right now. Unknown verbs are silently dropped from
//! both the request and the reply.

use crate::context::Context;
use crate::fix::{DeviceSnapshot, Mode, Status};
use crate::session::{BufferingPolicy, RawMode, Subscriber};

pub const PROTOCOL_VERSION: &str = "3.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: char,
    pub value: Option<String>,
}

/// Split a request line into its constituent verbs. Each verb is one
/// character; a `=` immediately after it starts a value that runs until
/// the next verb character or end of line.
pub fn parse_request(line: &str) -> Vec<Request> {
    let body = line.trim_end_matches(['\r', '\n']);
    let chars: Vec<char> = body.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        i += 1;
        if i < chars.len() && chars[i] == '=' {
            i += 1;
            let start = i;
            while i < chars.len() && is_value_char(chars[i]) {
                i += 1;
            }
            out.push(Request {
                verb: c,
                value: Some(chars[start..i].iter().collect()),
            });
        } else {
            out.push(Request { verb: c, value: None });
        }
    }
    out
}

fn is_value_char(c: char) -> bool {
    c.is_ascii_digit() || c == '.' || c == '-' || c == '/' || c == ':' || c.is_ascii_lowercase()
}

fn phrase(verb: char, value: Option<String>) -> String {
    format!("{verb}={}", value.unwrap_or_else(|| "?".to_string()))
}

fn fmt_opt(v: Option<f64>) -> Option<String> {
    v.map(|x| format!("{x:.4}"))
}

/// Handle one full request line against a subscriber's state and its
/// currently-assigned device, returning the full `GPSD...\r\n` reply.
///
/// `sole_subscriber` tells privileged verbs (`B`, `C`, `N`, write-`J`,
/// `|`) whether this caller is the only subscriber bound to the device —
/// computed by the engine from its subscriber table, not known in here.
pub fn handle_request(
    line: &str,
    sub: &mut Subscriber,
    device: Option<&DeviceSnapshot>,
    _ctx: &Context,
    sole_subscriber: bool,
) -> String {
    let requests = parse_request(line);
    let mut phrases = Vec::new();
    for req in requests {
        if let Some(p) = handle_verb(&req, sub, device, sole_subscriber) {
            phrases.push(p);
        }
    }
    sub.touch();
    if phrases.is_empty() {
        "GPSD\r\n".to_string()
    } else {
        format!("GPSD,{}\r\n", phrases.join(","))
    }
}

fn handle_verb(
    req: &Request,
    sub: &mut Subscriber,
    device: Option<&DeviceSnapshot>,
    sole_subscriber: bool,
) -> Option<String> {
    match req.verb {
        'A' => Some(phrase('A', fmt_opt(device.and_then(|d| d.fix.altitude)))),
        'B' => {
            if let Some(baud) = &req.value {
                if sole_subscriber {
                    return Some(phrase('B', Some(baud.clone())));
                }
                // not the sole subscriber: setter refused, report current value instead
            }
            Some(phrase('B', device.map(|d| d.baudrate.to_string())))
        }
        'C' => {
            if let Some(secs) = &req.value {
                if sole_subscriber {
                    return Some(phrase('C', Some(secs.clone())));
                }
            }
            Some(phrase('C', None))
        }
        'D' => Some(phrase('D', device.and_then(|d| d.fix.time).map(format_iso8601))),
        'E' => Some(phrase(
            'E',
            device.and_then(|d| estimated_position_error(&d.fix)).map(|epe| {
                format!(
                    "{:.2} {:.2} {:.2}",
                    epe,
                    device.and_then(|d| d.fix.eph).unwrap_or(f64::NAN),
                    device.and_then(|d| d.fix.epv).unwrap_or(f64::NAN),
                )
            }),
        )),
        'F' => {
            if let Some(path) = &req.value {
                sub.device_affinity = Some(path.clone());
                return Some(phrase('F', Some(path.clone())));
            }
            Some(phrase('F', sub.device_affinity.clone()))
        }
        'G' => {
            if let Some(kind) = &req.value {
                sub.kind_filter = match kind.as_str() {
                    "gps" => crate::session::DataKindFilter::Gps,
                    "rtcm104" => crate::session::DataKindFilter::Rtcm104,
                    _ => crate::session::DataKindFilter::Any,
                };
            }
            Some(phrase(
                'G',
                Some(
                    match sub.kind_filter {
                        crate::session::DataKindFilter::Any => "any",
                        crate::session::DataKindFilter::Gps => "gps",
                        crate::session::DataKindFilter::Rtcm104 => "rtcm104",
                    }
                    .to_string(),
                ),
            ))
        }
        'I' => Some(phrase(
            'I',
            device.and_then(|d| d.packet_type).map(|t| driver_type_name(t).to_string()),
        )),
        'J' => {
            if let Some(v) = &req.value {
                if sole_subscriber {
                    sub.buffering = if v == "1" {
                        BufferingPolicy::Independent
                    } else {
                        BufferingPolicy::CycleAssociate
                    };
                }
            }
            Some(phrase(
                'J',
                Some(if sub.buffering == BufferingPolicy::Independent { "1" } else { "0" }.to_string()),
            ))
        }
        'K' => Some(phrase('K', device.map(|d| d.path.clone()))),
        'L' => Some(phrase('L', Some(format!("{PROTOCOL_VERSION} abcdefgijklmnopqrstuvwxyz$|")))),
        'M' => Some(phrase('M', device.map(|d| mode_to_num(d.fix.mode).to_string()))),
        'N' => Some(phrase('N', Some(if req.value.as_deref() == Some("1") { "1" } else { "0" }.to_string()))),
        'O' => Some(phrase('O', Some(format_o_phrase(sub, device)))),
        'P' => Some(phrase(
            'P',
            match (device.and_then(|d| d.fix.latitude), device.and_then(|d| d.fix.longitude)) {
                (Some(lat), Some(lon)) => Some(format!("{lat:.9} {lon:.9}")),
                _ => None,
            },
        )),
        'Q' => Some(phrase('Q', device.map(|d| {
            format!(
                "{:.2} {:.2} {:.2} {:.2} {:.2}",
                d.dops.pdop.unwrap_or(f64::NAN),
                d.dops.hdop.unwrap_or(f64::NAN),
                d.dops.vdop.unwrap_or(f64::NAN),
                d.dops.tdop.unwrap_or(f64::NAN),
                d.dops.gdop.unwrap_or(f64::NAN),
            )
        }))),
        'R' => {
            if let Some(v) = &req.value {
                sub.raw_mode = match v.as_str() {
                    "1" => RawMode::Raw,
                    "2" => RawMode::SuperRaw,
                    _ => RawMode::Off,
                };
            }
            Some(phrase(
                'R',
                Some(
                    match sub.raw_mode {
                        RawMode::Off => "0",
                        RawMode::Raw => "1",
                        RawMode::SuperRaw => "2",
                    }
                    .to_string(),
                ),
            ))
        }
        'S' => Some(phrase('S', device.map(|d| status_to_num(d.status).to_string()))),
        'T' => Some(phrase('T', fmt_opt(device.and_then(|d| d.fix.track)))),
        'U' => Some(phrase('U', fmt_opt(device.and_then(|d| d.fix.climb)))),
        'V' => Some(phrase(
            'V',
            device
                .and_then(|d| d.fix.speed)
                .map(|mps| format!("{:.3}", mps / 0.514_444_4)),
        )),
        'W' => {
            if let Some(v) = &req.value {
                sub.watcher = v == "1";
            } else {
                sub.watcher = !sub.watcher;
            }
            Some(phrase('W', Some(if sub.watcher { "1" } else { "0" }.to_string())))
        }
        'X' => Some(phrase('X', Some(format!("{:.2}", now_unix())))),
        'Y' => Some(phrase('Y', device.map(|d| format_satellite_table(d)))),
        'Z' => {
            if let Some(v) = &req.value {
                sub.profiling = v == "1";
            }
            Some(phrase('Z', Some(if sub.profiling { "1" } else { "0" }.to_string())))
        }
        '$' => Some(phrase(
            '$',
            device.and_then(|d| d.sentence_time).map(|_| {
                format!(
                    "{} {:.3} {:.3} {:.3} {:.3}",
                    device.map(|d| d.tag.clone()).unwrap_or_default(),
                    device.and_then(|d| d.sentence_time).unwrap_or(0.0),
                    device.and_then(|d| d.receive_time).unwrap_or(0.0),
                    device.and_then(|d| d.decode_time).unwrap_or(0.0),
                    device.and_then(|d| d.poll_time).unwrap_or(0.0),
                )
            }),
        )),
        '|' => None, // gated on the daemon's "dangerous" flag; handled by the control path, not here
        _ => None,
    }
}

/// `EPE`, the `E` verb's first field (spec §4.5), is a combined
/// position error distinct from `ept` (time error) — the Fix model
/// (§3) carries no dedicated `epe`, so it's derived here from the
/// horizontal and vertical 1-sigma errors the same way `eph`/`epv`
/// themselves are derived from DOP×UERE in `device::run_error_model`.
fn estimated_position_error(f: &crate::fix::Fix) -> Option<f64> {
    match (f.eph, f.epv) {
        (Some(eph), Some(epv)) => Some((eph * eph + epv * epv).sqrt()),
        (Some(eph), None) => Some(eph),
        (None, Some(epv)) => Some(epv),
        (None, None) => None,
    }
}

fn driver_type_name(t: crate::fix::PacketType) -> &'static str {
    match t {
        crate::fix::PacketType::Nmea => "Generic NMEA",
        crate::fix::PacketType::Sirf => "SiRF binary",
        crate::fix::PacketType::Zodiac => "Zodiac binary",
        crate::fix::PacketType::SuperStar2 => "SuperStarII binary",
        crate::fix::PacketType::Nmea2000 => "NMEA2000",
        crate::fix::PacketType::Rtcm => "RTCM104",
    }
}

fn mode_to_num(m: Mode) -> u8 {
    match m {
        Mode::Unseen => 0,
        Mode::NoFix => 1,
        Mode::Fix2D => 2,
        Mode::Fix3D => 3,
    }
}

fn status_to_num(s: Status) -> u8 {
    match s {
        Status::NoFix => 0,
        Status::Fix2D => 1,
        Status::DgpsFix => 2,
    }
}

/// Full observation line. The altitude field preserves the teacher's
/// pseudo-NMEA formatter's inconsistent missing-value width (`"          ?"`
/// with ten leading spaces rather than the eight every other field uses) —
/// an open question the spec says to carry forward byte-exactly, not fix.
fn format_o_phrase(sub: &Subscriber, device: Option<&DeviceSnapshot>) -> String {
    let f = &sub.fix;
    let tag = device.map(|d| d.tag.clone()).unwrap_or_else(|| "?".to_string());
    let missing_alt = "          ?"; // ten spaces, intentionally inconsistent with other fields
    let missing = "?";
    format!(
        "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
        tag,
        f.time.map(|t| format!("{t:.3}")).unwrap_or_else(|| missing.into()),
        f.ept.map(|v| format!("{v:.3}")).unwrap_or_else(|| missing.into()),
        f.latitude.map(|v| format!("{v:.9}")).unwrap_or_else(|| missing.into()),
        f.longitude.map(|v| format!("{v:.9}")).unwrap_or_else(|| missing.into()),
        f.altitude.map(|v| format!("{v:.3}")).unwrap_or_else(|| missing_alt.into()),
        f.eph.map(|v| format!("{v:.3}")).unwrap_or_else(|| missing.into()),
        f.epv.map(|v| format!("{v:.3}")).unwrap_or_else(|| missing.into()),
        f.track.map(|v| format!("{v:.4}")).unwrap_or_else(|| missing.into()),
        f.speed.map(|v| format!("{v:.3}")).unwrap_or_else(|| missing.into()),
        f.climb.map(|v| format!("{v:.3}")).unwrap_or_else(|| missing.into()),
        f.epd.map(|v| format!("{v:.4}")).unwrap_or_else(|| missing.into()),
        f.eps.map(|v| format!("{v:.2}")).unwrap_or_else(|| missing.into()),
        f.epc.map(|v| format!("{v:.2}")).unwrap_or_else(|| missing.into()),
        mode_to_num(f.mode),
    )
}

fn format_satellite_table(d: &DeviceSnapshot) -> String {
    let used = d.satellites.used_prns().count();
    let entries: Vec<String> = d
        .satellites
        .0
        .iter()
        .map(|s| format!("{}:{}:{}:{}:{}", s.prn, s.elevation, s.azimuth, s.signal_strength, s.used as u8))
        .collect();
    format!("{}:{}:{}", d.satellites.0.len(), used, entries.join(" "))
}

fn format_iso8601(unix_secs: f64) -> String {
    // Days-from-unix-epoch civil conversion, same algorithm family as
    // the NMEA driver's `days_from_civil` but inverted; formatted
    // manually rather than pulling in a second time crate for one path.
    let z = (unix_secs / 86400.0).floor() as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    let secs_of_day = unix_secs.rem_euclid(86400.0);
    let hh = (secs_of_day / 3600.0) as u32;
    let mm = ((secs_of_day % 3600.0) / 60.0) as u32;
    let ss = secs_of_day % 60.0;
    format!("{y:04}-{m:02}-{d:02}T{hh:02}:{mm:02}:{ss:06.3}Z")
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::DeviceSnapshot;

    #[test]
    fn parses_concatenated_verbs() {
        let reqs = parse_request("PQ\r\n");
        assert_eq!(reqs, vec![Request { verb: 'P', value: None }, Request { verb: 'Q', value: None }]);
    }

    #[test]
    fn parses_setter_with_value() {
        let reqs = parse_request("B=9600");
        assert_eq!(reqs[0].value.as_deref(), Some("9600"));
    }

    #[test]
    fn unknown_verb_is_dropped_from_reply() {
        let mut sub = Subscriber::new(1);
        let ctx = Context::new();
        let reply = handle_request("~", &mut sub, None, &ctx, true);
        assert_eq!(reply, "GPSD\r\n");
    }

    #[test]
    fn track_reply_matches_vtg_scenario() {
        let mut sub = Subscriber::new(1);
        let mut dev = DeviceSnapshot::new("/dev/ttyUSB0");
        dev.fix.track = Some(308.74);
        let ctx = Context::new();
        let reply = handle_request("T", &mut sub, Some(&dev), &ctx, true);
        assert_eq!(reply, "GPSD,T=308.7400\r\n");
    }

    #[test]
    fn privileged_baud_setter_refused_when_not_sole_subscriber() {
        let mut sub = Subscriber::new(1);
        let mut dev = DeviceSnapshot::new("/dev/ttyUSB0");
        dev.baudrate = 4800;
        let ctx = Context::new();
        let reply = handle_request("B=9600", &mut sub, Some(&dev), &ctx, false);
        assert_eq!(reply, "GPSD,B=4800\r\n");
    }
}
