//! Generic NMEA 0183 text driver.
//!
//! By the time a frame reaches here the sniffer (`packet.rs`) has
//! already validated its checksum, so this module only splits fields
//! and converts them — it never re-checks `*hh`. Sentence parsing
//! follows the same DDDMM.mmm→decimal-degrees conversion the teacher's
//! GNSS reader used (`gnss.rs::nmea_to_decimal`), generalized to the
//! full RMC/GGA/VTG/GSA/GSV set gpsd decodes.

use super::{Driver, DriverKind, ParseOutput};
use crate::context::Context;
use crate::fix::{ChangeSet, Mode, Satellite, Status};

#[derive(Debug, Default)]
pub struct NmeaDriver;

impl Driver for NmeaDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Nmea
    }

    fn parse_packet(&mut self, payload: &[u8], ctx: &Context) -> ParseOutput {
        let text = String::from_utf8_lossy(payload);
        let sentence = text.trim();
        let body = sentence.trim_start_matches('$');
        let body = body.split('*').next().unwrap_or(body);
        let fields: Vec<&str> = body.split(',').collect();
        if fields.is_empty() {
            return ParseOutput::default();
        }

        let talker_msg = fields[0];
        let msg = &talker_msg[talker_msg.len().saturating_sub(3)..];
        let mut out = match msg {
            "RMC" => parse_rmc(&fields, ctx),
            "GGA" => parse_gga(&fields),
            "VTG" => parse_vtg(&fields),
            "GSA" => parse_gsa(&fields),
            "GSV" => parse_gsv(&fields),
            _ => ParseOutput::default(),
        };
        out.tag = talker_msg.to_string();
        out
    }
}

fn nmea_to_decimal(coord: &str, hemi: &str) -> Option<f64> {
    if coord.is_empty() {
        return None;
    }
    let dot = coord.find('.')?;
    if dot < 2 {
        return None;
    }
    let deg_digits = dot - 2;
    let degrees: f64 = coord[..deg_digits].parse().ok()?;
    let minutes: f64 = coord[deg_digits..].parse().ok()?;
    let mut decimal = degrees + minutes / 60.0;
    if hemi == "S" || hemi == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

fn parse_hhmmss(s: &str) -> Option<(u32, u32, f64)> {
    if s.len() < 6 {
        return None;
    }
    let hh: u32 = s[0..2].parse().ok()?;
    let mm: u32 = s[2..4].parse().ok()?;
    let ss: f64 = s[4..].parse().ok()?;
    Some((hh, mm, ss))
}

/// `$GPRMC,hhmmss,status,lat,N/S,lon,E/W,speed(kt),track,ddmmyy,...`
fn parse_rmc(f: &[&str], ctx: &Context) -> ParseOutput {
    let mut out = ParseOutput::default();
    if f.len() < 10 {
        return out;
    }
    if f[2] != "A" {
        return out;
    }
    let Some(lat) = nmea_to_decimal(f[3], f[4]) else { return out };
    let Some(lon) = nmea_to_decimal(f[5], f[6]) else { return out };
    out.fix.latitude = Some(lat);
    out.fix.longitude = Some(lon);
    out.changes.insert(ChangeSet::LATLON);

    if let Ok(knots) = f[7].parse::<f64>() {
        out.fix.speed = Some(knots * 0.514_444_4); // knots -> m/s
        out.changes.insert(ChangeSet::SPEED);
    }
    if let Ok(track) = f[8].parse::<f64>() {
        out.fix.track = Some(track);
        out.changes.insert(ChangeSet::TRACK);
    }

    if let (Some((hh, mm, ss)), Some(date)) = (parse_hhmmss(f[1]), f.get(9)) {
        if date.len() == 6 {
            // Compute a fresh (day, month, year) triple each time — do
            // not mutate a cached `tm` in place (the spec's open
            // question about the C source's `tm_mon++`/`tm_year%=100`
            // single-application bug).
            if let (Ok(dd), Ok(mon), Ok(yy)) = (
                date[0..2].parse::<u32>(),
                date[2..4].parse::<u32>(),
                date[4..6].parse::<i32>(),
            ) {
                let year = ctx.expand_year(yy);
                if let Some(epoch) = days_from_civil(year, mon, dd) {
                    let secs = epoch as f64 * 86400.0
                        + hh as f64 * 3600.0
                        + mm as f64 * 60.0
                        + ss;
                    out.fix.time = Some(secs);
                    out.changes.insert(ChangeSet::TIME);
                }
            }
        }
    }
    out
}

/// `$GPGGA,hhmmss,lat,N/S,lon,E/W,quality,numsats,hdop,alt,M,sep,M,...`
fn parse_gga(f: &[&str]) -> ParseOutput {
    let mut out = ParseOutput::default();
    if f.len() < 10 {
        return out;
    }
    if f[6] == "0" || f[6].is_empty() {
        out.status = Some(Status::NoFix);
        out.changes.insert(ChangeSet::STATUS);
        return out;
    }
    out.status = Some(if f[6] == "2" { Status::DgpsFix } else { Status::Fix2D });
    out.changes.insert(ChangeSet::STATUS);

    let Some(lat) = nmea_to_decimal(f[2], f[3]) else { return out };
    let Some(lon) = nmea_to_decimal(f[4], f[5]) else { return out };
    out.fix.latitude = Some(lat);
    out.fix.longitude = Some(lon);
    out.changes.insert(ChangeSet::LATLON);

    if let Ok(hdop) = f[8].parse::<f64>() {
        out.hdop = Some(hdop);
        out.changes.insert(ChangeSet::DOP);
    }
    if let Ok(alt) = f[9].parse::<f64>() {
        out.fix.altitude = Some(alt);
        out.changes.insert(ChangeSet::ALTITUDE);
    }
    out
}

/// `$GPVTG,track,T,,M,speed,N,speed,K,...` — speed in km/h used for m/s.
fn parse_vtg(f: &[&str]) -> ParseOutput {
    let mut out = ParseOutput::default();
    if f.len() < 9 {
        return out;
    }
    if let Ok(track) = f[1].parse::<f64>() {
        out.fix.track = Some(track);
        out.changes.insert(ChangeSet::TRACK);
    }
    if let Ok(kph) = f[7].parse::<f64>() {
        out.fix.speed = Some(kph / 3.6);
        out.changes.insert(ChangeSet::SPEED);
    }
    out
}

/// `$GPGSA,A,fix,sv...,pdop,hdop,vdop*hh`
fn parse_gsa(f: &[&str]) -> ParseOutput {
    let mut out = ParseOutput::default();
    if f.len() < 18 {
        return out;
    }
    out.fix.mode = match f[2] {
        "2" => Mode::Fix2D,
        "3" => Mode::Fix3D,
        _ => Mode::NoFix,
    };
    out.changes.insert(ChangeSet::MODE);
    if let Ok(pdop) = f[15].parse::<f64>() {
        out.pdop = Some(pdop);
    }
    if let Ok(hdop) = f[16].parse::<f64>() {
        out.hdop = Some(hdop);
    }
    if let Ok(vdop) = f[17].trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.').parse::<f64>() {
        out.vdop = Some(vdop);
    }
    out.changes.insert(ChangeSet::DOP);
    out
}

/// `$GPGSV,total_msgs,msg_num,num_sats,[prn,elev,azim,snr]*4,...`
fn parse_gsv(f: &[&str]) -> ParseOutput {
    let mut out = ParseOutput::default();
    if f.len() < 4 {
        return out;
    }
    let mut idx = 4;
    while idx + 3 < f.len() {
        if let (Ok(prn), Ok(elev), Ok(azim)) = (
            f[idx].parse::<u16>(),
            f[idx + 1].parse::<i16>(),
            f[idx + 2].parse::<u16>(),
        ) {
            let snr = f[idx + 3]
                .trim_end_matches(|c: char| !c.is_ascii_digit())
                .parse::<f32>()
                .unwrap_or(0.0);
            out.satellites.push(Satellite {
                prn,
                elevation: elev,
                azimuth: azim,
                signal_strength: snr,
                used: false,
            });
        }
        idx += 4;
    }
    if !out.satellites.is_empty() {
        out.changes.insert(ChangeSet::SATELLITE);
    }
    out
}

/// Days since the Unix epoch for a Gregorian calendar date — Howard
/// Hinnant's `days_from_civil`, used instead of libc's `timegm` so the
/// conversion has no hidden dependency on the process's local tm cache.
fn days_from_civil(y: i32, m: u32, d: u32) -> Option<i64> {
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    let y = if m <= 2 { y as i64 - 1 } else { y as i64 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = ((m as i64 + 9) % 12) as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    Some(era * 146097 + doe - 719468)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new()
    }

    #[test]
    fn parse_gprmc_with_checksum() {
        let line = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";
        let mut d = NmeaDriver;
        let out = d.parse_packet(line.as_bytes(), &ctx());
        assert!(out.changes.contains(ChangeSet::LATLON));
        assert!((out.fix.latitude.unwrap() - 48.1173).abs() < 1e-3);
    }

    #[test]
    fn parse_gpgga_no_fix_reports_status_only() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,0,00,,,M,,M,,*00\r\n";
        let mut d = NmeaDriver;
        let out = d.parse_packet(line.as_bytes(), &ctx());
        assert_eq!(out.status, Some(Status::NoFix));
        assert!(!out.changes.contains(ChangeSet::LATLON));
    }

    #[test]
    fn invalid_rmc_fix_yields_no_latlon() {
        let line = "$GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";
        let mut d = NmeaDriver;
        let out = d.parse_packet(line.as_bytes(), &ctx());
        assert!(!out.changes.contains(ChangeSet::LATLON));
    }

    #[test]
    fn vtg_reports_308_74_degrees_track() {
        let line = "$GPVTG,308.74,T,,M,0.00,N,0.0,K*68\r\n";
        let mut d = NmeaDriver;
        let out = d.parse_packet(line.as_bytes(), &ctx());
        assert_eq!(out.fix.track, Some(308.74));
    }
}
