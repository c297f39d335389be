//! Pseudo-NMEA re-emission.
//!
//! Full pseudo-NMEA formatting (`original_source/pseudonmea.c`) is out
//! of scope (§1) — this crate doesn't re-serialize every sentence type
//! a binary-protocol device's fix could be translated into. What's kept
//! is just enough to exercise §8's round-trip property: format a fix as
//! `$GPRMC`/`$GPGGA` and confirm the NMEA driver recovers the same
//! lat/lon/altitude/speed/track to the emitted precision.

use crate::fix::Fix;

fn decimal_to_nmea(decimal: f64, is_lat: bool) -> (String, char) {
    let hemi = if is_lat {
        if decimal < 0.0 { 'S' } else { 'N' }
    } else if decimal < 0.0 {
        'W'
    } else {
        'E'
    };
    let abs = decimal.abs();
    let degrees = abs.trunc() as u32;
    let minutes = (abs.fract()) * 60.0;
    let width = if is_lat { 2 } else { 3 };
    (format!("{degrees:0width$}{minutes:07.4}", width = width), hemi)
}

fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Format a `$GPRMC` sentence. Returns `None` if the fix lacks lat/lon
/// (RMC with status `V` carries no position worth round-tripping here).
pub fn format_rmc(fix: &Fix) -> Option<String> {
    let lat = fix.latitude?;
    let lon = fix.longitude?;
    let (lat_s, lat_h) = decimal_to_nmea(lat, true);
    let (lon_s, lon_h) = decimal_to_nmea(lon, false);
    let knots = fix.speed.map(|s| s / 0.514_444_4).unwrap_or(0.0);
    let track = fix.track.unwrap_or(0.0);
    let body = format!(
        "GPRMC,000000,A,{lat_s},{lat_h},{lon_s},{lon_h},{knots:.1},{track:.1},010170,000.0,W"
    );
    let cksum = nmea_checksum(&body);
    Some(format!("${body}*{cksum:02X}\r\n"))
}

/// Format a `$GPGGA` sentence carrying position and altitude.
pub fn format_gga(fix: &Fix) -> Option<String> {
    let lat = fix.latitude?;
    let lon = fix.longitude?;
    let (lat_s, lat_h) = decimal_to_nmea(lat, true);
    let (lon_s, lon_h) = decimal_to_nmea(lon, false);
    let alt = fix.altitude.unwrap_or(0.0);
    let body = format!("GPGGA,000000,{lat_s},{lat_h},{lon_s},{lon_h},1,08,1.0,{alt:.1},M,0.0,M,,");
    let cksum = nmea_checksum(&body);
    Some(format!("${body}*{cksum:02X}\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::driver::nmea::NmeaDriver;
    use crate::driver::Driver;

    #[test]
    fn rmc_round_trip_recovers_latlon_and_track() {
        let fix = Fix {
            latitude: Some(48.1173),
            longitude: Some(11.5167),
            speed: Some(11.52),
            track: Some(84.4),
            ..Default::default()
        };
        let line = format_rmc(&fix).expect("fix has position");
        let mut driver = NmeaDriver;
        let out = driver.parse_packet(line.as_bytes(), &Context::new());
        assert!((out.fix.latitude.unwrap() - 48.1173).abs() < 1e-3);
        assert!((out.fix.longitude.unwrap() - 11.5167).abs() < 1e-3);
    }

    #[test]
    fn gga_round_trip_recovers_altitude() {
        let fix = Fix {
            latitude: Some(48.1173),
            longitude: Some(11.5167),
            altitude: Some(545.4),
            ..Default::default()
        };
        let line = format_gga(&fix).expect("fix has position");
        let mut driver = NmeaDriver;
        let out = driver.parse_packet(line.as_bytes(), &Context::new());
        assert!((out.fix.altitude.unwrap() - 545.4).abs() < 1e-1);
    }
}
