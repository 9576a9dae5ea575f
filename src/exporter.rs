use core::fmt::{self, Write};

use heapless::String;
use serde::Serialize;

use crate::sampler::Reading;

/// Four gauge lines with a worst-case value and label each.
pub const EXPOSITION_CAPACITY: usize = 512;

/// MAC-style hardware identifier labelling every exported sample, so one unit
/// stays distinguishable from the next in aggregate dashboards.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId([u8; 6]);

impl DeviceId {
    pub const fn new(mac: [u8; 6]) -> Self {
        Self(mac)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e, g)
    }
}

/// Rendering overflowed the output buffer. Does not happen for any reading
/// the driver can produce; treated as a bug signal, not an operator error.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FormatError;

impl From<fmt::Error> for FormatError {
    fn from(_: fmt::Error) -> Self {
        FormatError
    }
}

#[derive(Serialize)]
pub struct SystemInfo {
    version: &'static str,
    cores: u8,
}

impl SystemInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            cores: 2,
        }
    }
}

/// Renders one reading as Prometheus text exposition.
///
/// The metric names, their order, and the six-decimal values are the wire
/// contract existing scrape configs were written against — including the
/// "tempreature" spelling, which predates this implementation.
pub fn exposition(
    device_id: &DeviceId,
    reading: &Reading,
) -> Result<String<EXPOSITION_CAPACITY>, FormatError> {
    let mut out = String::new();
    write!(
        out,
        "esp32_bme680_tempreature{{deviceid=\"{}\"}} {:.6}\n",
        device_id, reading.temperature
    )?;
    write!(
        out,
        "esp32_bme680_humidity{{deviceid=\"{}\"}} {:.6}\n",
        device_id, reading.humidity
    )?;
    write!(
        out,
        "esp32_bme680_gas_resistance{{deviceid=\"{}\"}} {:.6}\n",
        device_id, reading.gas_resistance
    )?;
    write!(
        out,
        "esp32_bme680_pressure{{deviceid=\"{}\"}} {:.6}\n",
        device_id, reading.pressure
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Instant;

    fn reading(temperature: f64, humidity: f64, pressure: f64, gas_resistance: f64) -> Reading {
        Reading {
            temperature,
            humidity,
            pressure,
            gas_resistance,
            taken_at: Instant::from_ticks(0),
        }
    }

    #[test]
    fn device_id_renders_as_uppercase_colon_hex() {
        let id = DeviceId::new([0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x5F]);
        let mut s: String<20> = String::new();
        write!(s, "{}", id).unwrap();
        assert_eq!(s.as_str(), "0A:1B:2C:3D:4E:5F");
    }

    #[test]
    fn exposition_matches_the_documented_body() {
        let id = DeviceId::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let body = exposition(&id, &reading(23.45, 45.12, 1013.25, 12.34)).unwrap();
        assert_eq!(
            body.as_str(),
            "esp32_bme680_tempreature{deviceid=\"AA:BB:CC:DD:EE:FF\"} 23.450000\n\
             esp32_bme680_humidity{deviceid=\"AA:BB:CC:DD:EE:FF\"} 45.120000\n\
             esp32_bme680_gas_resistance{deviceid=\"AA:BB:CC:DD:EE:FF\"} 12.340000\n\
             esp32_bme680_pressure{deviceid=\"AA:BB:CC:DD:EE:FF\"} 1013.250000\n"
        );
    }

    #[test]
    fn exposition_keeps_sign_and_magnitude() {
        let id = DeviceId::new([0; 6]);
        let body = exposition(&id, &reading(-12.5, 0.0, 1050.0, 8_500_000.0)).unwrap();
        let mut lines = body.lines();
        assert!(lines.next().unwrap().ends_with(" -12.500000"));
        assert!(lines.next().unwrap().ends_with(" 0.000000"));
        assert!(lines.next().unwrap().ends_with(" 8500000.000000"));
        assert!(lines.next().unwrap().ends_with(" 1050.000000"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn system_info_serializes_version_and_cores() {
        let json = serde_json::to_string(&SystemInfo::current()).unwrap();
        assert_eq!(
            json,
            concat!("{\"version\":\"", env!("CARGO_PKG_VERSION"), "\",\"cores\":2}")
        );
    }
}
