//! Decoded sensor readings and the SensorTag payload decoders.

use bytes::Buf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::types::Feature;

/// Payload length of the IR temperature characteristic.
pub const TEMPERATURE_BYTES: usize = 4;
/// Payload length of the humidity characteristic.
pub const HUMIDITY_BYTES: usize = 4;
/// Payload length of the CC2650 barometer characteristic.
pub const PRESSURE_BYTES: usize = 6;
/// Payload length of the optical characteristic.
pub const LIGHT_BYTES: usize = 2;
/// Payload length of the movement characteristic.
pub const MOVEMENT_BYTES: usize = 18;
/// Payload length of the simple-keys characteristic.
pub const BUTTONS_BYTES: usize = 1;

/// A decoded sensor sample.
///
/// Serialises untagged, so the JSON form carries only the measured fields
/// (e.g. `{"object":24.5,"ambient":22.1}` or `{"key1":true,"key2":false}`).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Reading {
    /// IR thermopile object and die (ambient) temperature in °C.
    Temperature { object: f64, ambient: f64 },
    /// Relative humidity in % with the sensor temperature in °C.
    Humidity { temperature: f64, humidity: f64 },
    /// Barometric pressure in hPa.
    Pressure { pressure: f64 },
    /// Illuminance in lux.
    Light { lux: f64 },
    /// Three-axis sample (G for accelerometer, deg/s for gyroscope, µT for magnetometer).
    Axes { x: f64, y: f64, z: f64 },
    /// Simple-key state.
    Buttons {
        #[cfg_attr(feature = "serde", serde(rename = "key1"))]
        left: bool,
        #[cfg_attr(feature = "serde", serde(rename = "key2"))]
        right: bool,
    },
}

impl Reading {
    /// Decode a notification payload for `feature`.
    ///
    /// Movement features all receive the same 18-byte packet; each decodes its
    /// own slice (gyroscope bytes 0-5, accelerometer 6-11, magnetometer 12-17).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] when `data` is shorter than the
    /// sensor's packet layout. Extra trailing bytes are ignored.
    pub fn decode(feature: Feature, data: &[u8]) -> Result<Self, ParseError> {
        match feature {
            Feature::Temperature => decode_temperature(data),
            Feature::Humidity => decode_humidity(data),
            Feature::Pressure => decode_pressure(data),
            Feature::Light => decode_light(data),
            Feature::Gyroscope => decode_axes(feature, data, 0, |raw| f64::from(raw) / GYRO_SCALE),
            Feature::Accelerometer => {
                decode_axes(feature, data, 6, |raw| f64::from(raw) / ACCEL_SCALE_8G)
            }
            Feature::Magnetometer => {
                decode_axes(feature, data, 12, |raw| f64::from(raw) * MAG_SCALE)
            }
            Feature::Buttons => decode_buttons(data),
        }
    }
}

const GYRO_SCALE: f64 = 65536.0 / 500.0;
const ACCEL_SCALE_8G: f64 = 32768.0 / 8.0;
const MAG_SCALE: f64 = 4912.0 / 32760.0;

fn require(feature: Feature, data: &[u8], expected: usize) -> Result<(), ParseError> {
    if data.len() < expected {
        return Err(ParseError::InsufficientBytes {
            feature: feature.sensor_name(),
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn decode_temperature(data: &[u8]) -> Result<Reading, ParseError> {
    require(Feature::Temperature, data, TEMPERATURE_BYTES)?;
    let mut buf = data;
    let object_raw = buf.get_u16_le();
    let ambient_raw = buf.get_u16_le();
    Ok(Reading::Temperature {
        object: f64::from(object_raw >> 2) * 0.031_25,
        ambient: f64::from(ambient_raw >> 2) * 0.031_25,
    })
}

fn decode_humidity(data: &[u8]) -> Result<Reading, ParseError> {
    require(Feature::Humidity, data, HUMIDITY_BYTES)?;
    let mut buf = data;
    let temp_raw = buf.get_u16_le();
    let humidity_raw = buf.get_u16_le() & !0x0003;
    Ok(Reading::Humidity {
        temperature: f64::from(temp_raw) / 65536.0 * 165.0 - 40.0,
        humidity: f64::from(humidity_raw) / 65536.0 * 100.0,
    })
}

fn decode_pressure(data: &[u8]) -> Result<Reading, ParseError> {
    require(Feature::Pressure, data, PRESSURE_BYTES)?;
    let mut buf = data;
    // Bytes 0-2 carry the sensor temperature.
    buf.advance(3);
    let raw = buf.get_uint_le(3);
    Ok(Reading::Pressure {
        pressure: raw as f64 / 100.0,
    })
}

fn decode_light(data: &[u8]) -> Result<Reading, ParseError> {
    require(Feature::Light, data, LIGHT_BYTES)?;
    let mut buf = data;
    let raw = buf.get_u16_le();
    let mantissa = f64::from(raw & 0x0FFF);
    let exponent = i32::from(raw >> 12);
    Ok(Reading::Light {
        lux: mantissa * 0.01 * 2f64.powi(exponent),
    })
}

fn decode_axes(
    feature: Feature,
    data: &[u8],
    offset: usize,
    scale: impl Fn(i16) -> f64,
) -> Result<Reading, ParseError> {
    require(feature, data, MOVEMENT_BYTES)?;
    let mut buf = &data[offset..];
    let x = scale(buf.get_i16_le());
    let y = scale(buf.get_i16_le());
    let z = scale(buf.get_i16_le());
    Ok(Reading::Axes { x, y, z })
}

fn decode_buttons(data: &[u8]) -> Result<Reading, ParseError> {
    require(Feature::Buttons, data, BUTTONS_BYTES)?;
    let state = data[0];
    Ok(Reading::Buttons {
        left: state & 0x02 != 0,
        right: state & 0x01 != 0,
    })
}
