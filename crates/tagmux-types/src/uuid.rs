//! Bluetooth UUIDs for TI SensorTags.
//!
//! The sensor services share the TI base UUID `F000xxxx-0451-4000-B000-000000000000`.
//! Each sensor exposes a data characteristic (notify), a configuration
//! characteristic (enable) and, for some sensors, a period characteristic.

use uuid::{Uuid, uuid};

use crate::types::Feature;

// --- IR temperature ---

pub const IR_TEMPERATURE_SERVICE: Uuid = uuid!("f000aa00-0451-4000-b000-000000000000");
pub const IR_TEMPERATURE_DATA: Uuid = uuid!("f000aa01-0451-4000-b000-000000000000");
pub const IR_TEMPERATURE_CONFIG: Uuid = uuid!("f000aa02-0451-4000-b000-000000000000");
pub const IR_TEMPERATURE_PERIOD: Uuid = uuid!("f000aa03-0451-4000-b000-000000000000");

// --- Humidity ---

pub const HUMIDITY_SERVICE: Uuid = uuid!("f000aa20-0451-4000-b000-000000000000");
pub const HUMIDITY_DATA: Uuid = uuid!("f000aa21-0451-4000-b000-000000000000");
pub const HUMIDITY_CONFIG: Uuid = uuid!("f000aa22-0451-4000-b000-000000000000");
pub const HUMIDITY_PERIOD: Uuid = uuid!("f000aa23-0451-4000-b000-000000000000");

// --- Barometer ---

pub const BAROMETER_SERVICE: Uuid = uuid!("f000aa40-0451-4000-b000-000000000000");
pub const BAROMETER_DATA: Uuid = uuid!("f000aa41-0451-4000-b000-000000000000");
pub const BAROMETER_CONFIG: Uuid = uuid!("f000aa42-0451-4000-b000-000000000000");
pub const BAROMETER_PERIOD: Uuid = uuid!("f000aa44-0451-4000-b000-000000000000");

// --- Optical (CC2650 only) ---

pub const OPTICAL_SERVICE: Uuid = uuid!("f000aa70-0451-4000-b000-000000000000");
pub const OPTICAL_DATA: Uuid = uuid!("f000aa71-0451-4000-b000-000000000000");
pub const OPTICAL_CONFIG: Uuid = uuid!("f000aa72-0451-4000-b000-000000000000");
pub const OPTICAL_PERIOD: Uuid = uuid!("f000aa73-0451-4000-b000-000000000000");

// --- Movement (gyroscope, accelerometer and magnetometer share one service) ---

pub const MOVEMENT_SERVICE: Uuid = uuid!("f000aa80-0451-4000-b000-000000000000");
pub const MOVEMENT_DATA: Uuid = uuid!("f000aa81-0451-4000-b000-000000000000");
pub const MOVEMENT_CONFIG: Uuid = uuid!("f000aa82-0451-4000-b000-000000000000");
pub const MOVEMENT_PERIOD: Uuid = uuid!("f000aa83-0451-4000-b000-000000000000");

/// Movement config bits enabling the gyroscope x/y/z axes.
pub const MOVEMENT_GYROSCOPE_BITS: u16 = 0x0007;
/// Movement config bits enabling the accelerometer x/y/z axes.
pub const MOVEMENT_ACCELEROMETER_BITS: u16 = 0x0038;
/// Movement config bit enabling the magnetometer.
pub const MOVEMENT_MAGNETOMETER_BITS: u16 = 0x0040;
/// Movement config accelerometer range field set to 8G.
pub const MOVEMENT_ACCEL_RANGE_8G: u16 = 0x0200;

// --- Simple keys ---

pub const SIMPLE_KEYS_SERVICE: Uuid = uuid!("0000ffe0-0000-1000-8000-00805f9b34fb");
pub const SIMPLE_KEYS_DATA: Uuid = uuid!("0000ffe1-0000-1000-8000-00805f9b34fb");

/// Value written to a single-sensor config characteristic to switch it on.
pub const SENSOR_ENABLE: u8 = 0x01;

/// GATT characteristics backing one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureCharacteristics {
    pub service: Uuid,
    pub data: Uuid,
    pub config: Option<Uuid>,
    pub period: Option<Uuid>,
}

/// Characteristics used to enable, pace and subscribe to `feature`.
pub fn characteristics(feature: Feature) -> FeatureCharacteristics {
    match feature {
        Feature::Temperature => FeatureCharacteristics {
            service: IR_TEMPERATURE_SERVICE,
            data: IR_TEMPERATURE_DATA,
            config: Some(IR_TEMPERATURE_CONFIG),
            period: Some(IR_TEMPERATURE_PERIOD),
        },
        Feature::Humidity => FeatureCharacteristics {
            service: HUMIDITY_SERVICE,
            data: HUMIDITY_DATA,
            config: Some(HUMIDITY_CONFIG),
            period: Some(HUMIDITY_PERIOD),
        },
        Feature::Pressure => FeatureCharacteristics {
            service: BAROMETER_SERVICE,
            data: BAROMETER_DATA,
            config: Some(BAROMETER_CONFIG),
            period: Some(BAROMETER_PERIOD),
        },
        Feature::Light => FeatureCharacteristics {
            service: OPTICAL_SERVICE,
            data: OPTICAL_DATA,
            config: Some(OPTICAL_CONFIG),
            period: Some(OPTICAL_PERIOD),
        },
        Feature::Accelerometer | Feature::Gyroscope | Feature::Magnetometer => {
            FeatureCharacteristics {
                service: MOVEMENT_SERVICE,
                data: MOVEMENT_DATA,
                config: Some(MOVEMENT_CONFIG),
                period: Some(MOVEMENT_PERIOD),
            }
        }
        Feature::Buttons => FeatureCharacteristics {
            service: SIMPLE_KEYS_SERVICE,
            data: SIMPLE_KEYS_DATA,
            config: None,
            period: None,
        },
    }
}

/// Movement config bits owned by `feature`, or `None` for non-movement sensors.
pub fn movement_bits(feature: Feature) -> Option<u16> {
    match feature {
        Feature::Gyroscope => Some(MOVEMENT_GYROSCOPE_BITS),
        Feature::Accelerometer => Some(MOVEMENT_ACCELEROMETER_BITS | MOVEMENT_ACCEL_RANGE_8G),
        Feature::Magnetometer => Some(MOVEMENT_MAGNETOMETER_BITS),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_uuids_share_ti_base() {
        for uuid in [
            IR_TEMPERATURE_DATA,
            HUMIDITY_DATA,
            BAROMETER_DATA,
            OPTICAL_DATA,
            MOVEMENT_DATA,
        ] {
            let text = uuid.to_string();
            assert!(text.starts_with("f000aa"), "{text}");
            assert!(text.ends_with("-0451-4000-b000-000000000000"), "{text}");
        }
    }

    #[test]
    fn test_movement_features_share_characteristics() {
        let accel = characteristics(Feature::Accelerometer);
        assert_eq!(accel, characteristics(Feature::Gyroscope));
        assert_eq!(accel, characteristics(Feature::Magnetometer));
        assert_eq!(accel.data, MOVEMENT_DATA);
    }

    #[test]
    fn test_buttons_have_no_config() {
        let keys = characteristics(Feature::Buttons);
        assert_eq!(keys.data.to_string(), "0000ffe1-0000-1000-8000-00805f9b34fb");
        assert!(keys.config.is_none());
        assert!(keys.period.is_none());
    }

    #[test]
    fn test_movement_bits_are_disjoint() {
        let gyro = movement_bits(Feature::Gyroscope).unwrap();
        let accel = movement_bits(Feature::Accelerometer).unwrap();
        let mag = movement_bits(Feature::Magnetometer).unwrap();
        assert_eq!(gyro & accel, 0);
        assert_eq!(gyro & mag, 0);
        assert_eq!(accel & mag, 0);
        assert_eq!(gyro | accel | mag, 0x027F);
        assert!(movement_bits(Feature::Humidity).is_none());
    }
}
