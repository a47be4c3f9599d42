//! Core types for SensorTag arbitration.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Stable identifier of a physical tag (its hardware address).
///
/// Identifiers are normalised on construction: lowercase, with `:` and `-`
/// separators removed, so `"B0:B4:48:C9:8A:83"` and `"b0b448c98a83"` name the
/// same tag.
///
/// ```
/// use tagmux_types::TagId;
///
/// let a = TagId::new("B0:B4:48:C9:8A:83");
/// let b: TagId = "b0b448c98a83".parse().unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "b0b448c98a83");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct TagId(String);

impl TagId {
    /// Create an identifier, normalising separators and case.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let normalized = raw
            .as_ref()
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-'))
            .flat_map(char::to_lowercase)
            .collect();
        Self(normalized)
    }

    /// The normalised identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TagId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self::new(s);
        if id.0.is_empty() {
            return Err(ParseError::InvalidValue("tag id cannot be empty".into()));
        }
        Ok(id)
    }
}

impl TryFrom<String> for TagId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TagId> for String {
    fn from(id: TagId) -> Self {
        id.0
    }
}

/// Hardware generation of a SensorTag.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new tag
/// generations without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[non_exhaustive]
pub enum TagKind {
    /// Original CC2540 SensorTag.
    Cc2540,
    /// CC2650 SimpleLink SensorTag.
    Cc2650,
}

impl TagKind {
    /// Detect the tag generation from its advertised local name.
    ///
    /// ```
    /// use tagmux_types::TagKind;
    ///
    /// assert_eq!(TagKind::from_name("CC2650 SensorTag"), Some(TagKind::Cc2650));
    /// assert_eq!(TagKind::from_name("SensorTag"), Some(TagKind::Cc2540));
    /// assert_eq!(TagKind::from_name("TI BLE Sensor Tag"), Some(TagKind::Cc2540));
    /// assert_eq!(TagKind::from_name("LYWSD03MMC"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.contains("cc2650") {
            return Some(TagKind::Cc2650);
        }
        if lower.contains("sensortag") || lower.contains("sensor tag") {
            return Some(TagKind::Cc2540);
        }
        None
    }

    /// Whether this generation carries the given sensor.
    #[must_use]
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Light => matches!(self, TagKind::Cc2650),
            _ => true,
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKind::Cc2540 => write!(f, "CC2540"),
            TagKind::Cc2650 => write!(f, "CC2650"),
        }
    }
}

/// A sensor exposed by a SensorTag.
///
/// Variants are declared in the order features are configured after connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Feature {
    Temperature,
    Accelerometer,
    Humidity,
    Magnetometer,
    Pressure,
    Gyroscope,
    Light,
    Buttons,
}

impl Feature {
    /// Every feature, in configuration order.
    pub const ALL: [Feature; 8] = [
        Feature::Temperature,
        Feature::Accelerometer,
        Feature::Humidity,
        Feature::Magnetometer,
        Feature::Pressure,
        Feature::Gyroscope,
        Feature::Light,
        Feature::Buttons,
    ];

    /// Sensor name used in reading envelopes.
    pub fn sensor_name(&self) -> &'static str {
        match self {
            Feature::Temperature => "temperature",
            Feature::Accelerometer => "accelerometer",
            Feature::Humidity => "humidity",
            Feature::Magnetometer => "magnetometer",
            Feature::Pressure => "pressure",
            Feature::Gyroscope => "gyroscope",
            Feature::Light => "luxometer",
            Feature::Buttons => "keys",
        }
    }

    /// Sensor index used to build per-sensor message ids.
    pub fn sensor_index(&self) -> u8 {
        match self {
            Feature::Temperature => 0,
            Feature::Accelerometer => 1,
            Feature::Humidity => 2,
            Feature::Magnetometer => 3,
            Feature::Pressure => 4,
            Feature::Gyroscope => 5,
            Feature::Light => 6,
            Feature::Buttons => 7,
        }
    }

    /// Whether the sensor has a configurable sample period.
    pub fn has_period(&self) -> bool {
        matches!(
            self,
            Feature::Accelerometer | Feature::Magnetometer | Feature::Gyroscope | Feature::Light
        )
    }

    /// Whether the sensor must be switched on before it produces data.
    ///
    /// The simple-keys service notifies without a configuration write.
    pub fn requires_enable(&self) -> bool {
        !matches!(self, Feature::Buttons)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sensor_name())
    }
}

impl FromStr for Feature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "temperature" => Ok(Feature::Temperature),
            "accelerometer" => Ok(Feature::Accelerometer),
            "humidity" => Ok(Feature::Humidity),
            "magnetometer" => Ok(Feature::Magnetometer),
            "pressure" => Ok(Feature::Pressure),
            "gyroscope" => Ok(Feature::Gyroscope),
            "light" | "luxometer" => Ok(Feature::Light),
            "buttons" | "keys" => Ok(Feature::Buttons),
            other => Err(ParseError::InvalidValue(format!("unknown feature: {other}"))),
        }
    }
}

/// Sensor sample period in milliseconds, always within the device range.
///
/// ```
/// use tagmux_types::SamplePeriod;
///
/// assert_eq!(SamplePeriod::clamped(5).as_millis(), 10);
/// assert_eq!(SamplePeriod::clamped(99_999).as_millis(), 2550);
/// assert_eq!(SamplePeriod::clamped(250).register_value(), 25);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "u64", into = "u64"))]
pub struct SamplePeriod(u16);

impl SamplePeriod {
    /// Shortest period the sensors accept.
    pub const MIN_MS: u16 = 10;
    /// Longest period the sensors accept.
    pub const MAX_MS: u16 = 2550;
    /// Period used when none is configured.
    pub const DEFAULT: SamplePeriod = SamplePeriod(1000);

    /// Clamp a configured value into the valid range.
    pub fn clamped(ms: u64) -> Self {
        let ms = ms.clamp(u64::from(Self::MIN_MS), u64::from(Self::MAX_MS));
        // Bounded by MAX_MS above.
        Self(ms as u16)
    }

    pub fn as_millis(&self) -> u16 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.0))
    }

    /// Value written to the period register (units of 10 ms).
    pub fn register_value(&self) -> u8 {
        // 2550 / 10 fits in a byte.
        (self.0 / 10) as u8
    }
}

impl Default for SamplePeriod {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u64> for SamplePeriod {
    fn from(ms: u64) -> Self {
        Self::clamped(ms)
    }
}

impl From<SamplePeriod> for u64 {
    fn from(period: SamplePeriod) -> Self {
        u64::from(period.0)
    }
}

impl fmt::Display for SamplePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// One enabled sensor with its settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "feature", rename_all = "lowercase"))]
pub enum FeatureConfig {
    Temperature,
    Accelerometer { period: SamplePeriod },
    Humidity,
    Magnetometer { period: SamplePeriod },
    Pressure,
    Gyroscope { period: SamplePeriod },
    Light { period: SamplePeriod },
    Buttons,
}

impl FeatureConfig {
    /// Settings for `feature` with the default period where one applies.
    pub fn with_defaults(feature: Feature) -> Self {
        Self::with_period(feature, SamplePeriod::DEFAULT)
    }

    /// Settings for `feature`; `period` is ignored by sensors without one.
    pub fn with_period(feature: Feature, period: SamplePeriod) -> Self {
        match feature {
            Feature::Temperature => FeatureConfig::Temperature,
            Feature::Accelerometer => FeatureConfig::Accelerometer { period },
            Feature::Humidity => FeatureConfig::Humidity,
            Feature::Magnetometer => FeatureConfig::Magnetometer { period },
            Feature::Pressure => FeatureConfig::Pressure,
            Feature::Gyroscope => FeatureConfig::Gyroscope { period },
            Feature::Light => FeatureConfig::Light { period },
            Feature::Buttons => FeatureConfig::Buttons,
        }
    }

    pub fn feature(&self) -> Feature {
        match self {
            FeatureConfig::Temperature => Feature::Temperature,
            FeatureConfig::Accelerometer { .. } => Feature::Accelerometer,
            FeatureConfig::Humidity => Feature::Humidity,
            FeatureConfig::Magnetometer { .. } => Feature::Magnetometer,
            FeatureConfig::Pressure => Feature::Pressure,
            FeatureConfig::Gyroscope { .. } => Feature::Gyroscope,
            FeatureConfig::Light { .. } => Feature::Light,
            FeatureConfig::Buttons => Feature::Buttons,
        }
    }

    pub fn period(&self) -> Option<SamplePeriod> {
        match self {
            FeatureConfig::Accelerometer { period }
            | FeatureConfig::Magnetometer { period }
            | FeatureConfig::Gyroscope { period }
            | FeatureConfig::Light { period } => Some(*period),
            _ => None,
        }
    }
}

/// The set of sensors a consumer wants enabled on each of its tags.
///
/// At most one entry per [`Feature`]; iteration follows [`Feature::ALL`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "Vec<FeatureConfig>", into = "Vec<FeatureConfig>"))]
pub struct FeatureSet(BTreeMap<Feature, FeatureConfig>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sensor with default periods.
    pub fn all() -> Self {
        Feature::ALL.into_iter().map(FeatureConfig::with_defaults).collect()
    }

    /// Add or replace the settings for one sensor.
    pub fn insert(&mut self, config: FeatureConfig) {
        self.0.insert(config.feature(), config);
    }

    #[must_use]
    pub fn with(mut self, config: FeatureConfig) -> Self {
        self.insert(config);
        self
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains_key(&feature)
    }

    pub fn get(&self, feature: Feature) -> Option<&FeatureConfig> {
        self.0.get(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureConfig> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<FeatureConfig> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = FeatureConfig>>(iter: I) -> Self {
        let mut set = FeatureSet::new();
        for config in iter {
            set.insert(config);
        }
        set
    }
}

impl From<Vec<FeatureConfig>> for FeatureSet {
    fn from(configs: Vec<FeatureConfig>) -> Self {
        configs.into_iter().collect()
    }
}

impl From<FeatureSet> for Vec<FeatureConfig> {
    fn from(set: FeatureSet) -> Self {
        set.0.into_values().collect()
    }
}
