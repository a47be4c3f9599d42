//! Platform-agnostic types for TI SensorTag arbitration.
//!
//! This crate holds the vocabulary shared by the arbitration core
//! (tagmux-core) and the host service (tagmux-service):
//!
//! - Tag identity and hardware generation ([`TagId`], [`TagKind`])
//! - The enumerated sensor feature set with clamped sample periods
//! - Decoded [`Reading`]s and the GATT payload decoders
//! - UUID constants for the SensorTag services
//!
//! # Example
//!
//! ```
//! use tagmux_types::{Feature, FeatureConfig, FeatureSet, Reading, SamplePeriod};
//!
//! let features = FeatureSet::new()
//!     .with(FeatureConfig::Temperature)
//!     .with(FeatureConfig::Light { period: SamplePeriod::clamped(500) });
//! assert_eq!(features.len(), 2);
//!
//! let reading = Reading::decode(Feature::Buttons, &[0x01]).unwrap();
//! assert_eq!(reading, Reading::Buttons { left: false, right: true });
//! ```

pub mod error;
pub mod reading;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use reading::Reading;
pub use types::{Feature, FeatureConfig, FeatureSet, SamplePeriod, TagId, TagKind};
pub use uuid as uuids;
