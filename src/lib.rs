#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod nat_probe;

pub use nat_probe::{
    DetectionReport, DetectorConfig, MappedAddress, NatClassification, NatDetector, ProbeResult,
    StunServer,
};
