// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Version of the payload encoding a message was written with.
///
/// Agents write payloads with their maximum supported serial version. Readers reject payloads
/// whose serial version is newer than what they support.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
    serde::Deserialize,
)]
#[display("v{_0}")]
#[serde(transparent)]
pub struct SerialVersion(u16);

impl SerialVersion {
    pub const MIN: SerialVersion = SerialVersion(1);

    pub const fn new(version: u16) -> Self {
        SerialVersion(version)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether a payload written with `self` can be read by a reader supporting up to `max`.
    pub fn is_readable_by(&self, max: SerialVersion) -> bool {
        self.0 >= Self::MIN.0 && self.0 <= max.0
    }
}

impl Default for SerialVersion {
    fn default() -> Self {
        SerialVersion::MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_range() {
        let max = SerialVersion::new(3);
        assert!(SerialVersion::MIN.is_readable_by(max));
        assert!(SerialVersion::new(3).is_readable_by(max));
        assert!(!SerialVersion::new(4).is_readable_by(max));
        assert!(!SerialVersion::new(0).is_readable_by(max));
    }

    #[test]
    fn display() {
        assert_eq!(SerialVersion::new(2).to_string(), "v2");
    }
}
