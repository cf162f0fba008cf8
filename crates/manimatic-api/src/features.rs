//! Feature flags controlling optional API surface.
//!
//! Flags arrive as a comma-separated setting (`FEATURES=user-compile`) and
//! are served back to the frontend via `GET /features`.

use serde::Serialize;

/// Known feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureKey {
    /// Allows users to edit scripts and compile them with arbitrary input.
    UserCompile,
    /// Enables high-quality (4K) rendering of animations.
    HighQuality,
}

impl FeatureKey {
    fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "user-compile" => Some(Self::UserCompile),
            "high-quality" => Some(Self::HighQuality),
            _ => None,
        }
    }
}

/// One feature flag with its served metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Feature {
    /// The flag key.
    pub key: FeatureKey,
    /// User-facing description.
    pub description: &'static str,
    /// Whether the flag is currently enabled.
    pub enabled: bool,
}

/// The full feature set, as served by `GET /features`.
#[derive(Debug, Clone, Serialize)]
pub struct Features {
    version: &'static str,
    features: Vec<Feature>,
}

const FEATURES_VERSION: &str = "0.1.0";

impl Features {
    /// Parses a comma-separated list of enabled flag names.
    ///
    /// Unknown names are ignored.
    #[must_use]
    pub fn from_flags(input: &str) -> Self {
        let enabled: Vec<FeatureKey> = input
            .split(',')
            .filter_map(|flag| FeatureKey::from_flag(flag.trim()))
            .collect();

        let features = vec![
            Feature {
                key: FeatureKey::UserCompile,
                description: "Allows users to edit scripts and compile them with arbitrary input.",
                enabled: enabled.contains(&FeatureKey::UserCompile),
            },
            Feature {
                key: FeatureKey::HighQuality,
                description: "Enables high-quality (4K) rendering of animations.",
                enabled: enabled.contains(&FeatureKey::HighQuality),
            },
        ];

        Self {
            version: FEATURES_VERSION,
            features,
        }
    }

    /// Returns whether `key` is enabled.
    #[must_use]
    pub fn is_enabled(&self, key: FeatureKey) -> bool {
        self.features
            .iter()
            .any(|feature| feature.key == key && feature.enabled)
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::from_flags("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_flags() {
        let features = Features::from_flags("user-compile, high-quality");
        assert!(features.is_enabled(FeatureKey::UserCompile));
        assert!(features.is_enabled(FeatureKey::HighQuality));
    }

    #[test]
    fn unknown_flags_are_ignored() {
        let features = Features::from_flags("turbo-mode,user-compile");
        assert!(features.is_enabled(FeatureKey::UserCompile));
        assert!(!features.is_enabled(FeatureKey::HighQuality));
    }

    #[test]
    fn empty_input_disables_everything() {
        let features = Features::from_flags("");
        assert!(!features.is_enabled(FeatureKey::UserCompile));
        assert!(!features.is_enabled(FeatureKey::HighQuality));
    }

    #[test]
    fn serializes_with_version_and_kebab_case_keys() {
        let features = Features::from_flags("user-compile");
        let value = serde_json::to_value(&features).expect("serialize");
        assert_eq!(value["version"], FEATURES_VERSION);
        assert_eq!(value["features"][0]["key"], "user-compile");
        assert_eq!(value["features"][0]["enabled"], true);
        assert_eq!(value["features"][1]["enabled"], false);
    }
}
