//! One-time compatibility gate for module registrations.
//!
//! A freshly spawned worker must introduce itself with a `register` call
//! before anything else. The gate checks the declared protocol version
//! against the host's own version and its supported floor. A mismatch is
//! not retriable: the same module binary would reconnect and fail the
//! same way, so the instance surfaces as incompatible instead of cycling
//! through the restart policy.

use semver::Version;
use thiserror::Error;

use module_plugin::message::{PROTOCOL_FLOOR, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("module declared an unparseable protocol version `{version}`: {source}")]
    Malformed {
        version: String,
        source: semver::Error,
    },
    #[error("module protocol {version} is older than the supported floor {floor}")]
    BelowFloor { version: Version, floor: Version },
    #[error("module protocol {version} does not match host major version {host}")]
    MajorMismatch { version: Version, host: Version },
    #[error("module protocol {version} is newer than the host protocol {host}")]
    AheadOfHost { version: Version, host: Version },
}

#[derive(Debug, Clone)]
pub struct RegistrationGate {
    host: Version,
    floor: Version,
}

impl RegistrationGate {
    pub fn new() -> Self {
        Self::with_versions(
            Version::parse(PROTOCOL_VERSION).expect("host protocol version is valid semver"),
            Version::parse(PROTOCOL_FLOOR).expect("host protocol floor is valid semver"),
        )
    }

    pub fn with_versions(host: Version, floor: Version) -> Self {
        Self { host, floor }
    }

    pub fn host_version(&self) -> &Version {
        &self.host
    }

    /// Accepts a manifest version iff `floor <= version <= host` with the
    /// host's major. The upper bound also throws out pre-releases of
    /// future versions, which sort below their release but above us.
    pub fn check(&self, manifest_version: &str) -> Result<Version, RegistrationError> {
        let version =
            Version::parse(manifest_version).map_err(|source| RegistrationError::Malformed {
                version: manifest_version.to_string(),
                source,
            })?;

        if version < self.floor {
            return Err(RegistrationError::BelowFloor {
                version,
                floor: self.floor.clone(),
            });
        }
        if version.major != self.host.major {
            return Err(RegistrationError::MajorMismatch {
                version,
                host: self.host.clone(),
            });
        }
        if version > self.host {
            return Err(RegistrationError::AheadOfHost {
                version,
                host: self.host.clone(),
            });
        }
        Ok(version)
    }
}

impl Default for RegistrationGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RegistrationGate {
        RegistrationGate::with_versions(
            Version::parse("2.5.0").unwrap(),
            Version::parse("2.0.0").unwrap(),
        )
    }

    #[test]
    fn matching_version_is_accepted() {
        assert!(gate().check("2.5.0").is_ok());
        assert!(gate().check("2.0.0").is_ok());
        assert!(gate().check("2.4.9").is_ok());
    }

    #[test]
    fn future_major_is_rejected() {
        assert!(matches!(
            gate().check("3.0.0"),
            Err(RegistrationError::MajorMismatch { .. })
        ));
    }

    #[test]
    fn versions_below_the_floor_are_rejected() {
        assert!(matches!(
            gate().check("1.9.0"),
            Err(RegistrationError::BelowFloor { .. })
        ));
    }

    #[test]
    fn newer_minor_and_future_prereleases_are_rejected() {
        assert!(matches!(
            gate().check("2.6.0"),
            Err(RegistrationError::AheadOfHost { .. })
        ));
        // 2.6.0-beta.1 sorts below 2.6.0 but still above the host
        assert!(matches!(
            gate().check("2.6.0-beta.1"),
            Err(RegistrationError::AheadOfHost { .. })
        ));
    }

    #[test]
    fn garbage_versions_are_rejected_with_the_original_text() {
        match gate().check("not-a-version") {
            Err(RegistrationError::Malformed { version, .. }) => {
                assert_eq!(version, "not-a-version")
            }
            other => panic!("expected malformed error, got {other:?}"),
        }
    }
}
