//! NR-021: Logic shared by the package resources (rpm, deb).

use crate::core::state::{PackageState, State};
use crate::error::{ConstructionError, ResourceError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::cmp::Ordering;

/// Accept `version: "1.14"` and integer versions (`version: 2`) in manifests.
/// A YAML float is rejected: `1.10` would silently become `1.1`.
pub fn opt_version<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }
    match Option::<Raw>::deserialize(d)? {
        None => Ok(None),
        Some(Raw::Str(s)) => Ok(Some(s)),
        Some(Raw::Int(i)) => Ok(Some(i.to_string())),
        Some(Raw::Float(f)) => Err(D::Error::custom(format!(
            "version {} was read as a number and may have lost digits; quote it",
            f
        ))),
    }
}

/// Which mutating path a package apply takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing installed.
    Install,
    /// Installed version sorts lower than desired.
    Upgrade,
    /// Installed version sorts higher: remove, then install.
    Downgrade,
}

/// Reject labels that cannot be expressed to the package manager.
pub fn validate(
    kind: &'static str,
    name: &str,
    version: Option<&str>,
    release: Option<&str>,
) -> Result<(), ConstructionError> {
    if name.trim().is_empty() {
        return Err(ConstructionError::EmptyField {
            kind,
            field: "name",
        });
    }
    if let (None, Some(release)) = (version, release) {
        return Err(ConstructionError::ReleaseWithoutVersion {
            kind,
            name: name.to_string(),
            release: release.to_string(),
        });
    }
    Ok(())
}

/// True when the installed label already satisfies the desired one.
///
/// Prefix semantics at component granularity: every component the desired
/// label specifies must match; unspecified components match anything.
pub fn satisfies(installed: &PackageState, desired: &PackageState) -> bool {
    if installed.name != desired.name {
        return false;
    }
    let component = |want: &Option<String>, have: &Option<String>| match want {
        None => true,
        Some(w) => have.as_ref() == Some(w),
    };
    component(&desired.version, &installed.version) && component(&desired.release, &installed.release)
}

/// Package "is different" predicate shared by both package managers.
pub fn is_different(current: &State, desired: &PackageState) -> bool {
    match current.as_package() {
        Some(installed) => !satisfies(installed, desired),
        None => true,
    }
}

/// Choose the transition from `current` to `desired` using the package
/// ecosystem's ordering. `None` when versions compare equal.
pub fn transition(
    current: &State,
    desired: &PackageState,
    compare: fn(&PackageState, &PackageState) -> Ordering,
) -> Option<Transition> {
    let Some(installed) = current.as_package() else {
        return Some(Transition::Install);
    };
    match compare(installed, desired) {
        Ordering::Less => Some(Transition::Upgrade),
        Ordering::Greater => Some(Transition::Downgrade),
        Ordering::Equal => None,
    }
}

/// The single non-blank line of a query. More than one is ambiguous.
pub fn single_line<'a>(resource: &str, output: &'a str) -> Result<&'a str, ResourceError> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    match (lines.next(), lines.next()) {
        (Some(line), None) => Ok(line),
        (None, _) => Err(ResourceError::malformed(
            resource,
            "query returned no output",
            output,
        )),
        (Some(_), Some(_)) => Err(ResourceError::malformed(
            resource,
            "query matched more than one installed package",
            output,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::version::compare_rpm;

    fn pkg(v: Option<&str>, r: Option<&str>) -> PackageState {
        PackageState::new("foo", v, r)
    }

    #[test]
    fn test_nr021_release_requires_version() {
        let err = validate("rpm", "foo", None, Some("1")).unwrap_err();
        assert!(matches!(err, ConstructionError::ReleaseWithoutVersion { .. }));
        assert!(validate("rpm", "", None, None).is_err());
        assert!(validate("rpm", "foo", Some("1.0"), None).is_ok());
    }

    #[test]
    fn test_nr021_satisfies_prefix_components() {
        let installed = pkg(Some("2.4"), Some("6"));
        assert!(satisfies(&installed, &pkg(Some("2.4"), Some("6"))));
        assert!(satisfies(&installed, &pkg(Some("2.4"), None)));
        assert!(satisfies(&installed, &pkg(None, None)));
        assert!(!satisfies(&installed, &pkg(Some("2.4"), Some("7"))));
        assert!(!satisfies(&installed, &pkg(Some("2"), None)));
        assert!(!satisfies(
            &PackageState::new("foobar", Some("2.4"), Some("6")),
            &pkg(None, None)
        ));
    }

    #[test]
    fn test_nr021_transition_three_way() {
        let current = State::Package(pkg(Some("1.0"), Some("1")));
        assert_eq!(
            transition(&current, &pkg(Some("2.0"), Some("1")), compare_rpm),
            Some(Transition::Upgrade)
        );
        assert_eq!(
            transition(&current, &pkg(Some("0.5"), Some("1")), compare_rpm),
            Some(Transition::Downgrade)
        );
        assert_eq!(
            transition(&current, &pkg(Some("1.0"), Some("1")), compare_rpm),
            None
        );
        assert_eq!(
            transition(&State::Empty, &pkg(Some("1.0"), None), compare_rpm),
            Some(Transition::Install)
        );
    }

    #[test]
    fn test_nr021_single_line() {
        assert_eq!(single_line("r", "\nfoo 1 2\n\n").unwrap(), "foo 1 2");
        assert!(single_line("r", "   \n").is_err());
        let err = single_line("r", "foo 1 2\nfoo 1 3\n").unwrap_err();
        assert!(err.to_string().contains("more than one"));
        assert_eq!(err.output(), "foo 1 2\nfoo 1 3\n");
    }
}
