use tracing::{debug, info};

use crate::config::PolicyConfig;
use crate::sources::UpdateCandidate;
use crate::version::Version;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub pinned: Option<Version>,
    pub allow_downgrade: bool,
    /// With nothing installed yet, ignore the pin for the first install.
    pub bootstrap_bypasses_policy: bool,
}

impl From<&PolicyConfig> for Policy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            pinned: config
                .pinned_version
                .as_deref()
                .and_then(Version::parse_lenient),
            allow_downgrade: config.allow_downgrade,
            bootstrap_bypasses_policy: config.bootstrap_bypasses_policy,
        }
    }
}

impl Policy {
    /// The pin that applies given what is currently installed.
    pub fn effective_pin(&self, current: Option<&Version>) -> Option<Version> {
        if current.is_none() && self.bootstrap_bypasses_policy {
            None
        } else {
            self.pinned
        }
    }
}

/// Picks the single best candidate.
///
/// Unparseable versions are dropped, then anything that differs from the
/// effective pin. The highest version wins, with the earliest candidate
/// kept on ties. A result below `current` is rejected unless downgrades are
/// allowed.
pub fn resolve(
    candidates: &[UpdateCandidate],
    current: Option<&Version>,
    policy: &Policy,
) -> Option<UpdateCandidate> {
    let pin = policy.effective_pin(current);

    let mut best: Option<(Version, &UpdateCandidate)> = None;
    for candidate in candidates {
        let Some(version) = candidate.parsed_version() else {
            debug!(source = %candidate.source, version = %candidate.version, "dropping candidate with unparseable version");
            continue;
        };
        if pin.is_some_and(|pin| pin != version) {
            debug!(source = %candidate.source, version = %version, "dropping candidate that is not the pinned version");
            continue;
        }
        match best {
            Some((best_version, _)) if version <= best_version => {}
            _ => best = Some((version, candidate)),
        }
    }

    let (version, candidate) = best?;
    if let Some(current) = current {
        if version < *current && !policy.allow_downgrade {
            info!(
                candidate = %version,
                current = %current,
                "best candidate is older than installed version and downgrades are disabled"
            );
            return None;
        }
    }
    Some(candidate.clone())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{resolve, Policy};
    use crate::sources::{ArtifactKind, SourceKind, UpdateCandidate};
    use crate::version::Version;

    fn candidate(source: SourceKind, version: &str) -> UpdateCandidate {
        UpdateCandidate {
            source,
            version: version.to_string(),
            artifact_kind: ArtifactKind::Archive,
            locator: format!("/releases/{}-{}.zip", source, version),
            digest_ref: None,
            signature_ref: None,
        }
    }

    fn v(raw: &str) -> Version {
        Version::parse(raw).expect("version")
    }

    #[test]
    fn picks_highest_version() {
        let candidates = vec![
            candidate(SourceKind::Registry, "1.9.0"),
            candidate(SourceKind::Archive, "1.10.0"),
            candidate(SourceKind::Share, "1.2"),
        ];
        let chosen = resolve(&candidates, Some(&v("1.0.0")), &Policy::default()).expect("chosen");
        assert_eq!(chosen.version, "1.10.0");
    }

    #[test]
    fn ties_keep_first_seen() {
        let candidates = vec![
            candidate(SourceKind::Registry, "2.0"),
            candidate(SourceKind::Share, "2.0.0"),
        ];
        let chosen = resolve(&candidates, None, &Policy::default()).expect("chosen");
        assert_eq!(chosen.source, SourceKind::Registry);
    }

    #[test]
    fn unparseable_versions_are_dropped() {
        let candidates = vec![
            candidate(SourceKind::Registry, "latest"),
            candidate(SourceKind::Share, "1.0.1"),
        ];
        let chosen = resolve(&candidates, None, &Policy::default()).expect("chosen");
        assert_eq!(chosen.source, SourceKind::Share);
        assert_eq!(
            resolve(&[candidate(SourceKind::Registry, "nightly")], None, &Policy::default()),
            None
        );
    }

    #[test]
    fn pin_excludes_greater_versions() {
        let policy = Policy {
            pinned: Some(v("2.0.0")),
            ..Policy::default()
        };
        let candidates = vec![
            candidate(SourceKind::Registry, "3.0.0"),
            candidate(SourceKind::Share, "2.0.0"),
        ];
        let chosen = resolve(&candidates, Some(&v("1.0.0")), &policy).expect("chosen");
        assert_eq!(chosen.version, "2.0.0");
        assert_eq!(
            resolve(&[candidate(SourceKind::Registry, "3.0.0")], Some(&v("1.0.0")), &policy),
            None
        );
    }

    #[test]
    fn downgrade_requires_permission() {
        let candidates = vec![candidate(SourceKind::Archive, "2.9.0")];
        let current = v("3.0.0");
        assert_eq!(resolve(&candidates, Some(&current), &Policy::default()), None);
        let allow = Policy {
            allow_downgrade: true,
            ..Policy::default()
        };
        assert_eq!(
            resolve(&candidates, Some(&current), &allow).map(|c| c.version),
            Some("2.9.0".to_string())
        );
    }

    #[test]
    fn bootstrap_flag_only_applies_without_installed_version() {
        let policy = Policy {
            pinned: Some(v("2.0.0")),
            bootstrap_bypasses_policy: true,
            ..Policy::default()
        };
        let candidates = vec![candidate(SourceKind::Registry, "3.0.0")];
        assert_eq!(
            resolve(&candidates, None, &policy).map(|c| c.version),
            Some("3.0.0".to_string())
        );
        assert_eq!(resolve(&candidates, Some(&v("1.0.0")), &policy), None);

        let strict = Policy {
            bootstrap_bypasses_policy: false,
            ..policy
        };
        assert_eq!(resolve(&candidates, None, &strict), None);
    }

    fn version_strategy() -> impl Strategy<Value = Version> {
        (0u64..5, 0u64..5, 0u64..5).prop_map(|(a, b, c)| Version::new(a, b, c))
    }

    fn candidates_strategy() -> impl Strategy<Value = Vec<UpdateCandidate>> {
        proptest::collection::vec(
            (
                prop_oneof![
                    Just(SourceKind::Registry),
                    Just(SourceKind::Archive),
                    Just(SourceKind::Share)
                ],
                version_strategy(),
            )
                .prop_map(|(source, version)| candidate(source, &version.to_string())),
            0..8,
        )
    }

    proptest! {
        #[test]
        fn selected_version_is_the_maximum_of_admissible_candidates(
            candidates in candidates_strategy(),
            current in proptest::option::of(version_strategy()),
            pinned in proptest::option::of(version_strategy()),
            allow_downgrade in any::<bool>(),
        ) {
            let policy = Policy { pinned, allow_downgrade, bootstrap_bypasses_policy: false };
            let admissible: Vec<Version> = candidates
                .iter()
                .filter_map(UpdateCandidate::parsed_version)
                .filter(|version| pinned.map_or(true, |pin| pin == *version))
                .collect();
            let chosen = resolve(&candidates, current.as_ref(), &policy);

            match admissible.iter().max() {
                None => prop_assert!(chosen.is_none()),
                Some(max) => {
                    let rejected = current.map_or(false, |cur| *max < cur) && !allow_downgrade;
                    if rejected {
                        prop_assert!(chosen.is_none());
                    } else {
                        let chosen = chosen.expect("a candidate must be chosen");
                        prop_assert_eq!(chosen.parsed_version(), Some(*max));
                    }
                }
            }
        }

        #[test]
        fn pinned_policy_never_selects_another_version(
            candidates in candidates_strategy(),
            pinned in version_strategy(),
        ) {
            let policy = Policy { pinned: Some(pinned), allow_downgrade: true, bootstrap_bypasses_policy: false };
            if let Some(chosen) = resolve(&candidates, None, &policy) {
                prop_assert_eq!(chosen.parsed_version(), Some(pinned));
            }
        }

        #[test]
        fn selected_version_does_not_depend_on_order(
            candidates in candidates_strategy(),
        ) {
            let forward = resolve(&candidates, None, &Policy::default()).and_then(|c| c.parsed_version());
            let mut reversed = candidates.clone();
            reversed.reverse();
            let backward = resolve(&reversed, None, &Policy::default()).and_then(|c| c.parsed_version());
            prop_assert_eq!(forward, backward);
        }
    }
}
