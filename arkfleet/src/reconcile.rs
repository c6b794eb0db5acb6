//! Matching logical instance names to observed runtime identities.
//!
//! The container runtime prefixes workload names and sometimes carries
//! map/cluster suffixes the locally configured name does not, so the match
//! is fuzzy. The policy is an explicitly ordered rule list rather than
//! scattered comparisons: exact match after prefix stripping beats substring
//! containment, which beats the same two rules applied after stripping a
//! fixed set of known suffixes. Ties resolve to the earliest-listed
//! candidate, which makes the whole function deterministic.

/// Suffixes the runtime or the operator habitually appends to names.
/// Additions here extend the policy; the rule order never changes.
pub const KNOWN_SUFFIXES: &[&str] = &[
    "-server",
    "_server",
    "-cluster",
    "_cluster",
    "-theisland",
    "-thecenter",
    "-scorchedearth",
    "-aberration",
    "-extinction",
    "-ragnarok",
    "-astraeos",
    "-club",
];

/// Return the best-matching candidate for `logical`, or `None` when the
/// instance is not running.
///
/// `prefix` is the fleet marker the runtime prepends (e.g. `asa_`); it is
/// stripped from candidates before comparison. Matching is case-insensitive
/// and at most one candidate is returned.
pub fn best_match<'a>(logical: &str, prefix: &str, candidates: &'a [String]) -> Option<&'a str> {
    let logical = logical.to_lowercase();
    let prefix = prefix.to_lowercase();

    let stripped: Vec<String> = candidates
        .iter()
        .map(|candidate| {
            let lower = candidate.to_lowercase();
            lower
                .strip_prefix(&prefix)
                .map(str::to_string)
                .unwrap_or(lower)
        })
        .collect();

    // Rule 1: exact match after prefix stripping.
    if let Some(idx) = stripped.iter().position(|name| *name == logical) {
        return Some(&candidates[idx]);
    }

    // Rule 2: either side contains the other.
    if let Some(idx) = stripped.iter().position(|name| contains_either(name, &logical)) {
        return Some(&candidates[idx]);
    }

    // Rule 3: rules 1-2 again after stripping known suffixes from both sides.
    let logical_bare = strip_suffixes(&logical);
    let bare: Vec<String> = stripped.iter().map(|name| strip_suffixes(name)).collect();

    if let Some(idx) = bare.iter().position(|name| *name == logical_bare) {
        return Some(&candidates[idx]);
    }
    if let Some(idx) = bare
        .iter()
        .position(|name| contains_either(name, &logical_bare))
    {
        return Some(&candidates[idx]);
    }

    None
}

fn contains_either(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}

/// Strip trailing known suffixes, repeatedly, until none applies.
fn strip_suffixes(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let before = current.len();
        for suffix in KNOWN_SUFFIXES {
            if let Some(rest) = current.strip_suffix(suffix) {
                current = rest.to_string();
                break;
            }
        }
        if current.len() == before {
            return current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn exact_match_after_prefix_strip() {
        let pool = candidates(&["asa_center", "asa_island"]);
        assert_eq!(best_match("center", "asa_", &pool), Some("asa_center"));
    }

    #[test]
    fn exact_outranks_substring() {
        // "center" is a substring of both, but only one is exact.
        let pool = candidates(&["asa_center-backup", "asa_center"]);
        assert_eq!(best_match("center", "asa_", &pool), Some("asa_center"));
    }

    #[test]
    fn substring_match_in_either_direction() {
        let pool = candidates(&["asa_ragnarok-pvp"]);
        assert_eq!(best_match("ragnarok", "asa_", &pool), Some("asa_ragnarok-pvp"));

        // The accepted ambiguity: a short candidate contained in the logical
        // name still matches.
        let pool = candidates(&["asa_rag"]);
        assert_eq!(best_match("ragnarok-main", "asa_", &pool), Some("asa_rag"));
    }

    #[test]
    fn suffix_stripping_recovers_a_match() {
        let pool = candidates(&["asa_valley-server"]);
        assert_eq!(
            best_match("valley-cluster", "asa_", &pool),
            Some("asa_valley-server")
        );
    }

    #[test]
    fn suffixes_strip_repeatedly() {
        assert_eq!(strip_suffixes("valley-server-cluster"), "valley");
    }

    #[test]
    fn ties_resolve_to_earliest_candidate() {
        let pool = candidates(&["asa_center-a", "asa_center-b"]);
        assert_eq!(best_match("center", "asa_", &pool), Some("asa_center-a"));
    }

    #[test]
    fn case_insensitive_throughout() {
        let pool = candidates(&["ASA_Center"]);
        assert_eq!(best_match("CENTER", "asa_", &pool), Some("ASA_Center"));
    }

    #[test]
    fn no_candidates_means_not_running() {
        assert_eq!(best_match("center", "asa_", &[]), None);
        let pool = candidates(&["asa_island"]);
        assert_eq!(best_match("center", "asa_", &pool), None);
    }

    #[test]
    fn deterministic_on_repeated_calls() {
        let pool = candidates(&["asa_center", "asa_center-backup", "asa_island"]);
        let first = best_match("center", "asa_", &pool);
        for _ in 0..100 {
            assert_eq!(best_match("center", "asa_", &pool), first);
        }
    }

    #[test]
    fn empty_logical_never_matches() {
        let pool = candidates(&["asa_center"]);
        assert_eq!(best_match("", "asa_", &pool), None);
    }
}
