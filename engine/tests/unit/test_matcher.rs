//! Failure classification tests

use proptest::prelude::*;

use rollout::deploy::matcher::Matcher;
use rollout::models::catalogue::Category;

use crate::support::CATALOGUE;

/// Two patterns matching the same word at different priorities
fn overlapping(low_first: bool) -> Matcher {
    let (a, b) = if low_first { (5, 50) } else { (50, 5) };
    let json = format!(
        r#"{{
            "recovery_actions": [{{"id": "noop", "commands": ["true"]}}],
            "patterns": [
                {{"name": "network", "regex": "refused", "category": "network",
                  "severity": "medium", "priority": {a}, "recovery": "noop"}},
                {{"name": "crash", "regex": "refused|segfault", "category": "process-crash",
                  "severity": "high", "priority": {b}, "recovery": "noop"}}
            ]
        }}"#
    );
    Matcher::from_json(&json).unwrap()
}

#[test]
fn test_priority_decides_between_overlapping_patterns() {
    let line = "connect to 10.0.0.5 port 5432 failed: Connection refused";
    assert_eq!(overlapping(true).classify(line).unwrap().category, Category::Network);
    assert_eq!(
        overlapping(false).classify(line).unwrap().category,
        Category::ProcessCrash
    );
    assert_eq!(
        overlapping(true).classify("Segmentation fault (core dumped): segfault").unwrap().category,
        Category::ProcessCrash
    );
}

#[test]
fn test_builtin_catalogue_samples() {
    let matcher = Matcher::builtin().unwrap();
    let cases = [
        ("write error: No space left on device", Category::DiskSpace),
        ("curl: (6) Could not resolve host: deb.example.org", Category::Network),
        ("/usr/bin/app: line 12: 4211 Segmentation fault (core dumped)", Category::ProcessCrash),
    ];
    for (line, category) in cases {
        match matcher.classify(line) {
            Some(hit) => assert_eq!(hit.category, category, "{}", line),
            None => panic!("no pattern matched {:?}", line),
        }
    }
}

proptest! {
    #[test]
    fn prop_classify_is_deterministic(line in ".{0,120}") {
        let matcher = Matcher::from_json(CATALOGUE).unwrap();
        let first = matcher.classify(&line);
        let second = matcher.classify(&line);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_embedded_signature_is_found(prefix in "[a-z ]{0,40}", suffix in "[a-z ]{0,40}") {
        let matcher = Matcher::from_json(CATALOGUE).unwrap();
        let line = format!("{}Unmet dependencies{}", prefix, suffix);
        let hit = matcher.classify(&line);
        prop_assert!(hit.is_some());
        prop_assert_eq!(hit.unwrap().category, Category::DependencyConflict);
    }

    #[test]
    fn prop_lowest_priority_match_wins(a in -100i64..100, b in -100i64..100) {
        prop_assume!(a != b);
        let json = format!(
            r#"{{"patterns": [
                {{"name": "a", "regex": "fail", "category": "network", "severity": "low",
                  "priority": {a}, "recovery": {{"commands": ["true"]}}}},
                {{"name": "b", "regex": "fail", "category": "permission", "severity": "low",
                  "priority": {b}, "recovery": {{"commands": ["true"]}}}}
            ]}}"#
        );
        let matcher = Matcher::from_json(&json).unwrap();
        let hit = matcher.classify("step failed").unwrap();
        let expected = if a < b { "a" } else { "b" };
        prop_assert_eq!(hit.pattern, expected);
    }
}
