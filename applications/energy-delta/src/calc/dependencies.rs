//! Static scan of calculation text for the points it references.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

// `\b` keeps the `mp(` inside `vmp(` from matching
static MP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bmp\(\s*(\d+)\s*\)").unwrap());
static VMP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bvmp\(\s*(\d+)\s*\)").unwrap());

fn scan(re: &Regex, calculation: &str) -> BTreeSet<i64> {
    re.captures_iter(calculation)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

pub fn referenced_point_ids(calculation: &str) -> BTreeSet<i64> {
    scan(&MP_RE, calculation)
}

pub fn referenced_virtual_point_ids(calculation: &str) -> BTreeSet<i64> {
    scan(&VMP_RE, calculation)
}
