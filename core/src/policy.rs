use once_cell::sync::Lazy;
use regex_lite::Regex;

static SEPARATOR_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_.]+").unwrap());

/// Canonical package name: lowercased, every run of `-`/`_`/`.` collapsed
/// into a single `-`.
pub fn normalize_package_name(package_name: &str) -> String {
    SEPARATOR_RUNS
        .replace_all(&package_name.trim().to_lowercase(), "-")
        .into_owned()
}

/// A package is denied when its normalized name equals a denylist entry or
/// begins with `<entry>-`. `torchserve` is not a `torch` match; the prefix
/// rule requires the separator.
pub fn is_denied_package(package_name: &str, denylist: &[String]) -> bool {
    let candidate = normalize_package_name(package_name);
    denylist.iter().any(|denied| {
        let blocked = normalize_package_name(denied);
        candidate == blocked || candidate.starts_with(&format!("{blocked}-"))
    })
}
