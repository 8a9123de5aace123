// Freshness heuristics for Debian-style mirror layouts. Matching is plain
// substring matching: mirror layouts vary too much for structural parsing,
// and a false positive only costs an extra revalidation.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub use_conditional: bool,
    pub validate_with_origin: bool,
}

impl FreshnessPolicy {
    pub const FORCE_REVALIDATE: FreshnessPolicy = FreshnessPolicy {
        use_conditional: true,
        validate_with_origin: true,
    };
}

const MUTABLE_INDEX_TOKENS: &[&str] = &[
    "Release",
    "Release.gpg",
    "InRelease",
    "Packages",
    "Packages.gz",
    "Packages.xz",
    "Sources",
    "Sources.gz",
    "Sources.xz",
    "Contents-",
    "Index",
];

const CRITICAL_TOKENS: &[&str] = &["Release", "Release.gpg", "InRelease"];

const DISTS_CHANGING_TOKENS: &[&str] = &["Packages", "Sources", "Contents"];

pub fn classify(path: &str) -> FreshnessPolicy {
    FreshnessPolicy {
        use_conditional: should_use_conditional(path),
        validate_with_origin: should_validate_with_origin(path),
    }
}

// Objects under pool/ are immutable once published: a new package version is
// a new pool path. Conditional requests for them are answered from cache
// without any origin traffic.
fn should_use_conditional(path: &str) -> bool {
    if path.contains("/dists/") {
        return true;
    }
    if path.contains("/pool/") {
        return false;
    }
    let name = basename(path);
    MUTABLE_INDEX_TOKENS.iter().any(|token| name.contains(token))
}

fn should_validate_with_origin(path: &str) -> bool {
    if CRITICAL_TOKENS.iter().any(|token| path.contains(token)) {
        return true;
    }
    if path.contains("/dists/")
        && DISTS_CHANGING_TOKENS.iter().any(|token| path.contains(token))
    {
        return true;
    }
    if path.contains("/pool/") {
        return false;
    }
    false
}

pub fn is_release_route(path: &str) -> bool {
    matches!(basename(path), "Release" | "Release.gpg" | "InRelease")
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
