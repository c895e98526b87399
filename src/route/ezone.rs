//! Ezone prefixes on cluster names.
//!
//! A cluster named `<ezone>-<rest>` belongs to `<ezone>` when `<ezone>` is one
//! of the configured ezones. Names may be nested (`alta1-beta-stable`); the
//! outermost prefix is the ezone and every known prefix is stripped.

/// Splits `cluster` into (outermost ezone, bare name).
pub fn split_ezone<'a>(
    ezones: &[String],
    cluster: &'a str,
) -> (Option<&'a str>, &'a str) {
    let mut outer = None;
    let mut rest = cluster;
    while let (Some(ezone), tail) = split_once_known(ezones, rest) {
        outer.get_or_insert(ezone);
        rest = tail;
    }
    (outer, rest)
}

/// `<ezone>-<name>`
pub fn with_ezone(
    ezone: &str,
    name: &str,
) -> String {
    format!("{ezone}-{name}")
}

/// Every known ezone prefix of `cluster`, outermost first
pub fn ezone_chain<'a>(
    ezones: &[String],
    cluster: &'a str,
) -> Vec<&'a str> {
    let mut chain = Vec::new();
    let mut rest = cluster;
    while let (Some(ezone), tail) = split_once_known(ezones, rest) {
        chain.push(ezone);
        rest = tail;
    }
    chain
}

fn split_once_known<'a>(
    ezones: &[String],
    cluster: &'a str,
) -> (Option<&'a str>, &'a str) {
    match cluster.split_once('-') {
        Some((prefix, tail)) if !tail.is_empty() && ezones.iter().any(|e| e == prefix) => (Some(prefix), tail),
        _ => (None, cluster),
    }
}
