//! Segment-aware path glob matching.
//!
//! Patterns and paths are split on `/`. `*` matches exactly one segment,
//! `**` matches one or more segments, anything else matches literally and
//! case-sensitively. This is capability-rule matching, not filesystem
//! globbing: `a/**` covers `a/b` and `a/b/c` but not `a` itself.

/// Returns whether `path` matches the glob `pattern`.
pub fn matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => {
            if path.is_empty() {
                return false;
            }
            // `**` consumes the current segment, then either keeps
            // consuming or hands over to the remainder of the pattern.
            match_segments(rest, &path[1..]) || match_segments(pattern, &path[1..])
        }
        Some((&"*", rest)) => !path.is_empty() && match_segments(rest, &path[1..]),
        Some((literal, rest)) => {
            path.first() == Some(literal) && match_segments(rest, &path[1..])
        }
    }
}
