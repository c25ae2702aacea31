use std::fmt;

/// A precompiled set of path patterns.
///
/// Patterns are matched segment-by-segment against the request path:
///
/// - a literal segment matches itself exactly,
/// - `*` matches any single segment,
/// - a trailing `**` matches the remainder of the path, including nothing.
///
/// `/payments/*/capture` matches `/payments/42/capture` but not
/// `/payments/42`; `/internal/**` matches `/internal` and everything below
/// it. Compilation happens once at construction so per-request matching is a
/// segment walk with no allocation.
#[derive(Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<Pattern>,
}

#[derive(Clone)]
struct Pattern {
    segments: Vec<Segment>,
    // True when the pattern ends in `**`.
    open_ended: bool,
}

#[derive(Clone)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl PathMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Pattern::compile(p.as_ref()))
            .collect();
        Self { patterns }
    }

    pub fn push(&mut self, pattern: &str) {
        self.patterns.push(Pattern::compile(pattern));
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

impl fmt::Debug for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathMatcher")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

impl Pattern {
    fn compile(pattern: &str) -> Self {
        let mut segments = Vec::new();
        let mut open_ended = false;

        for segment in pattern.split('/').filter(|s| !s.is_empty()) {
            match segment {
                "**" => {
                    open_ended = true;
                    break;
                }
                "*" => segments.push(Segment::Wildcard),
                literal => segments.push(Segment::Literal(literal.to_string())),
            }
        }

        Self {
            segments,
            open_ended,
        }
    }

    fn matches(&self, path: &str) -> bool {
        let mut path_segments = path.split('/').filter(|s| !s.is_empty());

        for segment in &self.segments {
            let Some(candidate) = path_segments.next() else {
                return false;
            };
            match segment {
                Segment::Literal(literal) => {
                    if literal != candidate {
                        return false;
                    }
                }
                Segment::Wildcard => {}
            }
        }

        self.open_ended || path_segments.next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match_is_exact() {
        let matcher = PathMatcher::new(["/health"]);
        assert!(matcher.matches("/health"));
        assert!(!matcher.matches("/health/live"));
        assert!(!matcher.matches("/healthz"));
    }

    #[test]
    fn single_segment_wildcard() {
        let matcher = PathMatcher::new(["/payments/*/capture"]);
        assert!(matcher.matches("/payments/42/capture"));
        assert!(!matcher.matches("/payments/42"));
        assert!(!matcher.matches("/payments/42/capture/again"));
    }

    #[test]
    fn trailing_double_star_matches_subtree() {
        let matcher = PathMatcher::new(["/internal/**"]);
        assert!(matcher.matches("/internal"));
        assert!(matcher.matches("/internal/metrics"));
        assert!(matcher.matches("/internal/a/b/c"));
        assert!(!matcher.matches("/external/metrics"));
    }

    #[test]
    fn double_star_alone_matches_everything() {
        let matcher = PathMatcher::new(["/**"]);
        assert!(matcher.matches("/"));
        assert!(matcher.matches("/anything/at/all"));
    }

    #[test]
    fn trailing_slash_is_insignificant() {
        let matcher = PathMatcher::new(["/orders"]);
        assert!(matcher.matches("/orders/"));
    }

    #[test]
    fn empty_matcher_matches_nothing() {
        let matcher = PathMatcher::default();
        assert!(matcher.is_empty());
        assert!(!matcher.matches("/orders"));
    }
}
