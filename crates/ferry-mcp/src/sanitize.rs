//! Tool-name rules for the LLM API.
//!
//! Names sent to the model must match `[A-Za-z0-9_-]{1,128}`.

use std::collections::HashSet;

/// Longest name the LLM API accepts.
pub const MAX_TOOL_NAME_LEN: usize = 128;

const EMPTY_NAME: &str = "tool";

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Whether `name` already satisfies the API's naming rule.
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_TOOL_NAME_LEN && name.chars().all(is_allowed)
}

/// Rewrite `raw` into a valid tool name.
///
/// Every disallowed character becomes `_` and the result is cut to
/// [`MAX_TOOL_NAME_LEN`]. Valid names come back unchanged, so applying this
/// twice is the same as applying it once.
pub fn sanitize_tool_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if is_allowed(c) { c } else { '_' })
        .take(MAX_TOOL_NAME_LEN)
        .collect();
    if name.is_empty() {
        name.push_str(EMPTY_NAME);
    }
    name
}

/// Hands out unique names in first-come order.
///
/// The first claimant of a name keeps it; later ones get `_2`, `_3`, and so
/// on, with the base shortened so the result stays within the length limit.
#[derive(Debug, Default)]
pub struct NameAllocator {
    taken: HashSet<String>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a unique name derived from an already-sanitized `base`.
    pub fn claim(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 2usize;
        loop {
            let suffix = format!("_{n}");
            let stem = ferry_types::truncate_str(base, MAX_TOOL_NAME_LEN - suffix.len());
            let candidate = format!("{stem}{suffix}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_and_punctuation_become_underscores() {
        assert_eq!(sanitize_tool_name("suggest team"), "suggest_team");
        assert_eq!(sanitize_tool_name("team.builder/v2"), "team_builder_v2");
        assert_eq!(sanitize_tool_name("ok-name_1"), "ok-name_1");
    }

    #[test]
    fn non_ascii_is_replaced_per_char() {
        assert_eq!(sanitize_tool_name("Flabébé"), "Flab_b_");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in ["suggest team", "a b c", "", "x".repeat(300).as_str(), "naïve tool!"] {
            let once = sanitize_tool_name(raw);
            assert!(is_valid_tool_name(&once), "{once:?}");
            assert_eq!(sanitize_tool_name(&once), once);
        }
    }

    #[test]
    fn empty_and_long_names() {
        assert_eq!(sanitize_tool_name(""), "tool");
        assert_eq!(sanitize_tool_name(&"a".repeat(200)).len(), MAX_TOOL_NAME_LEN);
    }

    #[test]
    fn allocator_suffixes_in_claim_order() {
        let mut names = NameAllocator::new();
        assert_eq!(names.claim("search"), "search");
        assert_eq!(names.claim("search"), "search_2");
        assert_eq!(names.claim("search"), "search_3");
        assert_eq!(names.claim("lookup"), "lookup");
    }

    #[test]
    fn allocator_skips_names_already_taken() {
        let mut names = NameAllocator::new();
        assert_eq!(names.claim("search_2"), "search_2");
        assert_eq!(names.claim("search"), "search");
        assert_eq!(names.claim("search"), "search_3");
    }

    #[test]
    fn allocator_keeps_suffixed_names_in_bounds() {
        let long = "a".repeat(MAX_TOOL_NAME_LEN);
        let mut names = NameAllocator::new();
        names.claim(&long);
        let second = names.claim(&long);
        assert_eq!(second.len(), MAX_TOOL_NAME_LEN);
        assert!(second.ends_with("_2"));
        assert!(is_valid_tool_name(&second));
    }
}
