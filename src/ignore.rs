//! # IgnoreMatcher
//!
//! Glob filtering of candidate file paths against a project's configured
//! ignore patterns, ported from the original service's `should_ignore_file`
//! (`fnmatch` per path component and per prefix). Shell-style wildcards
//! (`?`, `*`, `[...]`) are supported; there is no dependency on a glob crate
//! since the matching rules here are a small, fixed subset of `fnmatch`.

/// Compiles a list of ignore glob patterns and matches candidate paths
/// against them.
pub struct IgnoreMatcher {
    patterns: Vec<String>,
}

impl IgnoreMatcher {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            patterns: patterns.into_iter().collect(),
        }
    }

    /// Returns true if `path` (forward-slash relative) should be ignored:
    /// any pattern matches the full path, or matches any prefix path
    /// obtained by splitting on `/`. This lets a pattern like `build/*`
    /// ignore everything under `build/`, and a bare pattern like
    /// `node_modules` ignore any path that has that directory as a
    /// component.
    pub fn is_ignored(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        for pattern in &self.patterns {
            if fnmatch(path, pattern) {
                return true;
            }
            let parts: Vec<&str> = path.split('/').collect();
            for i in 0..parts.len() {
                let partial = parts[..=i].join("/");
                if fnmatch(&partial, pattern) {
                    return true;
                }
            }
        }
        false
    }
}

/// Shell-style glob match: `?` any single char, `*` any run of chars
/// (including none), `[seq]`/`[!seq]` a character class, anything else
/// literal. Equivalent to Python's `fnmatch.fnmatch` for the subset of
/// syntax the spec calls out.
fn fnmatch(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    match_from(&name, 0, &pattern, 0)
}

fn match_from(name: &[char], ni: usize, pattern: &[char], pi: usize) -> bool {
    if pi == pattern.len() {
        return ni == name.len();
    }

    match pattern[pi] {
        '*' => {
            // Try consuming zero or more characters of `name`.
            for consume in 0..=(name.len() - ni) {
                if match_from(name, ni + consume, pattern, pi + 1) {
                    return true;
                }
            }
            false
        }
        '?' => {
            if ni < name.len() {
                match_from(name, ni + 1, pattern, pi + 1)
            } else {
                false
            }
        }
        '[' => {
            if ni >= name.len() {
                return false;
            }
            match parse_class(pattern, pi) {
                Some((matches, next_pi)) => {
                    if matches(name[ni]) {
                        match_from(name, ni + 1, pattern, next_pi)
                    } else {
                        false
                    }
                }
                None => {
                    // Unterminated class: treat '[' as a literal.
                    name[ni] == '[' && match_from(name, ni + 1, pattern, pi + 1)
                }
            }
        }
        c => ni < name.len() && name[ni] == c && match_from(name, ni + 1, pattern, pi + 1),
    }
}

/// Parses a `[...]` character class starting at `pattern[start]` (which
/// must be `[`). Returns a matcher closure and the index just past the
/// closing `]`, or `None` if the class is unterminated.
fn parse_class(pattern: &[char], start: usize) -> Option<(impl Fn(char) -> bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&'!');
    if negate {
        i += 1;
    }
    let set_start = i;
    // A `]` right after `[` or `[!` is a literal member, not the closer.
    if pattern.get(i) == Some(&']') {
        i += 1;
    }
    while i < pattern.len() && pattern[i] != ']' {
        i += 1;
    }
    if i >= pattern.len() {
        return None;
    }
    let members: Vec<char> = pattern[set_start..i].to_vec();
    let end = i + 1;

    Some((
        move |c: char| {
            let mut found = false;
            let mut j = 0;
            while j < members.len() {
                if j + 2 < members.len() && members[j + 1] == '-' {
                    let (lo, hi) = (members[j], members[j + 2]);
                    if lo <= c && c <= hi {
                        found = true;
                    }
                    j += 3;
                } else {
                    if members[j] == c {
                        found = true;
                    }
                    j += 1;
                }
            }
            found != negate
        },
        end,
    ))
}
