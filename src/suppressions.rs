//! Suppression files: which reports the user asked not to see.
//!
//! Line-based UTF-8 text. Blank lines and `#` comments are stripped, as is
//! all interior whitespace. Each remaining line is `prefix:glob` where the
//! prefix selects the frame component and scope:
//!
//! - `obj:` match by binary image, any frame
//! - `src:` match by source file, any frame
//! - `fun:` match by function name, any frame
//! - `fun_r:` function is a race root: only the innermost frame
//! - `fun_hist:` suppress by the historical-access side only
//!
//! Globs support `*` and `?`. An unknown prefix is a fatal parse error.
//!
//! Every rule is a {fun, obj, file} triple (the unnamed components are
//! `*`); a frame matches a rule when all three components match.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Which frames of a report a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionScope {
    /// Any frame of either access.
    Anywhere,
    /// Only the innermost frame of either access.
    RaceRoot,
    /// Any frame of the previous (historical) access.
    Historical,
}

/// One parsed suppression line.
#[derive(Debug, Clone)]
pub struct Suppression {
    pub fun: String,
    pub obj: String,
    pub file: String,
    pub scope: SuppressionScope,
    /// The line as written, for diagnostics.
    pub source_line: String,
}

impl Suppression {
    fn matches_frame(&self, frame: &FrameInfo) -> bool {
        glob_match(&self.fun, frame.func)
            && glob_match(&self.obj, frame.obj)
            && glob_match(&self.file, frame.file)
    }
}

/// Symbolized view of one frame, borrowed from the report being filtered.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo<'a> {
    pub func: &'a str,
    pub obj: &'a str,
    pub file: &'a str,
}

#[derive(Debug, Default, Clone)]
pub struct Suppressions {
    rules: Vec<Suppression>,
}

impl Suppressions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse suppression text. Unknown prefixes abort initialization.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for raw_line in text.lines() {
            let line: String = raw_line
                .split('#')
                .next()
                .unwrap_or("")
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            if line.is_empty() {
                continue;
            }
            rules.push(Self::parse_line(&line)?);
        }
        Ok(Self { rules })
    }

    /// Load and concatenate every file in `paths`.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut all = Self::new();
        for path in paths {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read suppression file {}", path.display()))?;
            let parsed = Self::parse(&text)
                .with_context(|| format!("in suppression file {}", path.display()))?;
            all.rules.extend(parsed.rules);
        }
        Ok(all)
    }

    fn parse_line(line: &str) -> Result<Suppression> {
        let (scope, fun, obj, file) = if let Some(glob) = line.strip_prefix("fun_r:") {
            (SuppressionScope::RaceRoot, glob, "*", "*")
        } else if let Some(glob) = line.strip_prefix("fun_hist:") {
            (SuppressionScope::Historical, glob, "*", "*")
        } else if let Some(glob) = line.strip_prefix("fun:") {
            (SuppressionScope::Anywhere, glob, "*", "*")
        } else if let Some(glob) = line.strip_prefix("obj:") {
            (SuppressionScope::Anywhere, "*", glob, "*")
        } else if let Some(glob) = line.strip_prefix("src:") {
            (SuppressionScope::Anywhere, "*", "*", glob)
        } else {
            bail!("unknown suppression directive: {line}");
        };
        Ok(Suppression {
            fun: fun.to_string(),
            obj: obj.to_string(),
            file: file.to_string(),
            scope,
            source_line: line.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// First rule matching the report's stacks, if any. `current` and
    /// `previous` are innermost-frame-last, matching capture order.
    pub fn find_match(
        &self,
        current: &[FrameInfo],
        previous: &[FrameInfo],
    ) -> Option<&Suppression> {
        self.rules.iter().find(|rule| match rule.scope {
            SuppressionScope::Anywhere => current
                .iter()
                .chain(previous.iter())
                .any(|f| rule.matches_frame(f)),
            SuppressionScope::RaceRoot => current
                .last()
                .into_iter()
                .chain(previous.last())
                .any(|f| rule.matches_frame(f)),
            SuppressionScope::Historical => previous.iter().any(|f| rule.matches_frame(f)),
        })
    }
}

/// `*` and `?` wildcard match.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    // Classic two-pointer scan with star backtracking.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut star_ti) = (None::<usize>, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(sp) = star {
            pi = sp + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
