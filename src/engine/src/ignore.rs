//! `.kitignore` matching.
//!
//! The ignore file follows the gitignore dialect: blank lines and `#`
//! comments are skipped, `/` anchors a pattern to the context root, a
//! trailing `/` restricts a pattern to directories, `!` negates, and `**`
//! crosses directory boundaries. Rules apply in file order with later rules
//! overriding earlier ones; files inside an ignored directory cannot be
//! re-included.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use kitforge_core::{KitError, Result};

struct Rule {
    matcher: GlobMatcher,
    negated: bool,
    dir_only: bool,
}

/// A parsed ignore file plus the paths that are always excluded (the Kitfile
/// in use and the ignore file itself).
pub struct IgnoreSet {
    rules: Vec<Rule>,
    always: Vec<PathBuf>,
}

impl IgnoreSet {
    /// An ignore set with no rules.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            always: Vec::new(),
        }
    }

    /// Parse ignore rules from file content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            rules.push(compile_rule(line)?);
        }
        Ok(Self {
            rules,
            always: Vec::new(),
        })
    }

    /// Load rules from the ignore file in a context directory. A missing
    /// file yields an empty set.
    pub fn from_context_dir(context_dir: &Path, ignore_file_name: &str) -> Result<Self> {
        let path = context_dir.join(ignore_file_name);
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(KitError::Io(e)),
        }
    }

    /// Add a path that is unconditionally ignored.
    pub fn add_always(&mut self, rel_path: impl Into<PathBuf>) {
        self.always.push(rel_path.into());
    }

    /// Whether a context-relative path should be excluded from packing.
    pub fn matches(&self, rel_path: &Path, is_dir: bool) -> bool {
        if self.always.iter().any(|p| p == rel_path) {
            return true;
        }
        // A path inside an ignored directory stays ignored
        for ancestor in rel_path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            if self.match_rules(ancestor, true) {
                return true;
            }
        }
        self.match_rules(rel_path, is_dir)
    }

    fn match_rules(&self, rel_path: &Path, is_dir: bool) -> bool {
        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            if rule.matcher.is_match(rel_path) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

fn compile_rule(line: &str) -> Result<Rule> {
    let mut pattern = line;

    let negated = pattern.starts_with('!');
    if negated {
        pattern = &pattern[1..];
    }

    let dir_only = pattern.ends_with('/');
    if dir_only {
        pattern = &pattern[..pattern.len() - 1];
    }

    let anchored = pattern.starts_with('/');
    if anchored {
        pattern = &pattern[1..];
    }

    // A pattern without a slash matches at any depth
    let full = if anchored || pattern.contains('/') {
        pattern.to_string()
    } else {
        format!("**/{}", pattern)
    };

    let glob = GlobBuilder::new(&full)
        .literal_separator(true)
        .build()
        .map_err(|e| KitError::InvalidKitfile(format!("bad ignore pattern '{}': {}", line, e)))?;
    Ok(Rule {
        matcher: glob.compile_matcher(),
        negated,
        dir_only,
    })
}
