//! Event filters (§4.5): a subscriber may narrow the events it wants to
//! see on a stream by event type and/or by a pattern matched against a
//! dotted path into the event's payload.
//!
//! `shouldSend(e)` is true iff `e.type` is in `alwaysAllow` (default
//! `{final, error, heartbeat}`), OR include-mode with any rule matching,
//! OR exclude-mode with no rule matching. A rule matches only if both its
//! type sub-filter and its content sub-filter match — a sub-filter that is
//! absent is vacuously true.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use sbx_domain::error::{BrokerError, Result};
use sbx_domain::event::Event;

/// Event types a filter can never exclude, per §4.5's default.
const DEFAULT_ALWAYS_ALLOW: &[&str] = &["final", "error", "heartbeat"];

/// Inputs longer than this are rejected without regex evaluation — the
/// ReDoS guard §4.5 calls for.
const MAX_INPUT_LEN: usize = 10_000;

const MAX_PATTERN_LEN: usize = 512;
const MAX_RULES: usize = 32;
const MAX_PATTERNS_PER_RULE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Include,
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMatch {
    Any,
    All,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Exact,
    Prefix,
    Regex,
    Glob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    /// Dotted path into the event (e.g. `"payload.toolName"`). Absent
    /// means the pattern is matched against the event's `type`.
    #[serde(default)]
    pub field: Option<String>,
    pub pattern: String,
    #[serde(default, rename = "caseInsensitive")]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFilterSpec {
    pub patterns: Vec<PatternSpec>,
    #[serde(rename = "match")]
    pub match_mode: ContentMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleSpec {
    #[serde(default)]
    pub types: Option<Vec<String>>,
    #[serde(default)]
    pub content: Option<ContentFilterSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub mode: FilterMode,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub always_allow: Option<Vec<String>>,
}

enum CompiledMatcher {
    Exact(String, bool),
    Prefix(String, bool),
    Glob(globset::GlobMatcher),
    Regex(Regex),
}

impl CompiledMatcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            CompiledMatcher::Exact(pat, ci) => {
                if *ci {
                    pat.eq_ignore_ascii_case(value)
                } else {
                    pat == value
                }
            }
            CompiledMatcher::Prefix(pat, ci) => {
                if *ci {
                    value.get(..pat.len()).is_some_and(|s| s.eq_ignore_ascii_case(pat))
                } else {
                    value.starts_with(pat.as_str())
                }
            }
            CompiledMatcher::Glob(g) => g.is_match(value),
            CompiledMatcher::Regex(r) => {
                if value.len() > MAX_INPUT_LEN {
                    return false;
                }
                r.is_match(value)
            }
        }
    }
}

struct CompiledPattern {
    field: Option<Vec<String>>,
    matcher: CompiledMatcher,
}

struct CompiledContent {
    patterns: Vec<CompiledPattern>,
    match_mode: ContentMatch,
}

struct CompiledRule {
    types: Option<Vec<String>>,
    content: Option<CompiledContent>,
}

pub struct EventFilter {
    mode: FilterMode,
    rules: Vec<CompiledRule>,
    always_allow: Vec<String>,
}

impl EventFilter {
    pub fn compile(spec: FilterSpec) -> Result<Self> {
        if spec.rules.len() > MAX_RULES {
            return Err(BrokerError::InvalidFilter(format!(
                "filter carries {} rules, max is {MAX_RULES}",
                spec.rules.len()
            )));
        }
        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in spec.rules {
            rules.push(compile_rule(rule)?);
        }
        let always_allow = spec
            .always_allow
            .unwrap_or_else(|| DEFAULT_ALWAYS_ALLOW.iter().map(|s| s.to_string()).collect());
        Ok(Self {
            mode: spec.mode,
            rules,
            always_allow,
        })
    }

    /// `shouldSend` per §4.5, evaluated against a concrete event so content
    /// filters can traverse its payload.
    pub fn should_send(&self, event: &Event) -> bool {
        if self.always_allow.iter().any(|t| t == event.event_type()) {
            return true;
        }
        let any_rule_matches = self.rules.iter().any(|r| rule_matches(r, event));
        match self.mode {
            FilterMode::Include => any_rule_matches,
            FilterMode::Exclude => !any_rule_matches,
        }
    }

    /// Type-only convenience used where no concrete event is in hand yet
    /// (e.g. pre-filtering a replay slice by type before deserializing).
    pub fn allows(&self, event_type: &str) -> bool {
        if self.always_allow.iter().any(|t| t == event_type) {
            return true;
        }
        let any_rule_matches = self.rules.iter().any(|r| {
            r.types.as_ref().map(|ts| ts.iter().any(|t| t == event_type)).unwrap_or(true)
                && r.content.is_none()
        });
        match self.mode {
            FilterMode::Include => any_rule_matches,
            FilterMode::Exclude => !any_rule_matches,
        }
    }
}

fn rule_matches(rule: &CompiledRule, event: &Event) -> bool {
    let type_matches = rule
        .types
        .as_ref()
        .map(|ts| ts.iter().any(|t| t == event.event_type()))
        .unwrap_or(true);
    if !type_matches {
        return false;
    }
    match &rule.content {
        None => true,
        Some(content) => content_matches(content, event),
    }
}

fn content_matches(content: &CompiledContent, event: &Event) -> bool {
    let value = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
    let mut results = content.patterns.iter().map(|p| pattern_matches(p, &value));
    match content.match_mode {
        ContentMatch::Any => results.any(|m| m),
        ContentMatch::All => results.all(|m| m),
    }
}

fn pattern_matches(pattern: &CompiledPattern, root: &serde_json::Value) -> bool {
    let target = match &pattern.field {
        None => root.clone(),
        Some(path) => match traverse(root, path) {
            Some(v) => v.clone(),
            None => return false,
        },
    };
    let stringified = stringify(&target);
    pattern.matcher.matches(&stringified)
}

fn traverse<'a>(root: &'a serde_json::Value, path: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compile_rule(rule: RuleSpec) -> Result<CompiledRule> {
    let content = match rule.content {
        None => None,
        Some(spec) => Some(compile_content(spec)?),
    };
    Ok(CompiledRule {
        types: rule.types,
        content,
    })
}

fn compile_content(spec: ContentFilterSpec) -> Result<CompiledContent> {
    if spec.patterns.len() > MAX_PATTERNS_PER_RULE {
        return Err(BrokerError::InvalidFilter(format!(
            "content filter carries {} patterns, max is {MAX_PATTERNS_PER_RULE}",
            spec.patterns.len()
        )));
    }
    let mut patterns = Vec::with_capacity(spec.patterns.len());
    for p in spec.patterns {
        patterns.push(compile_pattern(p)?);
    }
    Ok(CompiledContent {
        patterns,
        match_mode: spec.match_mode,
    })
}

fn compile_pattern(spec: PatternSpec) -> Result<CompiledPattern> {
    if spec.pattern.len() > MAX_PATTERN_LEN {
        return Err(BrokerError::InvalidFilter(format!(
            "pattern exceeds {MAX_PATTERN_LEN} characters"
        )));
    }
    let field = spec.field.map(|f| f.split('.').map(|s| s.to_string()).collect());
    let matcher = match spec.kind {
        PatternKind::Exact => CompiledMatcher::Exact(normalize(&spec.pattern, spec.case_insensitive), spec.case_insensitive),
        PatternKind::Prefix => CompiledMatcher::Prefix(normalize(&spec.pattern, spec.case_insensitive), spec.case_insensitive),
        PatternKind::Glob => {
            let glob = globset::Glob::new(&spec.pattern)
                .map_err(|e| BrokerError::InvalidFilter(format!("bad glob {:?}: {e}", spec.pattern)))?;
            CompiledMatcher::Glob(glob.compile_matcher())
        }
        PatternKind::Regex => CompiledMatcher::Regex(compile_bounded_regex(&spec.pattern, spec.case_insensitive)?),
    };
    Ok(CompiledPattern { field, matcher })
}

fn normalize(pattern: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        pattern.to_ascii_lowercase()
    } else {
        pattern.to_string()
    }
}

/// Compile a regex with a hard size-limit ceiling so a pathological
/// pattern fails fast at filter-setup time instead of stalling a match
/// against live traffic later.
fn compile_bounded_regex(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .size_limit(1 << 20)
        .dfa_size_limit(1 << 20)
        .build()
        .map_err(|e| BrokerError::InvalidFilter(format!("bad regex {pattern:?}: {e}")))
}
