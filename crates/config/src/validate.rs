//! Configuration validation.
//!
//! Detects unknown or misspelled fields in TOML files and reports semantic
//! problems (zero intervals, empty extraction chains, exposed webhooks).

use std::{collections::HashMap, path::Path};

use secrecy::ExposeSecret;

use crate::schema::{IdExtractionRule, MAX_ESTABLISH_RETRIES, SwitchboardConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "semantic",
    /// "security", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "relay.backoff_max_ms"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Array(Box<KnownKeys>),
    Leaf,
}

fn leaves(names: &[&'static str]) -> KnownKeys {
    KnownKeys::Struct(names.iter().map(|n| (*n, KnownKeys::Leaf)).collect())
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Struct};

    let rule = leaves(&[
        "kind",
        "pointer",
        "array",
        "match_field",
        "match_value",
        "field",
    ]);

    Struct(HashMap::from([
        ("server", leaves(&["bind", "port", "webhook_secret"])),
        (
            "assistant",
            leaves(&["base_url", "secret", "user_id", "user_name"]),
        ),
        (
            "agent",
            leaves(&[
                "base_url",
                "username",
                "password",
                "token",
                "topic_id",
                "enterprise_id",
                "poll_limit",
                "email_domain",
            ]),
        ),
        (
            "relay",
            leaves(&[
                "assistant_poll_interval_ms",
                "agent_poll_interval_ms",
                "backoff_base_ms",
                "backoff_max_ms",
                "degraded_after_failures",
                "call_timeout_ms",
                "orphan_capacity",
                "orphan_ttl_secs",
                "session_retention_secs",
                "sweep_interval_secs",
                "subscriber_buffer",
            ]),
        ),
        (
            "handoff",
            Struct(HashMap::from([
                ("triggers", Leaf),
                ("transcript_limit", Leaf),
                ("establish_timeout_ms", Leaf),
                ("establish_retries", Leaf),
                ("id_extraction", Array(Box::new(rule))),
                ("synthesize_from_assistant_ref", Leaf),
            ])),
        ),
        ("store", leaves(&["database_url"])),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    if a.is_empty() {
        return b_len;
    }
    if b_len == 0 {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Validate a config file at the given path, or the discovered config file
/// when `path` is `None`.
#[must_use]
pub fn validate_file(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    match std::fs::read_to_string(actual_path) {
        Ok(content) => {
            let content = crate::env_subst::substitute_env(&content);
            let is_toml = actual_path
                .extension()
                .and_then(|e| e.to_str())
                .is_none_or(|e| e == "toml");
            let mut result = if is_toml {
                validate_toml_str(&content)
            } else {
                match crate::loader::parse_config(&content, actual_path) {
                    Ok(config) => ValidationResult {
                        diagnostics: validate(&config),
                        config_path: None,
                    },
                    Err(e) => ValidationResult {
                        diagnostics: vec![Diagnostic::new(
                            Severity::Error,
                            "type-error",
                            "",
                            e.to_string(),
                        )],
                        config_path: None,
                    },
                }
            };
            result.config_path = Some(actual_path.clone());
            result
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: Some(actual_path.clone()),
        },
    }
}

/// Validate a TOML string: syntax, unknown fields, types, then semantics.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<SwitchboardConfig>(toml_str) {
        Ok(config) => diagnostics.extend(validate(&config)),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (toml::Value::Table(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                } else {
                    let message = match suggest(key, &known_keys, 3) {
                        Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                        None => "unknown field".to_string(),
                    };
                    diagnostics.push(Diagnostic::new(
                        Severity::Error,
                        "unknown-field",
                        path,
                        message,
                    ));
                }
            }
        },
        (toml::Value::Array(arr), KnownKeys::Array(item_schema)) => {
            for (i, item) in arr.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                check_unknown_fields(item, item_schema, &path, diagnostics);
            }
        },
        _ => {},
    }
}

/// Semantic checks on a parsed config.
#[must_use]
pub fn validate(config: &SwitchboardConfig) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    let error = |path: &str, msg: &str| Diagnostic::new(Severity::Error, "semantic", path, msg);
    let warning = |path: &str, msg: &str| Diagnostic::new(Severity::Warning, "semantic", path, msg);

    if config.assistant.secret.expose_secret().is_empty() {
        out.push(warning(
            "assistant.secret",
            "assistant secret is empty; sessions cannot be created",
        ));
    }
    if config.agent.base_url.is_empty() {
        out.push(warning(
            "agent.base_url",
            "agent backend is not configured; every handoff will fail",
        ));
    } else if !config.agent.base_url.starts_with("http://")
        && !config.agent.base_url.starts_with("https://")
    {
        out.push(error("agent.base_url", "must be an http(s) URL"));
    }
    if config.agent.poll_limit == 0 {
        out.push(error("agent.poll_limit", "must be greater than zero"));
    }

    let relay = &config.relay;
    for (path, value) in [
        (
            "relay.assistant_poll_interval_ms",
            relay.assistant_poll_interval_ms,
        ),
        ("relay.agent_poll_interval_ms", relay.agent_poll_interval_ms),
        ("relay.backoff_base_ms", relay.backoff_base_ms),
        ("relay.call_timeout_ms", relay.call_timeout_ms),
        ("relay.sweep_interval_secs", relay.sweep_interval_secs),
    ] {
        if value == 0 {
            out.push(error(path, "must be greater than zero"));
        }
    }
    if relay.backoff_base_ms > relay.backoff_max_ms {
        out.push(error(
            "relay.backoff_max_ms",
            "must be at least relay.backoff_base_ms",
        ));
    }
    if relay.subscriber_buffer == 0 {
        out.push(error("relay.subscriber_buffer", "must be greater than zero"));
    }
    if relay.degraded_after_failures == 0 {
        out.push(warning(
            "relay.degraded_after_failures",
            "zero flags every session degraded on its first failed poll",
        ));
    }
    if relay.orphan_capacity == 0 {
        out.push(warning(
            "relay.orphan_capacity",
            "unroutable push payloads will be dropped immediately",
        ));
    }

    let handoff = &config.handoff;
    if handoff.triggers.iter().all(|t| t.trim().is_empty()) {
        out.push(warning(
            "handoff.triggers",
            "no trigger phrases; automatic handoff is disabled",
        ));
    }
    if handoff.establish_timeout_ms == 0 {
        out.push(error(
            "handoff.establish_timeout_ms",
            "must be greater than zero",
        ));
    }
    if handoff.establish_retries > MAX_ESTABLISH_RETRIES {
        out.push(error(
            "handoff.establish_retries",
            "establishment is retried at most once",
        ));
    }
    if handoff.id_extraction.is_empty() && !handoff.synthesize_from_assistant_ref {
        out.push(error(
            "handoff.id_extraction",
            "no extraction rules and synthesis disabled; handoff can never succeed",
        ));
    }
    for (i, rule) in handoff.id_extraction.iter().enumerate() {
        let pointer = match rule {
            IdExtractionRule::Pointer { pointer } => pointer,
            IdExtractionRule::ArrayItem { array, .. } => array,
        };
        if !pointer.is_empty() && !pointer.starts_with('/') {
            out.push(error(
                &format!("handoff.id_extraction[{i}]"),
                "JSON pointers must be empty or start with '/'",
            ));
        }
    }

    if !config.store.is_memory() && !config.store.database_url.starts_with("sqlite:") {
        out.push(error(
            "store.database_url",
            "expected a sqlite: URL or \"memory\"",
        ));
    }

    let loopback = matches!(
        config.server.bind.as_str(),
        "127.0.0.1" | "::1" | "localhost"
    );
    if !loopback && config.server.webhook_secret.is_none() {
        out.push(Diagnostic::new(
            Severity::Warning,
            "security",
            "server.webhook_secret",
            "webhook endpoints are reachable off-host without a shared secret",
        ));
    }

    out
}
