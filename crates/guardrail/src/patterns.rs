//! Threat pattern tables.
//!
//! Patterns are applied in table order; each carries the marker its matches
//! are replaced with. The strict family is only active when the session has
//! `strict_security` set.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The six kinds of content risk the guardrail recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    TaskOverride,
    PromptInjection,
    SystemReference,
    DangerousAction,
    SensitiveData,
    CredentialLeak,
}

/// Pattern severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

pub(crate) struct ThreatPattern {
    pub name: &'static str,
    pub category: ThreatCategory,
    pub severity: Severity,
    pub regex: Regex,
    pub marker: &'static str,
}

impl ThreatPattern {
    fn new(
        name: &'static str,
        category: ThreatCategory,
        severity: Severity,
        pattern: &str,
        marker: &'static str,
    ) -> Self {
        Self {
            name,
            category,
            severity,
            // Table entries are fixed strings; a failure here is a programmer
            // error caught by the pattern unit tests.
            regex: Regex::new(pattern).unwrap_or_else(|err| {
                panic!("invalid guardrail pattern {name}: {err}");
            }),
            marker,
        }
    }
}

static BASE_PATTERNS: Lazy<Vec<ThreatPattern>> = Lazy::new(|| {
    vec![
        ThreatPattern::new(
            "instruction_override",
            ThreatCategory::TaskOverride,
            Severity::Critical,
            r"(?i)\b(ignore|disregard|forget)\s+(all\s+)?(previous|prior|earlier|above)\s+(instructions?|prompts?|directives?)",
            "[BLOCKED_OVERRIDE_ATTEMPT]",
        ),
        ThreatPattern::new(
            "task_redefinition",
            ThreatCategory::TaskOverride,
            Severity::Critical,
            r"(?i)\byour\s+(new|real|actual)\s+(task|goal|mission|instructions?)\s+(is|are)\b",
            "[BLOCKED_OVERRIDE_ATTEMPT]",
        ),
        ThreatPattern::new(
            "forget_everything",
            ThreatCategory::TaskOverride,
            Severity::Critical,
            r"(?i)\bforget\s+everything\b",
            "[BLOCKED_OVERRIDE_ATTEMPT]",
        ),
        ThreatPattern::new(
            "role_hijack",
            ThreatCategory::PromptInjection,
            Severity::High,
            r"(?i)\byou\s+are\s+now\s+(a|an|the)\b",
            "[BLOCKED_INJECTION]",
        ),
        ThreatPattern::new(
            "pretend_roleplay",
            ThreatCategory::PromptInjection,
            Severity::High,
            r"(?i)\bpretend\s+to\s+be\b",
            "[BLOCKED_INJECTION]",
        ),
        ThreatPattern::new(
            "chat_markup",
            ThreatCategory::PromptInjection,
            Severity::Critical,
            r"(?i)<\|?(im_start|im_end|endoftext)\|?>",
            "[BLOCKED_INJECTION]",
        ),
        ThreatPattern::new(
            "jailbreak_mode",
            ThreatCategory::PromptInjection,
            Severity::High,
            r"(?i)\b(do\s+anything\s+now|dan\s+mode|jailbreak)\b",
            "[BLOCKED_INJECTION]",
        ),
        ThreatPattern::new(
            "system_prompt_probe",
            ThreatCategory::SystemReference,
            Severity::Medium,
            r"(?i)\b(system|developer)\s+(prompt|message)\b",
            "[BLOCKED_SYSTEM_REFERENCE]",
        ),
        ThreatPattern::new(
            "reveal_instructions",
            ThreatCategory::SystemReference,
            Severity::Medium,
            r"(?i)\b(reveal|show|print|repeat)\s+(your|the)\s+(instructions|prompt|rules)\b",
            "[BLOCKED_SYSTEM_REFERENCE]",
        ),
        ThreatPattern::new(
            "shell_destruction",
            ThreatCategory::DangerousAction,
            Severity::High,
            r"(?i)\brm\s+-rf?\b",
            "[BLOCKED_DANGEROUS_ACTION]",
        ),
        ThreatPattern::new(
            "sql_destruction",
            ThreatCategory::DangerousAction,
            Severity::High,
            r"(?i)\b(drop\s+table|truncate\s+table|delete\s+from)\b",
            "[BLOCKED_DANGEROUS_ACTION]",
        ),
        ThreatPattern::new(
            "mass_delete",
            ThreatCategory::DangerousAction,
            Severity::High,
            r"(?i)\bdelete\s+all\s+(files|data|records|accounts)\b",
            "[BLOCKED_DANGEROUS_ACTION]",
        ),
        ThreatPattern::new(
            "ssn",
            ThreatCategory::SensitiveData,
            Severity::High,
            r"\b\d{3}-\d{2}-\d{4}\b",
            "[REDACTED_SSN]",
        ),
        ThreatPattern::new(
            "credit_card",
            ThreatCategory::SensitiveData,
            Severity::High,
            r"\b(?:\d{4}[ -]?){3}\d{4}\b",
            "[REDACTED_CARD]",
        ),
        ThreatPattern::new(
            "api_key",
            ThreatCategory::CredentialLeak,
            Severity::Critical,
            r"\b(sk|pk)-[A-Za-z0-9_-]{16,}\b",
            "[REDACTED_CREDENTIAL]",
        ),
        ThreatPattern::new(
            "aws_access_key",
            ThreatCategory::CredentialLeak,
            Severity::Critical,
            r"\bAKIA[0-9A-Z]{16}\b",
            "[REDACTED_CREDENTIAL]",
        ),
        ThreatPattern::new(
            "credential_assignment",
            ThreatCategory::CredentialLeak,
            Severity::Critical,
            r#"(?i)\b(password|passwd|pwd|secret|api[_-]?key|auth[_-]?token)\s*[:=]\s*[^\s<>"']+"#,
            "[REDACTED_CREDENTIAL]",
        ),
        ThreatPattern::new(
            "bearer_token",
            ThreatCategory::CredentialLeak,
            Severity::Critical,
            r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]{16,}=*",
            "[REDACTED_CREDENTIAL]",
        ),
    ]
});

static STRICT_PATTERNS: Lazy<Vec<ThreatPattern>> = Lazy::new(|| {
    vec![
        ThreatPattern::new(
            "email_address",
            ThreatCategory::SensitiveData,
            Severity::Medium,
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            "[REDACTED_EMAIL]",
        ),
        ThreatPattern::new(
            "phone_number",
            ThreatCategory::SensitiveData,
            Severity::Medium,
            r"\b(?:\+?1[ .-]?)?\(?\d{3}\)?[ .-]?\d{3}[ .-]?\d{4}\b",
            "[REDACTED_PHONE]",
        ),
    ]
});

/// Patterns active for the given mode, base family first.
pub(crate) fn active_patterns(strict: bool) -> impl Iterator<Item = &'static ThreatPattern> {
    BASE_PATTERNS
        .iter()
        .chain(strict.then(|| STRICT_PATTERNS.iter()).into_iter().flatten())
}

/// Runs of two or more spaces/tabs collapse to a single space.
pub(crate) static HORIZONTAL_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("horizontal run pattern"));

/// More than two consecutive blank lines cap at two.
pub(crate) static EXCESS_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{4,}").expect("blank line pattern"));

/// Tag pairs emptied out by a replacement, e.g. `<span></span>`.
pub(crate) static EMPTY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(\w+)[^>]*>\s*</\w+>").expect("empty tag pattern"));
