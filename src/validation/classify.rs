use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::JobErrorKind;

struct Signature {
    pattern: Regex,
    kind: JobErrorKind,
}

// Ordered: first match wins.
static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    vec![
        Signature {
            pattern: Regex::new(
                r"(?i)multi[- ]?(document|invoice|coi|certificate)|multiple documents|documents combined",
            )
            .expect("valid multi-document pattern"),
            kind: JobErrorKind::TargetMultipleDocsCombined,
        },
        Signature {
            pattern: Regex::new(r"(?i)validation failed|failed validation")
                .expect("valid validation pattern"),
            kind: JobErrorKind::TargetValidation,
        },
        Signature {
            pattern: Regex::new(
                r"(?i)format not recognized|not a textual pdf|unrecognized (format|document)|could not identify",
            )
            .expect("valid unrecognized pattern"),
            kind: JobErrorKind::TargetUnrecognized,
        },
    ]
});

fn from_code(code: &str) -> Option<JobErrorKind> {
    match code {
        "multiple-docs-combined" => Some(JobErrorKind::TargetMultipleDocsCombined),
        "validation" => Some(JobErrorKind::TargetValidation),
        "unrecognized" => Some(JobErrorKind::TargetUnrecognized),
        _ => None,
    }
}

/// Classifies an extraction failure. A structured `code` wins; the message
/// signatures cover extraction services that only report free text. Whether
/// the document is rejected follows [`JobErrorKind::rejects_document`].
pub fn classify(code: Option<&str>, message: Option<&str>) -> JobErrorKind {
    if let Some(kind) = code.and_then(from_code) {
        return kind;
    }

    message
        .and_then(|message| {
            SIGNATURES
                .iter()
                .find(|signature| signature.pattern.is_match(message))
        })
        .map(|signature| signature.kind)
        .unwrap_or(JobErrorKind::TargetOther)
}
