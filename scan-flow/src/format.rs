//! Format inference for uploads the analysis backend did not classify.
//!
//! Rules are evaluated top to bottom and the first match wins; the last rule
//! always matches, so inference is total.

use crate::models::ScanFormat;

/// Condition a rule checks against an upload
#[derive(Debug, Clone, Copy)]
pub enum FormatMatcher {
    FilenameSuffix(&'static str),
    ContentTypeContains(&'static str),
    Always,
}

impl FormatMatcher {
    pub fn matches(&self, filename: &str, content_type: &str) -> bool {
        match self {
            FormatMatcher::FilenameSuffix(suffix) => filename.ends_with(suffix),
            FormatMatcher::ContentTypeContains(needle) => content_type.contains(needle),
            FormatMatcher::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FormatRule {
    pub matcher: FormatMatcher,
    pub format: ScanFormat,
}

pub const FORMAT_RULES: &[FormatRule] = &[
    FormatRule {
        matcher: FormatMatcher::FilenameSuffix(".dcm"),
        format: ScanFormat::Dicom,
    },
    FormatRule {
        matcher: FormatMatcher::ContentTypeContains("png"),
        format: ScanFormat::Png,
    },
    FormatRule {
        matcher: FormatMatcher::Always,
        format: ScanFormat::Jpg,
    },
];

/// Infer the format of an upload from its filename and declared content type.
pub fn infer_format(filename: &str, content_type: &str) -> ScanFormat {
    infer_with(FORMAT_RULES, filename, content_type).unwrap_or(ScanFormat::Jpg)
}

/// First matching rule of an arbitrary table, if any.
pub fn infer_with(rules: &[FormatRule], filename: &str, content_type: &str) -> Option<ScanFormat> {
    rules
        .iter()
        .find(|rule| rule.matcher.matches(filename, content_type))
        .map(|rule| rule.format)
}
