//! User-agent enrichment for viewer session records.

use std::sync::OnceLock;

use serde::Serialize;
use woothee::parser::Parser;

/// Structured view of a session's user-agent string.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedUserAgent {
    pub raw: String,
    pub summary: String,
    pub browser: BrowserInfo,
    pub os: OsInfo,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BrowserInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OsInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

fn parser() -> &'static Parser {
    static PARSER: OnceLock<Parser> = OnceLock::new();
    PARSER.get_or_init(Parser::new)
}

/// Parses a raw user-agent string into a [`ParsedUserAgent`].
///
/// Empty or unrecognizable input degrades to an "Unknown" summary with empty
/// sub-fields; this never fails.
pub fn parse(raw: &str) -> ParsedUserAgent {
    if raw.is_empty() {
        return ParsedUserAgent {
            summary: "Unknown".to_string(),
            ..ParsedUserAgent::default()
        };
    }

    let Some(result) = parser().parse(raw) else {
        return ParsedUserAgent {
            raw: raw.to_string(),
            summary: "Unknown".to_string(),
            ..ParsedUserAgent::default()
        };
    };

    let browser = BrowserInfo {
        name: known(result.name),
        version: known(result.version),
        vendor: known(result.vendor),
    };
    let os = OsInfo {
        name: known(result.os),
        version: known(result.os_version.as_ref()),
    };
    let device = DeviceInfo {
        category: known(result.category),
    };

    let summary = build_summary(&browser, &os);

    ParsedUserAgent {
        raw: raw.to_string(),
        summary,
        browser,
        os,
        device,
    }
}

/// Filters out woothee's UNKNOWN sentinel and empty values.
fn known(value: &str) -> Option<String> {
    if value.is_empty() || value == "UNKNOWN" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Builds `"{browser} {version} ({os} {os_version})"` with unknowns
/// gracefully omitted and the result trimmed.
fn build_summary(browser: &BrowserInfo, os: &OsInfo) -> String {
    let browser_name = browser.name.as_deref().unwrap_or("Unknown Browser");
    let browser_version = browser.version.as_deref().unwrap_or("");
    let os_name = os.name.as_deref().unwrap_or("Unknown OS");
    let os_version = os.version.as_deref().unwrap_or("");

    let head = format!("{browser_name} {browser_version}");
    let tail = format!("{os_name} {os_version}");

    format!("{} ({})", head.trim(), tail.trim())
}
