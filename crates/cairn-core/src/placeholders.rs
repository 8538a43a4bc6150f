//! Archive-name placeholders.
//!
//! Brace syntax with `{{` / `}}` escapes: `{hostname}`, `{fqdn}`,
//! `{reverse-fqdn}`, `{now}`, `{utcnow}`, `{user}`, `{pid}`, `{version}`,
//! `{version_major}`, `{version_minor}`. Substitution happens once, at
//! create time.

use chrono::{Local, Utc};

use cairn_types::error::{CairnError, Result};

use crate::platform;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The values substituted into an archive name. Captured once so repeated
/// expansion within one run is consistent.
#[derive(Debug, Clone)]
pub struct PlaceholderContext {
    pub hostname: String,
    pub fqdn: String,
    pub user: String,
    pub pid: u32,
    pub now: chrono::DateTime<Local>,
    pub utcnow: chrono::DateTime<Utc>,
}

impl PlaceholderContext {
    pub fn capture() -> Self {
        Self {
            hostname: platform::hostname(),
            fqdn: platform::fqdn(),
            user: platform::username(),
            pid: platform::pid(),
            now: Local::now(),
            utcnow: Utc::now(),
        }
    }

    fn resolve(&self, key: &str) -> Option<String> {
        let version_parts: Vec<&str> = VERSION.split('.').collect();
        Some(match key {
            "hostname" => self.hostname.clone(),
            "fqdn" => self.fqdn.clone(),
            "reverse-fqdn" => {
                let mut parts: Vec<&str> = self.fqdn.split('.').collect();
                parts.reverse();
                parts.join(".")
            }
            "now" => self.now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "utcnow" => self.utcnow.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "user" => self.user.clone(),
            "pid" => self.pid.to_string(),
            "version" => VERSION.to_string(),
            "version_major" => version_parts.first()?.to_string(),
            "version_minor" => {
                format!("{}.{}", version_parts.first()?, version_parts.get(1)?)
            }
            _ => return None,
        })
    }
}

/// Expand placeholders in an archive-name template.
pub fn replace_placeholders(template: &str, ctx: &PlaceholderContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut key = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    key.push(c);
                }
                if !closed {
                    return Err(CairnError::InvalidPlaceholder(template.to_string()));
                }
                let value = ctx
                    .resolve(&key)
                    .ok_or_else(|| CairnError::InvalidPlaceholder(template.to_string()))?;
                out.push_str(&value);
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(CairnError::InvalidPlaceholder(template.to_string()));
                }
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Archive names must be non-empty and must not contain `/`.
pub fn validate_archive_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(CairnError::InvalidArchiveName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PlaceholderContext {
        PlaceholderContext {
            hostname: "worker1".into(),
            fqdn: "worker1.example.com".into(),
            user: "backup".into(),
            pid: 4242,
            now: Local::now(),
            utcnow: Utc::now(),
        }
    }

    #[test]
    fn basic_substitution() {
        let out = replace_placeholders("{hostname}-{user}-{pid}", &ctx()).unwrap();
        assert_eq!(out, "worker1-backup-4242");
    }

    #[test]
    fn reverse_fqdn() {
        let out = replace_placeholders("{reverse-fqdn}", &ctx()).unwrap();
        assert_eq!(out, "com.example.worker1");
    }

    #[test]
    fn braces_escape() {
        let out = replace_placeholders("a{{literal}}b", &ctx()).unwrap();
        assert_eq!(out, "a{literal}b");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        assert!(matches!(
            replace_placeholders("{bogus}", &ctx()),
            Err(CairnError::InvalidPlaceholder(_))
        ));
    }

    #[test]
    fn unbalanced_braces_are_errors() {
        assert!(replace_placeholders("{hostname", &ctx()).is_err());
        assert!(replace_placeholders("tail}", &ctx()).is_err());
    }

    #[test]
    fn timestamps_render() {
        let out = replace_placeholders("{utcnow}", &ctx()).unwrap();
        assert_eq!(out.len(), 19); // YYYY-MM-DDTHH:MM:SS
        assert!(out.contains('T'));
    }

    #[test]
    fn version_placeholders() {
        let out = replace_placeholders("{version}", &ctx()).unwrap();
        assert_eq!(out, VERSION);
        let major = replace_placeholders("{version_major}", &ctx()).unwrap();
        assert!(VERSION.starts_with(&major));
    }

    #[test]
    fn name_validation() {
        assert!(validate_archive_name("daily-2026-08-02").is_ok());
        assert!(validate_archive_name("").is_err());
        assert!(validate_archive_name("a/b").is_err());
    }
}
