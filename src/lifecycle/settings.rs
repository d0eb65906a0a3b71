//! Resource settings
//!
//! A line-preserving editor for the ini-style `rid.settings` file. Comments,
//! blank lines and the order of sections and keys survive a rewrite; only
//! the edited key changes. The previous version is kept as `<file>.old`.

use crate::domain::{MountState, Rid};
use crate::error::{Error, Result};
use crate::lifecycle::ResourceManager;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

// =============================================================================
// Ini Document
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Section(String),
    Entry { key: String, value: String },
    Other(String),
}

/// An ini document that round-trips unedited lines verbatim
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    lines: Vec<Line>,
    raw: Vec<String>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        for raw in text.lines() {
            let trimmed = raw.trim();
            let line = if trimmed.starts_with('[') && trimmed.ends_with(']') {
                Line::Section(trimmed[1..trimmed.len() - 1].trim().to_string())
            } else if trimmed.starts_with('#') || trimmed.starts_with(';') || trimmed.is_empty() {
                Line::Other(raw.to_string())
            } else if let Some((key, value)) = trimmed.split_once('=') {
                Line::Entry {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                }
            } else {
                Line::Other(raw.to_string())
            };
            doc.lines.push(line);
            doc.raw.push(raw.to_string());
        }
        doc
    }

    /// Names of all sections, in file order
    pub fn sections(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Section(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let range = self.section_range(section)?;
        self.lines[range].iter().find_map(|l| match l {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Set `key` in `section`, creating either as needed
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let rendered = format!("{} = {}", key, value);
        let entry = Line::Entry {
            key: key.to_string(),
            value: value.to_string(),
        };

        let Some(range) = self.section_range(section) else {
            if self.raw.last().is_some_and(|l| !l.trim().is_empty()) {
                self.push(Line::Other(String::new()), String::new());
            }
            self.push(Line::Section(section.to_string()), format!("[{}]", section));
            self.push(entry, rendered);
            return;
        };

        let existing = range.clone().find(|&i| {
            matches!(&self.lines[i], Line::Entry { key: k, .. } if k == key)
        });
        match existing {
            Some(i) => {
                self.lines[i] = entry;
                self.raw[i] = rendered;
            }
            None => {
                // after the last entry, before trailing blanks and comments
                let last_entry = range
                    .clone()
                    .rev()
                    .find(|&i| matches!(self.lines[i], Line::Entry { .. }))
                    .unwrap_or(range.start - 1);
                self.lines.insert(last_entry + 1, entry);
                self.raw.insert(last_entry + 1, rendered);
            }
        }
    }

    fn push(&mut self, line: Line, raw: String) {
        self.lines.push(line);
        self.raw.push(raw);
    }

    /// Lines following the section header up to the next header
    fn section_range(&self, section: &str) -> Option<std::ops::Range<usize>> {
        let header = self
            .lines
            .iter()
            .position(|l| matches!(l, Line::Section(name) if name == section))?;
        let end = self.lines[header + 1..]
            .iter()
            .position(|l| matches!(l, Line::Section(_)))
            .map(|offset| header + 1 + offset)
            .unwrap_or(self.lines.len());
        Some(header + 1..end)
    }
}

impl std::fmt::Display for IniDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.raw {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Whether `settings` identifies a provisioned resource
///
/// Accepts a key line beginning with `rid` or a `[resource <RID>]` header
/// naming this resource.
pub fn has_identity_marker(settings: &str, rid: Rid) -> bool {
    let section = format!("resource {}", rid);
    settings.lines().map(str::trim).any(|line| {
        (line.starts_with("rid") && line.contains('='))
            || line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .is_some_and(|name| name.trim() == section)
    })
}

/// Set one option in an ini file, keeping the previous version as `<file>.old`
pub fn set_ini_option(file: &Path, section: &str, key: &str, value: &str) -> Result<()> {
    let text = match fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let mut doc = IniDocument::parse(&text);
    doc.set(section, key, value);

    let backup = backup_path(file);
    if file.exists() {
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(file, &backup)?;
    }
    fs::write(file, doc.to_string())?;
    Ok(())
}

fn backup_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

// =============================================================================
// Resource Options
// =============================================================================

/// Which section of `rid.settings` an option belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionScope {
    /// `[resource <RID>]`
    Rid,
    /// `[db <RID>]`
    Db,
}

impl OptionScope {
    pub fn section(self, rid: Rid) -> String {
        match self {
            OptionScope::Rid => format!("resource {}", rid),
            OptionScope::Db => format!("db {}", rid),
        }
    }
}

impl FromStr for OptionScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rid" | "resource" => Ok(OptionScope::Rid),
            "db" => Ok(OptionScope::Db),
            other => Err(Error::InvalidArgument(format!(
                "unknown option scope '{}', expected rid or db",
                other
            ))),
        }
    }
}

impl ResourceManager {
    /// Set an option in a mounted resource's `rid.settings`
    pub async fn set_rid_option(
        &self,
        rid: Rid,
        scope: OptionScope,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.instrumented("set_option", async {
            let _lock = self.lock(rid).await?;
            self.set_rid_option_unlocked(rid, scope, key, value)
        })
        .await
    }

    pub(crate) fn set_rid_option_unlocked(
        &self,
        rid: Rid,
        scope: OptionScope,
        key: &str,
        value: &str,
    ) -> Result<()> {
        if self.mount_state(rid)? == MountState::Unmounted {
            return Err(Error::AlreadyInState {
                rid,
                state: MountState::Unmounted.to_string(),
            });
        }
        let settings = self.paths(rid).settings();
        if !settings.is_file() {
            return Err(Error::malformed(
                "resource settings",
                format!("{} is missing", settings.display()),
            ));
        }
        set_ini_option(&settings, &scope.section(rid), key, value)?;
        info!(%rid, section = %scope.section(rid), key, value, "Resource option set");
        Ok(())
    }
}
