//! Variable scope declarations.
//!
//! A scope file maps source files to the variables they declare:
//!
//! ```text
//! # comments and blank lines are ignored
//! src/app.py:(local:x, global:counter)
//! src/utils.py:(both:helper)
//! src/config.py:(settings)
//! ```
//!
//! An entry without a `scope:` prefix is recorded as [`Scope::Unknown`].

use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
    Global,
    Both,
    Unknown,
}

impl Scope {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "global" => Some(Self::Global),
            "both" => Some(Self::Both),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::Both => "both",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedVariable {
    pub name: String,
    pub scope: Scope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeMap {
    files: BTreeMap<String, Vec<ScopedVariable>>,
}

impl ScopeMap {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut map = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let Some((file, vars)) =
                parse_line(raw).map_err(|reason| Error::InvalidScopeLine { line, reason })?
            else {
                continue;
            };
            map.files.entry(file).or_default().extend(vars);
        }

        if map.files.is_empty() {
            return Err(Error::EmptyScopeConfig);
        }
        Ok(map)
    }

    /// Classify `name` as seen from `file`.
    ///
    /// Declarations for the same file (exact or path-suffix match) win over
    /// declarations of the same name in any other file.
    pub fn scope_of(&self, file: &str, name: &str) -> Option<Scope> {
        let in_file = self
            .files
            .iter()
            .filter(|(declared, _)| !file.is_empty() && same_file(declared, file))
            .flat_map(|(_, vars)| vars.iter())
            .find(|var| var.name == name);

        in_file
            .or_else(|| {
                self.files
                    .values()
                    .flat_map(|vars| vars.iter())
                    .find(|var| var.name == name)
            })
            .map(|var| var.scope)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[ScopedVariable])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

fn same_file(declared: &str, observed: &str) -> bool {
    Path::new(observed).ends_with(declared) || Path::new(declared).ends_with(observed)
}

fn parse_line(raw: &str) -> Result<Option<(String, Vec<ScopedVariable>)>, String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    // File paths may contain colons, so split on the last `:(`.
    let Some(split) = line.rfind(":(") else {
        return Err(format!("missing `:(` in `{line}`"));
    };

    let file = line[..split].trim();
    if file.is_empty() {
        return Err(format!("empty file path in `{line}`"));
    }

    let Some(spec) = line[split + 2..].trim().strip_suffix(')') else {
        return Err(format!("missing closing parenthesis in `{line}`"));
    };

    let mut vars = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let var = match entry.split_once(':') {
            Some((scope, name)) => {
                let scope = scope.trim();
                let name = name.trim();
                let scope =
                    Scope::parse(scope).ok_or_else(|| format!("invalid scope `{scope}`"))?;
                if name.is_empty() {
                    return Err(format!("empty variable name in `{line}`"));
                }
                ScopedVariable {
                    name: name.to_owned(),
                    scope,
                }
            }
            None => ScopedVariable {
                name: entry.to_owned(),
                scope: Scope::Unknown,
            },
        };
        vars.push(var);
    }

    if vars.is_empty() {
        return Err(format!("no variables specified in `{line}`"));
    }
    Ok(Some((file.to_owned(), vars)))
}
