use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct ListFile {
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    blacklist: Vec<String>,
}

/// IP patterns (regular expressions) that bypass or are denied admission.
#[derive(Debug, Clone, Default)]
pub struct AccessLists {
    whitelist: Vec<Regex>,
    blacklist: Vec<Regex>,
}

fn compile<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Vec<Regex> {
    let mut compiled: Vec<Regex> = vec![];
    for pattern in patterns {
        let pattern = pattern.as_ref();
        if compiled.iter().any(|re| re.as_str() == pattern) {
            continue;
        }
        match Regex::new(pattern) {
            Ok(re) => compiled.push(re),
            Err(e) => tracing::warn!("Ignoring invalid list pattern {pattern}: {e}"),
        }
    }
    compiled
}

impl AccessLists {
    pub fn new<W, B>(whitelist: W, blacklist: B) -> Self
    where
        W: IntoIterator,
        W::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
    {
        Self {
            whitelist: compile(whitelist),
            blacklist: compile(blacklist),
        }
    }

    /// Builds the lists from the local file, extended with the global one.
    /// Either file may be absent from the configuration.
    pub fn load(local: Option<&Path>, global: Option<&Path>) -> anyhow::Result<Self> {
        let mut lists = match local {
            Some(path) => read_list_file(path)?,
            None => ListFile::default(),
        };
        if let Some(path) = global {
            let global = read_list_file(path)?;
            lists.whitelist.extend(global.whitelist);
            lists.blacklist.extend(global.blacklist);
        }
        Ok(Self::new(lists.whitelist, lists.blacklist))
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(ip))
    }

    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.blacklist.iter().any(|re| re.is_match(ip))
    }

    pub fn whitelist(&self) -> impl Iterator<Item = &str> {
        self.whitelist.iter().map(Regex::as_str)
    }

    pub fn blacklist(&self) -> impl Iterator<Item = &str> {
        self.blacklist.iter().map(Regex::as_str)
    }
}

fn read_list_file(path: &Path) -> anyhow::Result<ListFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read list file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid list file {}", path.display()))
}
