//! Keyword-based tool categorization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad grouping used to browse the tool catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Filesystem,
    Web,
    Database,
    Code,
    Search,
    Communication,
    System,
    Data,
    #[default]
    General,
}

/// Checked in order; the first category with a matching keyword wins.
const KEYWORDS: &[(ToolCategory, &[&str])] = &[
    (
        ToolCategory::Filesystem,
        &["file", "directory", "folder", "path", "fs", "read", "write"],
    ),
    (
        ToolCategory::Web,
        &["http", "url", "web", "fetch", "browser", "scrape", "download"],
    ),
    (
        ToolCategory::Database,
        &["sql", "database", "db", "query", "table", "postgres", "sqlite"],
    ),
    (
        ToolCategory::Code,
        &["code", "compile", "lint", "git", "build", "test", "refactor"],
    ),
    (
        ToolCategory::Search,
        &["search", "find", "grep", "lookup", "index"],
    ),
    (
        ToolCategory::Communication,
        &["email", "mail", "slack", "message", "chat", "notify", "send"],
    ),
    (
        ToolCategory::System,
        &["process", "system", "shell", "exec", "command", "env"],
    ),
    (
        ToolCategory::Data,
        &["json", "csv", "parse", "transform", "convert", "data"],
    ),
];

impl ToolCategory {
    pub const ALL: [ToolCategory; 9] = [
        ToolCategory::Filesystem,
        ToolCategory::Web,
        ToolCategory::Database,
        ToolCategory::Code,
        ToolCategory::Search,
        ToolCategory::Communication,
        ToolCategory::System,
        ToolCategory::Data,
        ToolCategory::General,
    ];

    /// Guess a category from a tool's name and description.
    ///
    /// Name tokens are tried before description tokens so that
    /// `read_file` lands in filesystem even if its description mentions data.
    pub fn infer(name: &str, description: Option<&str>) -> Self {
        let name_tokens = tokens(name);
        let description_tokens = description.map(tokens).unwrap_or_default();
        [name_tokens, description_tokens]
            .iter()
            .find_map(|toks| {
                KEYWORDS.iter().find_map(|(category, words)| {
                    toks.iter()
                        .any(|t| words.contains(&t.as_str()))
                        .then_some(*category)
                })
            })
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Filesystem => "filesystem",
            ToolCategory::Web => "web",
            ToolCategory::Database => "database",
            ToolCategory::Code => "code",
            ToolCategory::Search => "search",
            ToolCategory::Communication => "communication",
            ToolCategory::System => "system",
            ToolCategory::Data => "data",
            ToolCategory::General => "general",
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tags derived from a tool name: its lowercase tokens plus the category.
pub fn infer_tags(name: &str, category: ToolCategory) -> Vec<String> {
    let mut tags: Vec<String> = tokens(name)
        .into_iter()
        .filter(|t| t.len() > 1)
        .collect();
    tags.push(category.as_str().to_string());
    tags.sort();
    tags.dedup();
    tags
}

/// Split on non-alphanumerics and camelCase boundaries.
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in text.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_from_name() {
        assert_eq!(ToolCategory::infer("read_file", None), ToolCategory::Filesystem);
        assert_eq!(ToolCategory::infer("fetchUrl", None), ToolCategory::Web);
        assert_eq!(ToolCategory::infer("run-sql", None), ToolCategory::Database);
        assert_eq!(ToolCategory::infer("git_status", None), ToolCategory::Code);
        assert_eq!(ToolCategory::infer("grep", None), ToolCategory::Search);
        assert_eq!(ToolCategory::infer("send_email", None), ToolCategory::Communication);
        assert_eq!(ToolCategory::infer("echo", None), ToolCategory::General);
    }

    #[test]
    fn test_name_beats_description() {
        assert_eq!(
            ToolCategory::infer("read_file", Some("Parse the json data")),
            ToolCategory::Filesystem
        );
        assert_eq!(
            ToolCategory::infer("echo", Some("Convert json input")),
            ToolCategory::Data
        );
    }

    #[test]
    fn test_no_substring_false_positives() {
        // "profile" contains "file" but is not a token match
        assert_eq!(ToolCategory::infer("profile", None), ToolCategory::General);
    }

    #[test]
    fn test_tags() {
        assert_eq!(
            infer_tags("readFile_v2", ToolCategory::Filesystem),
            vec!["file", "filesystem", "read", "v2"]
        );
        assert_eq!(infer_tags("echo", ToolCategory::General), vec!["echo", "general"]);
    }

    #[test]
    fn test_tokens() {
        assert_eq!(tokens("HTTPGet"), vec!["httpget"]);
        assert_eq!(tokens("get_HTTP-page"), vec!["get", "http", "page"]);
        assert_eq!(tokens("listFiles"), vec!["list", "files"]);
    }
}
