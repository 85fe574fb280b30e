/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

// Project mode file discovery: walk the project directory for `.mac`
// sources, minus whatever `.pdpy11ignore` excludes. The ignore file is
// line based and `.gitignore`-like: a trailing `/` makes a directory
// rule, a leading `/` anchors the rule at the project root, anything else
// matches as a full path, prefix, suffix or path component.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRule {
    pattern: String,
    rooted: bool,
    dir_only: bool,
}

pub fn parse_ignore(content: &str) -> Vec<IgnoreRule> {
    let mut rules = Vec::new();
    for line in content.lines() {
        let line = match line.split_once(';') {
            Some((before, _)) => before,
            None => line,
        };
        let line = line.trim().replace('\\', "/");
        if line.is_empty() {
            continue;
        }

        let rooted = line.starts_with('/');
        let dir_only = line.ends_with('/');
        let pattern: String = line
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        if pattern.is_empty() {
            continue;
        }
        rules.push(IgnoreRule {
            pattern,
            rooted,
            dir_only,
        });
    }
    rules
}

/// Matches `rel_path` (relative to the project root, `/`-separated)
/// against the ignore rules.
pub fn is_ignored(rel_path: &str, rules: &[IgnoreRule]) -> bool {
    for rule in rules {
        let p = &rule.pattern;
        let as_prefix = format!("{p}/");
        let matched = if rule.dir_only {
            // Directory rules hide the directory's contents, not a plain
            // file of the same name.
            if rule.rooted {
                rel_path.starts_with(&as_prefix)
            } else {
                rel_path.starts_with(&as_prefix) || rel_path.contains(&format!("/{p}/"))
            }
        } else if rule.rooted {
            rel_path == p || rel_path.starts_with(&as_prefix)
        } else {
            rel_path == p
                || rel_path.starts_with(&as_prefix)
                || rel_path.ends_with(&format!("/{p}"))
                || rel_path.contains(&format!("/{p}/"))
        };
        if matched {
            return true;
        }
    }
    false
}

/// Every `.mac` file under the project directory that survives
/// `.pdpy11ignore`, in sorted order.
pub fn collect_project_files(project: &Path) -> io::Result<Vec<PathBuf>> {
    let rules = match fs::read_to_string(project.join(".pdpy11ignore")) {
        Ok(content) => parse_ignore(&content),
        Err(_) => Vec::new(),
    };

    let mut files = Vec::new();
    walk(project, project, &rules, &mut files)?;
    files.sort();
    Ok(files)
}

fn walk(
    project: &Path,
    dir: &Path,
    rules: &[IgnoreRule],
    files: &mut Vec<PathBuf>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(project, &path, rules, files)?;
        } else {
            let rel = path
                .strip_prefix(project)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            if rel.to_lowercase().ends_with(".mac") && !is_ignored(&rel, rules) {
                files.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(text: &str) -> Vec<IgnoreRule> {
        parse_ignore(text)
    }

    #[test]
    fn test_plain_name_matches_anywhere() {
        let rules = rules("skip.mac\n");
        assert!(is_ignored("skip.mac", &rules));
        assert!(is_ignored("sub/skip.mac", &rules));
        assert!(!is_ignored("keep.mac", &rules));
    }

    #[test]
    fn test_rooted_rule_only_matches_at_top() {
        let rules = rules("/a\n");
        assert!(is_ignored("a", &rules));
        assert!(is_ignored("a/file.mac", &rules));
        assert!(!is_ignored("sub/a/file.mac", &rules));
    }

    #[test]
    fn test_directory_rule_spares_file_of_same_name() {
        let rules = rules("test.mac/\n");
        assert!(is_ignored("test.mac/inner.mac", &rules));
        assert!(is_ignored("x/test.mac/inner.mac", &rules));
        assert!(!is_ignored("test.mac", &rules));
        assert!(!is_ignored("x/test.mac", &rules));
    }

    #[test]
    fn test_component_substring() {
        let rules = rules("gen\n");
        assert!(is_ignored("src/gen/out.mac", &rules));
        assert!(!is_ignored("src/generic/out.mac", &rules));
    }

    #[test]
    fn test_comments_and_blanks() {
        let rules = rules("; all of it\n\nskip.mac ; trailing comment\n");
        assert_eq!(rules.len(), 1);
        assert!(is_ignored("skip.mac", &rules));
    }
}
