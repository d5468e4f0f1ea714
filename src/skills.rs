//! Skill catalog: markdown files with optional frontmatter, loaded fresh on
//! every call from two workspace directories (hidden dir wins ties).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Skill {
    pub canonical_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub aliases: Vec<String>,
    pub body: String,
    pub filesystem_path: PathBuf,
}

pub struct SkillLoader {
    hidden_dir: PathBuf,
    visible_dir: PathBuf,
}

impl SkillLoader {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            hidden_dir: workspace_root.join(".anuris_skills"),
            visible_dir: workspace_root.join("skills"),
        }
    }

    /// Rescan both directories (hidden dir takes precedence on name clash)
    /// and parse every `*.md` file into a `Skill`.
    pub fn scan(&self) -> Vec<Skill> {
        let mut by_name: HashMap<String, Skill> = HashMap::new();
        // Visible dir first, hidden dir second so hidden-dir entries
        // overwrite any name collision.
        for dir in [&self.visible_dir, &self.hidden_dir] {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                if let Some(skill) = Self::parse_file(&path) {
                    by_name.insert(skill.canonical_name.clone(), skill);
                }
            }
        }
        let mut skills: Vec<Skill> = by_name.into_values().collect();
        skills.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));
        skills
    }

    fn parse_file(path: &Path) -> Option<Skill> {
        let contents = std::fs::read_to_string(path).ok()?;
        let stem = path.file_stem()?.to_string_lossy().to_string();
        let canonical_name = normalize(&stem);

        let (frontmatter, body) = split_frontmatter(&contents);
        let fields = parse_frontmatter(frontmatter);

        Some(Skill {
            canonical_name,
            description: fields.get("description").cloned().unwrap_or_default(),
            tags: fields
                .get("tags")
                .map(|t| split_csv(t))
                .unwrap_or_default(),
            aliases: fields
                .get("aliases")
                .map(|t| split_csv(t))
                .unwrap_or_default(),
            body: body.to_string(),
            filesystem_path: path.to_path_buf(),
        })
    }

    /// Compact, system-prompt-ready list of `name: description` lines.
    pub fn descriptions(&self) -> Vec<String> {
        self.scan()
            .iter()
            .map(|s| {
                if s.description.is_empty() {
                    s.canonical_name.clone()
                } else {
                    format!("{}: {}", s.canonical_name, s.description)
                }
            })
            .collect()
    }

    /// Resolve `name` against the alias map and return the wrapped skill
    /// body, or an `Error: ...` string including a close-match suggestion.
    pub fn load(&self, name: &str) -> Result<String, String> {
        let skills = self.scan();
        let query = normalize(name);

        if let Some(skill) = Self::resolve(&skills, &query) {
            return Ok(format!(
                "<skill name=\"{}\">\n{}\n</skill>",
                skill.canonical_name, skill.body
            ));
        }

        let mut candidates: Vec<&str> = Vec::new();
        for skill in &skills {
            candidates.push(skill.canonical_name.as_str());
            for alias in skill.tags.iter().chain(skill.aliases.iter()) {
                candidates.push(alias.as_str());
            }
        }
        let suggestion = closest_match(&query, &candidates);
        match suggestion {
            Some(s) => {
                warn!(requested = %name, suggested = %s, "skill load miss, suggesting closest match");
                Err(format!(
                    "Error: skill '{name}' not found. Did you mean '{s}'?"
                ))
            }
            None => {
                warn!(requested = %name, "skill load miss, no close match found");
                Err(format!("Error: skill '{name}' not found"))
            }
        }
    }

    fn resolve<'a>(skills: &'a [Skill], query: &str) -> Option<&'a Skill> {
        // Exact canonical match.
        if let Some(s) = skills.iter().find(|s| s.canonical_name == query) {
            return Some(s);
        }
        // Alias: tags/explicit aliases, dash-stripped, token signature, nb- variants.
        let stripped = strip_nb(query);
        let no_dash = query.replace('-', "");
        let signature = token_signature(query);

        skills.iter().find(|s| {
            s.tags.iter().any(|t| normalize(t) == query)
                || s.aliases.iter().any(|t| normalize(t) == query)
                || strip_nb(&s.canonical_name) == stripped
                || s.canonical_name.replace('-', "") == no_dash
                || token_signature(&s.canonical_name) == signature
                || s.canonical_name == format!("nb-{query}")
                || format!("nb-{}", s.canonical_name) == query
        })
    }
}

fn strip_nb(name: &str) -> String {
    name.strip_prefix("nb-").unwrap_or(name).to_string()
}

fn token_signature(name: &str) -> String {
    let mut tokens: Vec<&str> = name.split('-').filter(|t| !t.is_empty()).collect();
    tokens.sort_unstable();
    tokens.join("-")
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// lowercase; backslashes -> slashes; last path segment; strip `.md`;
/// non-`[a-z0-9_-]` runs -> `-`; collapse repeats; trim `-`; `_` -> `-`.
pub fn normalize(raw: &str) -> String {
    let lower = raw.to_lowercase().replace('\\', "/");
    let last_segment = lower.rsplit('/').next().unwrap_or(&lower);
    let stripped = last_segment.strip_suffix(".md").unwrap_or(last_segment);

    let mut collapsed = String::new();
    let mut prev_dash = false;
    for ch in stripped.chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' {
            ch
        } else {
            '-'
        };
        if mapped == '-' {
            if !prev_dash {
                collapsed.push('-');
            }
            prev_dash = true;
        } else {
            collapsed.push(mapped);
            prev_dash = false;
        }
    }
    collapsed.trim_matches('-').replace('_', "-")
}

fn split_frontmatter(contents: &str) -> (&str, &str) {
    let Some(rest) = contents.strip_prefix("---\n") else {
        return ("", contents);
    };
    let Some(end) = rest.find("\n---") else {
        return ("", contents);
    };
    let frontmatter = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    (frontmatter, body)
}

fn parse_frontmatter(raw: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in raw.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    fields
}

/// Smallest-edit-distance suggestion over a candidate pool, `None` if the
/// closest candidate is further than a generous typo threshold.
fn closest_match<'a>(query: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(query, c)))
        .min_by_key(|(_, d)| *d)
        .filter(|(_, d)| *d <= 3)
        .map(|(c, _)| c)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_skill(dir: &Path, filename: &str, contents: &str) {
        fs::write(dir.join(filename), contents).unwrap();
    }

    #[test]
    fn loads_exact_canonical_name_with_frontmatter() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("skills")).unwrap();
        write_skill(
            &tmp.path().join("skills"),
            "code-review.md",
            "---\ndescription: Review a diff\ntags: review,qa\n---\nRun the checklist.",
        );

        let loader = SkillLoader::new(tmp.path());
        let loaded = loader.load("code-review").unwrap();
        assert!(loaded.contains("<skill name=\"code-review\">"));
        assert!(loaded.contains("Run the checklist."));
    }

    #[test]
    fn hidden_dir_takes_precedence_over_visible_dir() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("skills")).unwrap();
        fs::create_dir_all(tmp.path().join(".anuris_skills")).unwrap();
        write_skill(&tmp.path().join("skills"), "deploy.md", "visible version");
        write_skill(
            &tmp.path().join(".anuris_skills"),
            "deploy.md",
            "hidden version",
        );

        let loader = SkillLoader::new(tmp.path());
        let loaded = loader.load("deploy").unwrap();
        assert!(loaded.contains("hidden version"));
        assert!(!loaded.contains("visible version"));
    }

    #[test]
    fn unknown_skill_suggests_closest_match() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("skills")).unwrap();
        write_skill(&tmp.path().join("skills"), "deploy-app.md", "body");

        let loader = SkillLoader::new(tmp.path());
        let err = loader.load("deploy-ap").unwrap_err();
        assert!(err.starts_with("Error:"));
        assert!(err.contains("deploy-app"));
    }

    #[test]
    fn token_signature_resolves_reordered_dash_tokens() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("skills")).unwrap();
        write_skill(&tmp.path().join("skills"), "review-code.md", "body");

        let loader = SkillLoader::new(tmp.path());
        assert!(loader.load("code-review").is_ok());
    }

    #[test]
    fn nb_prefix_is_stripped_for_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("skills")).unwrap();
        write_skill(&tmp.path().join("skills"), "nb-triage.md", "body");

        let loader = SkillLoader::new(tmp.path());
        assert!(loader.load("triage").is_ok());
    }

    #[test]
    fn normalize_handles_mixed_separators_and_case() {
        assert_eq!(normalize("Some Dir\\My_Skill.md"), "my-skill");
        assert_eq!(normalize("already-good"), "already-good");
    }
}
