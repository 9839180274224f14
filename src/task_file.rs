//! Task document handling: header parsing, canonical writing, repo path
//! resolution, and id derivation from filenames.
//!
//! A task document is markdown with an optional header block delimited by
//! two `---` lines containing a small YAML map, followed by the free-form
//! task body.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("Task file not found: {0}")]
    NotFound(PathBuf),

    #[error("Missing required frontmatter keys: {0}")]
    MissingKeys(String),

    #[error("Invalid YAML in frontmatter: {0}")]
    InvalidHeader(String),

    #[error("Repo path does not exist: {0}")]
    RepoNotFound(PathBuf),

    #[error("Task ID mismatch: argument '{arg}' vs frontmatter '{header}'")]
    IdMismatch { arg: String, header: String },

    #[error("Cannot derive task ID from filename: {0}")]
    UnusableFilename(String),

    #[error("could not determine home directory")]
    NoHome,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Raw header fields as written in a task document. Unknown keys are
/// ignored; all recognised keys are optional at this layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHeader {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
}

/// Fully validated header with the repo path resolved.
#[derive(Debug, Clone)]
pub struct Frontmatter {
    pub id: String,
    pub repo: PathBuf,
    pub base: String,
    pub branch: String,
    pub worktree_path: String,
}

impl Frontmatter {
    fn from_raw(raw: RawHeader) -> Result<Self, TaskFileError> {
        let mut missing = Vec::new();
        if raw.id.as_deref().unwrap_or("").is_empty() {
            missing.push("id");
        }
        if raw.repo.as_deref().unwrap_or("").is_empty() {
            missing.push("repo");
        }
        if !missing.is_empty() {
            return Err(TaskFileError::MissingKeys(missing.join(", ")));
        }

        Ok(Frontmatter {
            id: raw.id.unwrap_or_default(),
            repo: resolve_repo_path(&raw.repo.unwrap_or_default())?,
            base: raw.base.unwrap_or_else(|| "main".to_string()),
            branch: raw.branch.unwrap_or_default(),
            worktree_path: raw.worktree_path.unwrap_or_default(),
        })
    }
}

/// Resolve a repo reference: an absolute path is used as-is, a short name
/// resolves to `~/documents/repos/<name>`. The directory must exist.
pub fn resolve_repo_path(repo: &str) -> Result<PathBuf, TaskFileError> {
    let resolved = if repo.starts_with('/') {
        PathBuf::from(repo)
    } else {
        let home = dirs::home_dir().ok_or(TaskFileError::NoHome)?;
        home.join("documents").join("repos").join(repo)
    };

    if !resolved.is_dir() {
        return Err(TaskFileError::RepoNotFound(resolved));
    }
    Ok(resolved)
}

/// Lenient parse: returns the header (when a complete delimited block is
/// present) and the body. An opening `---` without a closing delimiter is
/// treated as plain body; YAML errors inside a complete block fail.
pub fn parse_header_optional(content: &str) -> Result<(Option<RawHeader>, String), TaskFileError> {
    let mut lines = content.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return Ok((None, String::new()));
    };
    if first.trim_end() != "---" {
        return Ok((None, content.to_string()));
    }

    let mut consumed = first.len();
    let mut yaml = String::new();
    for line in lines {
        consumed += line.len();
        if line.trim_end() == "---" {
            let body = content[consumed..].to_string();
            let header = parse_yaml_header(&yaml)?;
            return Ok((Some(header), body));
        }
        yaml.push_str(line);
    }

    // Unterminated header block: treat the whole document as body.
    Ok((None, content.to_string()))
}

/// Strict parse: the header must be present and carry `id` and `repo`.
pub fn parse_header(content: &str) -> Result<(Frontmatter, String), TaskFileError> {
    let (raw, body) = parse_header_optional(content)?;
    let raw = raw.ok_or_else(|| {
        TaskFileError::InvalidHeader(
            "document must start with --- and contain a key/value header".to_string(),
        )
    })?;
    Ok((Frontmatter::from_raw(raw)?, body))
}

fn parse_yaml_header(yaml: &str) -> Result<RawHeader, TaskFileError> {
    if yaml.trim().is_empty() {
        return Ok(RawHeader::default());
    }
    serde_yaml::from_str(yaml).map_err(|e| TaskFileError::InvalidHeader(e.to_string()))
}

#[derive(Serialize)]
struct HeaderOut<'a> {
    id: &'a str,
    repo: &'a str,
    base: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    branch: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    worktree_path: &'a str,
}

/// Build a canonical task document: deterministic header key order
/// (`id, repo, base, branch?, worktree_path?`) followed by the body
/// verbatim. The repo reference is resolved and validated.
pub fn canonical_task_document(
    task_id: &str,
    repo: &str,
    body: &str,
    base: &str,
    branch: Option<&str>,
    worktree_path: Option<&str>,
) -> Result<String, TaskFileError> {
    let resolved_repo = resolve_repo_path(repo)?;
    let header = HeaderOut {
        id: task_id,
        repo: resolved_repo.to_str().unwrap_or(repo),
        base,
        branch: branch.unwrap_or(""),
        worktree_path: worktree_path.unwrap_or(""),
    };
    let yaml =
        serde_yaml::to_string(&header).map_err(|e| TaskFileError::InvalidHeader(e.to_string()))?;
    Ok(format!("---\n{yaml}---\n{body}"))
}

/// Write a canonical task document to `<tasks_dir>/<task_id>.md`, rejecting
/// content whose header id disagrees with the caller's id.
pub fn write_task_file(
    task_id: &str,
    content: &str,
    tasks_dir: &Path,
) -> Result<PathBuf, TaskFileError> {
    fs::create_dir_all(tasks_dir)?;

    let (frontmatter, _) = parse_header(content)?;
    if frontmatter.id != task_id {
        return Err(TaskFileError::IdMismatch {
            arg: task_id.to_string(),
            header: frontmatter.id,
        });
    }

    let file_path = tasks_dir.join(format!("{task_id}.md"));
    fs::write(&file_path, content)?;
    Ok(file_path)
}

/// Read and strictly parse `<tasks_dir>/<task_id>.md`.
pub fn read_task_file(
    task_id: &str,
    tasks_dir: &Path,
) -> Result<(Frontmatter, String), TaskFileError> {
    let file_path = tasks_dir.join(format!("{task_id}.md"));
    if !file_path.exists() {
        return Err(TaskFileError::NotFound(file_path));
    }
    let content = fs::read_to_string(&file_path)?;
    parse_header(&content)
}

/// Read a task document leniently and return only its body.
pub fn read_task_body(path: &Path) -> Result<String, TaskFileError> {
    if !path.exists() {
        return Err(TaskFileError::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let (_, body) = parse_header_optional(&content)?;
    Ok(body)
}

/// Derive a task id from a source filename when none is supplied: strip
/// the extension, collapse non-alphanumeric runs to `-`, uppercase, and
/// prepend `T-` unless already prefixed.
pub fn derive_id_from_filename(path: &Path) -> Result<String, TaskFileError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .trim();

    let mut normalized = String::with_capacity(stem.len());
    let mut in_run = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            normalized.push(c);
            in_run = false;
        } else if !in_run {
            normalized.push('-');
            in_run = true;
        }
    }
    let normalized = normalized.trim_matches('-').to_string();
    if normalized.is_empty() {
        return Err(TaskFileError::UnusableFilename(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ));
    }

    let upper = normalized.to_uppercase();
    if upper.starts_with("T-") {
        Ok(upper)
    } else {
        Ok(format!("T-{upper}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_header_optional ──

    #[test]
    fn lenient_parse_without_header_returns_whole_body() {
        let (header, body) = parse_header_optional("Just a task body.\n").unwrap();
        assert!(header.is_none());
        assert_eq!(body, "Just a task body.\n");
    }

    #[test]
    fn lenient_parse_extracts_header_and_body() {
        let content = "---\nid: T-001\nrepo: /tmp\nbase: develop\n---\nDo the thing.\n";
        let (header, body) = parse_header_optional(content).unwrap();
        let header = header.unwrap();
        assert_eq!(header.id.as_deref(), Some("T-001"));
        assert_eq!(header.base.as_deref(), Some("develop"));
        assert_eq!(body, "Do the thing.\n");
    }

    #[test]
    fn lenient_parse_ignores_unknown_keys() {
        let content = "---\nid: T-001\nrepo: /tmp\npriority: high\n---\nbody";
        let (header, _) = parse_header_optional(content).unwrap();
        assert_eq!(header.unwrap().id.as_deref(), Some("T-001"));
    }

    #[test]
    fn unterminated_header_is_plain_body() {
        let content = "---\nid: T-001\nno closing delimiter";
        let (header, body) = parse_header_optional(content).unwrap();
        assert!(header.is_none());
        assert_eq!(body, content);
    }

    #[test]
    fn invalid_yaml_between_delimiters_fails() {
        let content = "---\n: [unbalanced\n---\nbody";
        let err = parse_header_optional(content).unwrap_err();
        assert!(matches!(err, TaskFileError::InvalidHeader(_)));
    }

    #[test]
    fn empty_header_block_parses_as_empty() {
        let (header, body) = parse_header_optional("---\n---\nbody").unwrap();
        assert!(header.unwrap().id.is_none());
        assert_eq!(body, "body");
    }

    // ── parse_header (strict) ──

    #[test]
    fn strict_parse_requires_header() {
        let err = parse_header("no header at all").unwrap_err();
        assert!(matches!(err, TaskFileError::InvalidHeader(_)));
    }

    #[test]
    fn strict_parse_requires_id_and_repo() {
        let err = parse_header("---\nbase: main\n---\nbody").unwrap_err();
        match err {
            TaskFileError::MissingKeys(keys) => {
                assert!(keys.contains("id"));
                assert!(keys.contains("repo"));
            }
            other => panic!("expected MissingKeys, got {other:?}"),
        }
    }

    #[test]
    fn strict_parse_resolves_repo_and_defaults_base() {
        let repo = tempfile::tempdir().unwrap();
        let content = format!("---\nid: T-001\nrepo: {}\n---\nbody", repo.path().display());
        let (frontmatter, body) = parse_header(&content).unwrap();
        assert_eq!(frontmatter.id, "T-001");
        assert_eq!(frontmatter.repo, repo.path());
        assert_eq!(frontmatter.base, "main");
        assert_eq!(body, "body");
    }

    #[test]
    fn strict_parse_rejects_missing_repo_dir() {
        let content = "---\nid: T-001\nrepo: /definitely/not/here\n---\nbody";
        let err = parse_header(content).unwrap_err();
        assert!(matches!(err, TaskFileError::RepoNotFound(_)));
    }

    // ── canonical writer ──

    #[test]
    fn canonical_document_has_deterministic_key_order() {
        let repo = tempfile::tempdir().unwrap();
        let doc = canonical_task_document(
            "T-001",
            repo.path().to_str().unwrap(),
            "Body text.\n",
            "main",
            None,
            None,
        )
        .unwrap();

        let expected = format!(
            "---\nid: T-001\nrepo: {}\nbase: main\n---\nBody text.\n",
            repo.path().display()
        );
        assert_eq!(doc, expected);
    }

    #[test]
    fn canonical_document_includes_optional_keys_in_order() {
        let repo = tempfile::tempdir().unwrap();
        let doc = canonical_task_document(
            "T-001",
            repo.path().to_str().unwrap(),
            "body",
            "dev",
            Some("feature/x"),
            Some("/wt/T-001"),
        )
        .unwrap();

        let branch_pos = doc.find("branch:").unwrap();
        let worktree_pos = doc.find("worktree_path:").unwrap();
        let base_pos = doc.find("base:").unwrap();
        assert!(base_pos < branch_pos && branch_pos < worktree_pos);
    }

    #[test]
    fn writer_rejects_id_mismatch() {
        let repo = tempfile::tempdir().unwrap();
        let tasks = tempfile::tempdir().unwrap();
        let doc = canonical_task_document(
            "T-002",
            repo.path().to_str().unwrap(),
            "body",
            "main",
            None,
            None,
        )
        .unwrap();

        let err = write_task_file("T-001", &doc, tasks.path()).unwrap_err();
        assert!(matches!(err, TaskFileError::IdMismatch { .. }));
    }

    #[test]
    fn write_then_read_round_trips() {
        let repo = tempfile::tempdir().unwrap();
        let tasks = tempfile::tempdir().unwrap();
        let doc = canonical_task_document(
            "T-001",
            repo.path().to_str().unwrap(),
            "Implement feature X\n",
            "main",
            None,
            None,
        )
        .unwrap();

        let path = write_task_file("T-001", &doc, tasks.path()).unwrap();
        assert_eq!(path, tasks.path().join("T-001.md"));

        let (frontmatter, body) = read_task_file("T-001", tasks.path()).unwrap();
        assert_eq!(frontmatter.id, "T-001");
        assert_eq!(body, "Implement feature X\n");
    }

    #[test]
    fn read_task_body_is_lenient() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("note.md");
        fs::write(&path, "plain body, no header").unwrap();
        assert_eq!(read_task_body(&path).unwrap(), "plain body, no header");

        let missing = tmp.path().join("absent.md");
        assert!(matches!(
            read_task_body(&missing).unwrap_err(),
            TaskFileError::NotFound(_)
        ));
    }

    // ── id derivation ──

    #[test]
    fn id_from_filename_normalizes_and_prefixes() {
        let id = derive_id_from_filename(Path::new("hello world task.md")).unwrap();
        assert_eq!(id, "T-HELLO-WORLD-TASK");
    }

    #[test]
    fn id_from_filename_keeps_existing_prefix() {
        let id = derive_id_from_filename(Path::new("t-042 fix.md")).unwrap();
        assert_eq!(id, "T-042-FIX");
    }

    #[test]
    fn id_from_filename_rejects_unusable_names() {
        let err = derive_id_from_filename(Path::new("---.md")).unwrap_err();
        assert!(matches!(err, TaskFileError::UnusableFilename(_)));
    }

    // ── repo resolution ──

    #[test]
    fn absolute_repo_path_must_exist() {
        let repo = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_repo_path(repo.path().to_str().unwrap()).unwrap(),
            repo.path()
        );
        assert!(matches!(
            resolve_repo_path("/no/such/repo").unwrap_err(),
            TaskFileError::RepoNotFound(_)
        ));
    }
}
