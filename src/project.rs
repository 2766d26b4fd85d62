//! Project identity inference.
//!
//! A project is named after the repository that owns the knowledge
//! directory. Linked worktrees share the name of their main checkout and
//! contribute their own branch; standard checkouts use their own directory
//! name. Outside git the directory name is used and no branch is known.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};

/// Knowledge directory names looked up under the working directory.
pub const WORKSPACE_DIRS: [&str; 2] = [".giantmem", "scratch"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIdentity {
    pub name: String,
    pub branch: Option<String>,
}

/// Resolve the directory to archive.
///
/// An explicit source must exist. Without one, the first of
/// [`WORKSPACE_DIRS`] present under `cwd` is used.
pub fn resolve_source(cwd: &Path, source: Option<&Path>) -> Result<PathBuf> {
    if let Some(source) = source {
        let path = if source.is_absolute() {
            source.to_path_buf()
        } else {
            cwd.join(source)
        };
        if !path.is_dir() {
            return Err(ArchiveError::not_found(
                "source directory",
                path.display().to_string(),
            ));
        }
        return Ok(path);
    }

    WORKSPACE_DIRS
        .iter()
        .map(|name| cwd.join(name))
        .find(|p| p.is_dir())
        .ok_or_else(|| {
            ArchiveError::not_found(
                "workspace directory",
                format!("{}/{{.giantmem,scratch}}", cwd.display()),
            )
        })
}

/// Infer the project for a source directory.
///
/// When the source is itself a workspace directory (`scratch/`,
/// `.giantmem/`), its parent is the checkout that names the project.
pub fn infer_project(source: &Path) -> Result<ProjectIdentity> {
    let source = source.canonicalize()?;
    let base = match source.file_name().and_then(|n| n.to_str()) {
        Some(name) if WORKSPACE_DIRS.contains(&name) => {
            source.parent().unwrap_or(&source).to_path_buf()
        }
        _ => source.clone(),
    };

    for dir in base.ancestors() {
        let dot_git = dir.join(".git");
        if dot_git.is_file() {
            if let Some(identity) = linked_worktree_identity(&dot_git) {
                return Ok(identity);
            }
        } else if dot_git.is_dir() {
            return Ok(ProjectIdentity {
                name: dir_name(dir)?,
                branch: read_head_branch(&dot_git),
            });
        }
    }

    Ok(ProjectIdentity {
        name: dir_name(&base)?,
        branch: None,
    })
}

/// `.git` file of a linked worktree: `gitdir: <main>/.git/worktrees/<name>`.
fn linked_worktree_identity(dot_git_file: &Path) -> Option<ProjectIdentity> {
    let raw = fs::read_to_string(dot_git_file).ok()?;
    let gitdir = raw.lines().find_map(|l| l.strip_prefix("gitdir:"))?.trim();
    let gitdir = match Path::new(gitdir) {
        p if p.is_absolute() => p.to_path_buf(),
        p => dot_git_file.parent()?.join(p),
    };

    let worktrees = gitdir.parent()?;
    if worktrees.file_name()? != "worktrees" {
        return None;
    }
    let main_checkout = worktrees.parent()?.parent()?;
    let worktree_name = gitdir.file_name()?.to_string_lossy().to_string();

    Some(ProjectIdentity {
        name: main_checkout.file_name()?.to_string_lossy().to_string(),
        branch: read_head_branch(&gitdir).or(Some(worktree_name)),
    })
}

fn read_head_branch(gitdir: &Path) -> Option<String> {
    let head = fs::read_to_string(gitdir.join("HEAD")).ok()?;
    head.trim()
        .strip_prefix("ref: refs/heads/")
        .map(|b| b.to_string())
}

fn dir_name(dir: &Path) -> Result<String> {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ArchiveError::InvalidName {
            kind: "project",
            name: dir.display().to_string(),
        })
}

/// Make a project or branch name safe as a single path segment.
///
/// Separators and whitespace collapse to `-`; names that would collide with
/// reserved layout entries are rejected.
pub fn sanitize_segment(kind: &'static str, input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut prev_dash = false;
    for ch in input.trim().chars() {
        if ch == '/' || ch == '\\' || ch.is_whitespace() || ch.is_control() {
            if !prev_dash {
                out.push('-');
                prev_dash = true;
            }
        } else {
            out.push(ch);
            prev_dash = false;
        }
    }
    let out = out.trim_matches('-').to_string();

    let reserved = out.is_empty()
        || out.starts_with('.')
        || out.starts_with('_')
        || out == crate::snapshot::LATEST
        || crate::snapshot::is_timestamp(&out);
    if reserved {
        return Err(ArchiveError::InvalidName {
            kind,
            name: input.to_string(),
        });
    }
    Ok(out)
}
