// `artifact-upload` / `artifact-download` builtins backed by a local store.
//
// Layout: `<artifact_dir>/<tag>/<file>` plus `<file>.sha256` holding the hex
// digest written at upload time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use worker_common::{StepResult, WorkerSettings};
use worker_sdk::StringUtil;

use super::{BuiltinAction, BuiltinContext};

const DEFAULT_TAG: &str = "latest";
const DIGEST_SUFFIX: &str = ".sha256";

pub fn upload_factory(settings: &WorkerSettings) -> Box<dyn BuiltinAction> {
    Box::new(ArtifactUpload {
        store: settings.artifact_dir.clone(),
    })
}

pub fn download_factory(settings: &WorkerSettings) -> Box<dyn BuiltinAction> {
    Box::new(ArtifactDownload {
        store: settings.artifact_dir.clone(),
    })
}

/// One file moved in or out of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transferred {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

pub struct ArtifactUpload {
    store: PathBuf,
}

#[async_trait]
impl BuiltinAction for ArtifactUpload {
    async fn run(&self, ctx: &BuiltinContext<'_>) -> StepResult {
        let Some(pattern) = ctx.non_empty_param("path") else {
            return fail(ctx, "artifact-upload requires a 'path' parameter");
        };
        let tag = tag_dir_name(ctx);
        let pattern = resolve(ctx, pattern);
        let dest = self.store.join(&tag);

        let outcome = tokio::task::spawn_blocking(move || upload(&pattern, &dest)).await;
        match outcome {
            Ok(Ok(files)) => {
                for f in &files {
                    ctx.log.log(format!("Uploaded {} ({} bytes, sha256 {}) as {tag}", f.name, f.size, f.sha256));
                }
                StepResult::success()
            }
            Ok(Err(e)) => fail(ctx, format!("artifact-upload failed: {e:#}")),
            Err(e) => fail(ctx, format!("artifact-upload task failed: {e}")),
        }
    }
}

pub struct ArtifactDownload {
    store: PathBuf,
}

#[async_trait]
impl BuiltinAction for ArtifactDownload {
    async fn run(&self, ctx: &BuiltinContext<'_>) -> StepResult {
        let Some(path) = ctx.non_empty_param("path") else {
            return fail(ctx, "artifact-download requires a 'path' parameter");
        };
        let filter = match ctx.non_empty_param("pattern").map(Regex::new).transpose() {
            Ok(filter) => filter,
            Err(e) => return fail(ctx, format!("invalid artifact pattern: {e}")),
        };
        let tag = tag_dir_name(ctx);
        let src = self.store.join(&tag);
        let dest = resolve(ctx, path);

        let outcome = tokio::task::spawn_blocking(move || download(&src, Path::new(&dest), filter.as_ref())).await;
        match outcome {
            Ok(Ok(files)) if files.is_empty() => fail(ctx, format!("No artifact found for tag {tag}")),
            Ok(Ok(files)) => {
                for f in &files {
                    ctx.log.log(format!("Downloaded {} ({} bytes)", f.name, f.size));
                }
                StepResult::success()
            }
            Ok(Err(e)) => fail(ctx, format!("artifact-download failed: {e:#}")),
            Err(e) => fail(ctx, format!("artifact-download task failed: {e}")),
        }
    }
}

fn fail(ctx: &BuiltinContext<'_>, reason: impl Into<String>) -> StepResult {
    let reason = reason.into();
    ctx.log.log(&reason);
    StepResult::fail(reason)
}

fn tag_dir_name(ctx: &BuiltinContext<'_>) -> String {
    StringUtil::format_into_safe_filename(ctx.non_empty_param("tag").unwrap_or(DEFAULT_TAG))
}

/// Relative paths are taken from `working-directory` when it is set.
fn resolve(ctx: &BuiltinContext<'_>, path: &str) -> String {
    match ctx.non_empty_param("working-directory") {
        Some(dir) if Path::new(path).is_relative() => Path::new(dir).join(path).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn upload(pattern: &str, dest: &Path) -> Result<Vec<Transferred>> {
    let files: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("Invalid path pattern {pattern:?}"))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    anyhow::ensure!(!files.is_empty(), "no file matches {pattern:?}");

    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut uploaded = Vec::with_capacity(files.len());
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("matched path has no file name")?;
        let target = dest.join(&name);
        let size = std::fs::copy(&file, &target)
            .with_context(|| format!("Failed to copy {} to {}", file.display(), target.display()))?;
        let sha256 = sha256_file(&target)?;
        std::fs::write(dest.join(format!("{name}{DIGEST_SUFFIX}")), &sha256)?;
        uploaded.push(Transferred { name, size, sha256 });
    }
    Ok(uploaded)
}

fn download(src: &Path, dest: &Path, filter: Option<&Regex>) -> Result<Vec<Transferred>> {
    if !src.is_dir() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = std::fs::read_dir(src)
        .with_context(|| format!("Failed to list {}", src.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.ends_with(DIGEST_SUFFIX))
        .filter(|name| filter.map_or(true, |re| re.is_match(name)))
        .collect();
    names.sort();

    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut downloaded = Vec::with_capacity(names.len());
    for name in names {
        let stored = src.join(&name);
        let sha256 = sha256_file(&stored)?;
        if let Ok(expected) = std::fs::read_to_string(src.join(format!("{name}{DIGEST_SUFFIX}"))) {
            let expected = expected.trim().to_lowercase();
            anyhow::ensure!(
                sha256 == expected,
                "SHA256 mismatch for {name}: expected={expected}, computed={sha256}"
            );
        }
        let size = std::fs::copy(&stored, dest.join(&name))
            .with_context(|| format!("Failed to copy {name} into {}", dest.display()))?;
        downloaded.push(Transferred { name, size, sha256 });
    }
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::test_support::Harness;

    fn settings(store: &Path) -> WorkerSettings {
        WorkerSettings::default().with_artifact_dir(store)
    }

    #[tokio::test]
    async fn upload_then_download_with_pattern() {
        let work = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("app.tar"), b"binary").unwrap();
        std::fs::write(work.path().join("notes.txt"), b"text").unwrap();

        let pattern = work.path().join("*").to_string_lossy().into_owned();
        let mut up = Harness::new("artifact-upload", &[("path", pattern.as_str()), ("tag", "v1")]);
        let result = upload_factory(&settings(store.path())).run(&up.ctx()).await;
        assert!(result.is_success(), "{result}");
        assert_eq!(up.logs().await.len(), 2);
        assert!(store.path().join("v1/app.tar").is_file());
        assert!(store.path().join("v1/app.tar.sha256").is_file());

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().to_string_lossy().into_owned();
        let mut down = Harness::new(
            "artifact-download",
            &[("path", dest.as_str()), ("tag", "v1"), ("pattern", r"\.tar$")],
        );
        let result = download_factory(&settings(store.path())).run(&down.ctx()).await;
        assert!(result.is_success(), "{result}");
        assert_eq!(down.logs().await, vec!["Downloaded app.tar (6 bytes)\n"]);
        assert_eq!(std::fs::read(out.path().join("app.tar")).unwrap(), b"binary");
        assert!(!out.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn upload_without_match_fails() {
        let store = tempfile::tempdir().unwrap();
        let h = Harness::new("artifact-upload", &[("path", "/nonexistent/dir/*.bin")]);
        let result = upload_factory(&settings(store.path())).run(&h.ctx()).await;
        assert!(!result.is_success());
        assert!(result.reason.contains("no file matches"));
    }

    #[tokio::test]
    async fn missing_path_parameter_fails() {
        let store = tempfile::tempdir().unwrap();
        let h = Harness::new("artifact-download", &[]);
        let result = download_factory(&settings(store.path())).run(&h.ctx()).await;
        assert!(result.reason.contains("requires a 'path' parameter"));
    }

    #[tokio::test]
    async fn download_of_unknown_tag_fails() {
        let store = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().to_string_lossy().into_owned();
        let h = Harness::new("artifact-download", &[("path", dest.as_str()), ("tag", "nope")]);
        let result = download_factory(&settings(store.path())).run(&h.ctx()).await;
        assert_eq!(result.reason, "No artifact found for tag nope");
    }

    #[test]
    fn tampered_artifact_is_rejected() {
        let store = tempfile::tempdir().unwrap();
        let tag = store.path().join("latest");
        std::fs::create_dir_all(&tag).unwrap();
        std::fs::write(tag.join("a.bin"), b"changed").unwrap();
        std::fs::write(tag.join("a.bin.sha256"), "00ff").unwrap();

        let out = tempfile::tempdir().unwrap();
        let err = download(&tag, out.path(), None).unwrap_err();
        assert!(err.to_string().contains("SHA256 mismatch"));
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(
            sha256_file(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
