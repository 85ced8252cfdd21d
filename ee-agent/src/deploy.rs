//! Workload deployment.
//!
//! One task per deployment walks `pending -> deploying -> complete|failed`,
//! persisting state as a JSON file per deployment (atomic write-rename, the
//! request's private env is never persisted). Bundles are extracted into a
//! scratch directory with a path-traversal guard before anything touches
//! the workload root, so a hostile archive fails the whole deployment
//! without mutating the installed workload.

use std::{
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Complete,
    Failed,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Deployment {
    pub id: String,
    pub repo: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub bundle_artifact_id: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Base64 quote binding the post-deploy attestation.
    #[serde(default)]
    pub quote: Option<String>,
    /// Tail of the compose output from the last run.
    #[serde(default)]
    pub log_tail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Deployment {
    pub fn new(id: String, repo: String, bundle_artifact_id: Option<i64>) -> Self {
        let now = utcnow();
        Self {
            id,
            repo,
            status: DeploymentStatus::Pending,
            bundle_artifact_id,
            error: None,
            quote: None,
            log_tail: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

fn utcnow() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// JSON-file-per-deployment persistence.
pub struct DeploymentStore {
    dir: PathBuf,
}

impl DeploymentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn save(&self, deployment: &mut Deployment) -> anyhow::Result<()> {
        deployment.updated_at = utcnow();
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("mkdir {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", deployment.id));
        let tmp = self.dir.join(format!(".{}.json.tmp", deployment.id));
        let json = serde_json::to_vec_pretty(deployment)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, deployment_id: &str) -> Option<Deployment> {
        // Ids are generated hex; refuse anything that could leave the dir.
        if !deployment_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
        let path = self.dir.join(format!("{deployment_id}.json"));
        let contents = std::fs::read(path).ok()?;
        serde_json::from_slice(&contents).ok()
    }
}

// --- Bundle handling --- //

/// Extract a bundle archive (zip, tar, or tar.gz) into `dest`.
///
/// Any member whose path would escape `dest` fails the whole extraction;
/// nothing is retroactively cleaned because callers always extract into a
/// fresh scratch directory.
pub fn extract_bundle(archive: &[u8], dest: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dest)?;
    if archive.starts_with(b"PK\x03\x04") {
        extract_zip(archive, dest)
    } else if archive.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = flate2::read::GzDecoder::new(archive);
        let mut tar_bytes = Vec::new();
        decoder
            .read_to_end(&mut tar_bytes)
            .context("Bad gzip stream in bundle")?;
        extract_tar(&tar_bytes, dest)
    } else {
        extract_tar(archive, dest)
    }
}

fn extract_zip(archive: &[u8], dest: &Path) -> anyhow::Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .context("Bad zip archive")?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let rel_path = entry
            .enclosed_name()
            .with_context(|| format!("Bundle entry escapes extraction root: {}", entry.name()))?;
        let out_path = dest.join(rel_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        std::fs::write(&out_path, contents)?;
    }
    Ok(())
}

fn extract_tar(archive: &[u8], dest: &Path) -> anyhow::Result<()> {
    let mut tar = tar::Archive::new(Cursor::new(archive));
    for entry in tar.entries().context("Bad tar archive")? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        // unpack_in refuses traversal, but we want the whole extraction to
        // fail loudly rather than skip the entry.
        if !entry.unpack_in(dest)? {
            bail!("Bundle entry escapes extraction root: {}", path.display());
        }
    }
    Ok(())
}

/// Locate the bundle's single compose file. With several candidates, a
/// root-level compose wins; otherwise the bundle is ambiguous.
pub fn find_compose(root: &Path) -> anyhow::Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            matches!(
                entry.file_name().to_str(),
                Some("docker-compose.yml") | Some("docker-compose.yaml")
            )
        })
        .map(|entry| entry.into_path())
        .collect();
    candidates.sort();

    match candidates.len() {
        0 => bail!("Bundle missing docker-compose.yml"),
        1 => Ok(candidates.remove(0)),
        _ => {
            for name in ["docker-compose.yml", "docker-compose.yaml"] {
                let at_root = root.join(name);
                if candidates.contains(&at_root) {
                    return Ok(at_root);
                }
            }
            bail!("Bundle has multiple docker-compose files and no root compose")
        }
    }
}

/// Compose `.env` from the bundle's public env and the request's private
/// env. The private file and the combined file are written `0600`.
pub fn write_env_files(
    workload_dir: &Path,
    env_public: Option<&str>,
    private_env: Option<&str>,
) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut parts = Vec::new();
    if let Some(public) = env_public {
        std::fs::write(workload_dir.join(".env.public"), public)?;
        parts.push(public.to_owned());
    }
    if let Some(private) = private_env {
        let private_path = workload_dir.join(".env.private");
        std::fs::write(&private_path, private)?;
        std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
        parts.push(private.to_owned());
    }
    if !parts.is_empty() {
        let env_path = workload_dir.join(".env");
        std::fs::write(&env_path, parts.join("\n"))?;
        std::fs::set_permissions(&env_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Copy the extracted bundle into the workload root.
fn install_bundle(bundle_root: &Path, workload_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(workload_dir)?;
    for entry in walkdir::WalkDir::new(bundle_root) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(bundle_root)
            .expect("walk stays under root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = workload_dir.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// `docker compose` if the plugin is installed, else `docker-compose`.
async fn resolve_compose_command() -> anyhow::Result<Vec<&'static str>> {
    let plugin = tokio::process::Command::new("docker")
        .args(["compose", "version"])
        .output()
        .await;
    if matches!(&plugin, Ok(output) if output.status.success()) {
        return Ok(vec!["docker", "compose"]);
    }
    let legacy = tokio::process::Command::new("docker-compose")
        .arg("version")
        .output()
        .await;
    if matches!(&legacy, Ok(output) if output.status.success()) {
        return Ok(vec!["docker-compose"]);
    }
    bail!("docker compose is not available in the agent VM")
}

const LOG_TAIL_BYTES: usize = 20_000;

async fn run_compose_up(compose_path: &Path) -> anyhow::Result<String> {
    let command = resolve_compose_command().await?;
    let (program, prefix_args) = command.split_first().expect("non-empty command");
    let output = tokio::process::Command::new(program)
        .args(prefix_args.iter())
        .arg("-f")
        .arg(compose_path)
        .args(["up", "-d", "--remove-orphans"])
        .output()
        .await
        .context("Failed to spawn compose")?;
    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    let mut tail_at = log.len().saturating_sub(LOG_TAIL_BYTES);
    while !log.is_char_boundary(tail_at) {
        tail_at += 1;
    }
    let log_tail = log[tail_at..].to_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("docker compose failed: {}", stderr.trim());
    }
    Ok(log_tail)
}

// --- The worker --- //

/// What a deploy request carries beside the repo: a bundle source and the
/// private env that must never hit the state file.
pub struct DeployJob {
    pub deployment_id: String,
    pub repo: String,
    pub bundle_artifact_id: Option<i64>,
    pub bundle_b64: Option<String>,
    pub private_env: Option<String>,
    pub bearer_token: Option<String>,
}

/// Execute one deployment to completion, persisting progress as it goes.
pub async fn run_deployment(
    job: DeployJob,
    store: &DeploymentStore,
    workload_dir: &Path,
    http: &reqwest::Client,
    attest: impl FnOnce() -> anyhow::Result<String>,
) {
    let mut deployment = match store.load(&job.deployment_id) {
        Some(deployment) => deployment,
        None => {
            error!("deployment {} vanished before start", job.deployment_id);
            return;
        }
    };

    deployment.status = DeploymentStatus::Deploying;
    if let Err(e) = store.save(&mut deployment) {
        error!("failed to persist deployment: {e:#}");
        return;
    }

    match execute(&job, workload_dir, http).await {
        Ok(log_tail) => {
            deployment.log_tail = Some(log_tail);
            match attest() {
                Ok(quote) => deployment.quote = Some(quote),
                Err(e) => tracing::warn!("post-deploy attestation failed: {e:#}"),
            }
            deployment.status = DeploymentStatus::Complete;
            info!("deployment {} complete", deployment.id);
        }
        Err(e) => {
            deployment.status = DeploymentStatus::Failed;
            deployment.error = Some(format!("{e:#}"));
            error!("deployment {} failed: {e:#}", deployment.id);
        }
    }
    if let Err(e) = store.save(&mut deployment) {
        error!("failed to persist deployment: {e:#}");
    }
}

async fn execute(
    job: &DeployJob,
    workload_dir: &Path,
    http: &reqwest::Client,
) -> anyhow::Result<String> {
    let archive = fetch_bundle(job, http).await?;

    let scratch = tempfile::tempdir().context("Failed to create scratch dir")?;
    extract_bundle(&archive, scratch.path())?;
    let compose_path = find_compose(scratch.path())?;

    let env_public = std::fs::read_to_string(scratch.path().join(".env.public")).ok();

    install_bundle(scratch.path(), workload_dir)?;
    write_env_files(workload_dir, env_public.as_deref(), job.private_env.as_deref())?;

    let rel_compose = compose_path
        .strip_prefix(scratch.path())
        .expect("compose found under scratch");
    run_compose_up(&workload_dir.join(rel_compose)).await
}

async fn fetch_bundle(job: &DeployJob, http: &reqwest::Client) -> anyhow::Result<Vec<u8>> {
    if let Some(bundle_b64) = &job.bundle_b64 {
        return base64::engine::general_purpose::STANDARD
            .decode(bundle_b64)
            .context("Bad inline bundle encoding");
    }
    let artifact_id = job
        .bundle_artifact_id
        .context("Deploy request has neither an inline bundle nor an artifact id")?;

    let url = format!(
        "https://api.github.com/repos/{}/actions/artifacts/{artifact_id}/zip",
        job.repo,
    );
    let mut request = http
        .get(&url)
        .header("Accept", "application/vnd.github+json")
        .header("X-GitHub-Api-Version", "2022-11-28")
        .header("User-Agent", "easy-enclave-agent");
    if let Some(token) = &job.bearer_token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.context("Artifact download failed")?;
    if !response.status().is_success() {
        bail!("artifact download returned http {}", response.status().as_u16());
    }
    Ok(response.bytes().await?.to_vec())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn zip_bundle(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, contents) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn tar_bundle(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            let name_bytes = name.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn zip_roundtrip() {
        let archive = zip_bundle(&[
            ("docker-compose.yml", "services: {}"),
            ("conf/app.toml", "name = 'demo'"),
        ]);
        let dest = tempfile::tempdir().unwrap();
        extract_bundle(&archive, dest.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.path().join("conf/app.toml")).unwrap(),
            "name = 'demo'",
        );
        let compose = find_compose(dest.path()).unwrap();
        assert_eq!(compose, dest.path().join("docker-compose.yml"));
    }

    #[test]
    fn traversal_entry_fails_whole_extraction() {
        let archive = tar_bundle(&[
            ("docker-compose.yml", "services: {}"),
            ("../etc/passwd", "root::0:0::/:/bin/sh"),
        ]);
        let parent = tempfile::tempdir().unwrap();
        let dest = parent.path().join("extract");
        let err = extract_bundle(&archive, &dest).unwrap_err();
        assert!(err.to_string().contains("escapes extraction root"), "{err:#}");
        // Nothing landed outside the destination root.
        assert!(!parent.path().join("etc/passwd").exists());
        assert!(!Path::new("/etc/passwd2").exists());
    }

    #[test]
    fn multiple_composes_without_root_is_ambiguous() {
        let archive = zip_bundle(&[
            ("a/docker-compose.yml", "services: {}"),
            ("b/docker-compose.yml", "services: {}"),
        ]);
        let dest = tempfile::tempdir().unwrap();
        extract_bundle(&archive, dest.path()).unwrap();
        let err = find_compose(dest.path()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bundle has multiple docker-compose files and no root compose",
        );
    }

    #[test]
    fn root_compose_wins_among_many() {
        let archive = zip_bundle(&[
            ("docker-compose.yml", "services: {}"),
            ("vendor/docker-compose.yml", "services: {}"),
        ]);
        let dest = tempfile::tempdir().unwrap();
        extract_bundle(&archive, dest.path()).unwrap();
        assert_eq!(
            find_compose(dest.path()).unwrap(),
            dest.path().join("docker-compose.yml"),
        );
    }

    #[test]
    fn missing_compose_is_an_error() {
        let archive = zip_bundle(&[("README.md", "hello")]);
        let dest = tempfile::tempdir().unwrap();
        extract_bundle(&archive, dest.path()).unwrap();
        let err = find_compose(dest.path()).unwrap_err();
        assert_eq!(err.to_string(), "Bundle missing docker-compose.yml");
    }

    #[test]
    fn env_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write_env_files(dir.path(), Some("PUBLIC=1"), Some("SECRET=2")).unwrap();

        let combined = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(combined, "PUBLIC=1\nSECRET=2");
        let mode = std::fs::metadata(dir.path().join(".env.private"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn store_roundtrip_is_atomic_and_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentStore::new(dir.path());
        let mut deployment =
            Deployment::new("abc123".to_owned(), "acme/app".to_owned(), Some(7));
        store.save(&mut deployment).unwrap();

        let loaded = store.load("abc123").unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Pending);
        assert_eq!(loaded.bundle_artifact_id, Some(7));

        assert!(store.load("../../../etc/passwd").is_none());
        assert!(store.load("missing").is_none());
    }
}
