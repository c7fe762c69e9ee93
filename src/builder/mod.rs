//! Image builder: source detection, deterministic naming with
//! collision avoidance, and the tar-context build itself (spec §4.2).
//!
//! Grounded on a prior `environment/docker/container.rs` for the
//! bollard build/pull idiom (no teacher file actually drives a build
//! from a Dockerfile — the `build_image` call in `runtime::docker` is
//! inferred from that file's `CreateImageOptions`/`create_image`
//! streaming-message shape, noted in DESIGN.md) and on `tar`, already a
//! teacher dependency, for the context archive.

use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::Utc;

use crate::error::{AgentainerError, Result};
use crate::runtime::{AgentRuntime, ProgressSink};

const IMAGE_NAMESPACE: &str = "agentainer";
const EXCLUDED_ENTRIES: &[&str] = &[".git", "node_modules", "__pycache__"];

const RECOGNISED_DIRECTIVES: &[&str] = &["FROM ", "RUN ", "CMD ", "EXPOSE ", "ENV "];

/// `IsDockerfile(path)` (spec §4.2).
pub fn is_build_descriptor(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();
    if basename.starts_with("dockerfile") {
        return true;
    }

    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { return false };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let upper = trimmed.to_uppercase();
        return RECOGNISED_DIRECTIVES
            .iter()
            .any(|directive| upper.starts_with(directive));
    }
    false
}

/// `GenerateImageName(name)` (spec §4.2).
pub fn generate_image_name(name: &str, now: chrono::DateTime<Utc>) -> String {
    let sanitised = name
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .collect::<String>();
    let tag = now.format("%Y%m%d-%H%M%S");
    format!("{IMAGE_NAMESPACE}-{sanitised}:{tag}")
}

/// `PreventDuplicateImage` (spec §4.2). `now` is called fresh for each
/// collision attempt so retried timestamps differ.
pub async fn prevent_duplicate_image(
    candidate: &str,
    runtime: &dyn AgentRuntime,
    now: impl Fn() -> chrono::DateTime<Utc>,
) -> Result<String> {
    if !runtime
        .image_exists(candidate)
        .await
        .map_err(|e| AgentainerError::Build(e.to_string()))?
    {
        return Ok(candidate.to_string());
    }

    let base = candidate.split(':').next().unwrap_or(candidate);

    for i in 1..=10 {
        let attempt = format!("{base}:{}-v{i}", now().format("%Y%m%d-%H%M%S"));
        if !runtime
            .image_exists(&attempt)
            .await
            .map_err(|e| AgentainerError::Build(e.to_string()))?
        {
            return Ok(attempt);
        }
    }

    Err(AgentainerError::UniqueNameExhausted)
}

/// Builds a tar archive of `context_dir`, excluding VCS/dependency
/// directories, for use as a bollard build context.
fn build_context_tar(context_dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        add_dir_to_tar(&mut builder, context_dir, context_dir)?;
        builder.finish()?;
    }
    Ok(buf)
}

fn add_dir_to_tar<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if EXCLUDED_ENTRIES.contains(&name.as_ref()) {
            continue;
        }

        if path.is_dir() {
            add_dir_to_tar(builder, root, &path)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            builder.append_path_with_name(&path, relative)?;
        }
    }
    Ok(())
}

/// Builds an image from a descriptor at `descriptor_path`, named after
/// `agent_name`. Returns the tagged image reference.
pub async fn build(
    agent_name: &str,
    descriptor_path: &Path,
    runtime: &dyn AgentRuntime,
    sink: ProgressSink,
) -> Result<String> {
    if !is_build_descriptor(descriptor_path) {
        return Err(AgentainerError::InvalidSpec(format!(
            "{} is not a recognised build descriptor",
            descriptor_path.display()
        )));
    }

    let context_dir = descriptor_path
        .parent()
        .ok_or_else(|| AgentainerError::InvalidSpec("descriptor has no parent directory".into()))?;
    let dockerfile_name = descriptor_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AgentainerError::InvalidSpec("descriptor has no filename".into()))?
        .to_string();

    let candidate = generate_image_name(agent_name, Utc::now());
    let tag = prevent_duplicate_image(&candidate, runtime, Utc::now).await?;

    let context_tar = build_context_tar(context_dir)
        .map_err(|e| AgentainerError::Build(e.to_string()))?;

    runtime
        .build_image(context_tar, &dockerfile_name, &tag, sink)
        .await
        .map_err(|e| AgentainerError::Build(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dockerfile_named_file_is_recognised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dockerfile");
        std::fs::write(&path, "FROM alpine\n").unwrap();
        assert!(is_build_descriptor(&path));
    }

    #[test]
    fn non_dockerfile_name_with_directive_first_line_is_recognised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f, "FROM ubuntu:22.04").unwrap();
        assert!(is_build_descriptor(&path));
    }

    #[test]
    fn plain_text_file_is_not_a_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readme.txt");
        std::fs::write(&path, "hello world\n").unwrap();
        assert!(!is_build_descriptor(&path));
    }

    #[test]
    fn missing_file_is_not_a_descriptor() {
        let path = Path::new("/nonexistent/Dockerfile");
        assert!(!is_build_descriptor(path));
    }

    #[test]
    fn generated_name_matches_expected_shape() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let name = generate_image_name("My Agent", now);
        assert_eq!(name, "agentainer-my-agent:20240101-000000");
    }

    #[test]
    fn generated_name_is_deterministic() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        assert_eq!(
            generate_image_name("svc_one", now),
            generate_image_name("svc_one", now)
        );
    }

    struct FakeRuntime {
        existing: Vec<String>,
    }

    #[async_trait::async_trait]
    impl AgentRuntime for FakeRuntime {
        async fn build_image(
            &self,
            _context_tar: Vec<u8>,
            _dockerfile_name: &str,
            tag: &str,
            _sink: ProgressSink,
        ) -> crate::runtime::RuntimeResult<String> {
            Ok(tag.to_string())
        }

        async fn image_exists(&self, image: &str) -> crate::runtime::RuntimeResult<bool> {
            Ok(self.existing.contains(&image.to_string()))
        }

        async fn pull_image(&self, _image: &str) -> crate::runtime::RuntimeResult<()> {
            Ok(())
        }

        async fn create(
            &self,
            _spec: &crate::runtime::ContainerSpec,
        ) -> crate::runtime::RuntimeResult<String> {
            unimplemented!()
        }

        async fn start(&self, _container_id: &str) -> crate::runtime::RuntimeResult<()> {
            unimplemented!()
        }

        async fn stop(
            &self,
            _container_id: &str,
            _method: crate::runtime::StopMethod,
            _grace: std::time::Duration,
        ) -> crate::runtime::RuntimeResult<()> {
            unimplemented!()
        }

        async fn kill(&self, _container_id: &str) -> crate::runtime::RuntimeResult<()> {
            unimplemented!()
        }

        async fn inspect(
            &self,
            _container_id: &str,
        ) -> crate::runtime::RuntimeResult<crate::runtime::InspectResult> {
            unimplemented!()
        }

        async fn stats(&self, _container_id: &str) -> crate::runtime::RuntimeResult<crate::runtime::Stats> {
            unimplemented!()
        }

        async fn destroy(&self, _container_id: &str) -> crate::runtime::RuntimeResult<()> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn prevent_duplicate_returns_candidate_when_absent() {
        let runtime = FakeRuntime { existing: vec![] };
        let result = prevent_duplicate_image("agentainer-foo:20240101-000000", &runtime, Utc::now)
            .await
            .unwrap();
        assert_eq!(result, "agentainer-foo:20240101-000000");
    }

    #[tokio::test]
    async fn prevent_duplicate_appends_v1_on_collision() {
        let runtime = FakeRuntime {
            existing: vec!["agentainer-foo:20240101-000000".to_string()],
        };
        let result = prevent_duplicate_image("agentainer-foo:20240101-000000", &runtime, Utc::now)
            .await
            .unwrap();
        assert!(result.starts_with("agentainer-foo:"));
        assert!(result.ends_with("-v1"));
    }

    #[tokio::test]
    async fn prevent_duplicate_never_returns_an_existing_name() {
        let counter = AtomicUsize::new(0);
        let runtime = FakeRuntime {
            existing: vec!["agentainer-foo:ts".to_string()],
        };
        let result = prevent_duplicate_image("agentainer-foo:ts", &runtime, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            chrono::Utc::now() + chrono::Duration::seconds(n as i64)
        })
        .await
        .unwrap();
        assert!(!runtime.existing.contains(&result));
    }
}
