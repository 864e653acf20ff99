//! Docker image builds from a local source directory.
//!
//! The build context (Dockerfile plus any files it references) is bundled
//! into a tarball and streamed to the Docker daemon, the same way the Docker
//! CLI does it. The daemon's progress stream is scanned for an error line.

use std::path::Path;
use std::time::Duration;

use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures_util::StreamExt;

use crate::error::RuntimeError;

/// Upper bound on a single image build.
const BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Build the image found at `src_dir` and tag it as `tag`.
///
/// Returns an error if the directory cannot be tarred, the daemon reports a
/// build error, or the build exceeds [`BUILD_TIMEOUT`].
pub(crate) async fn build_image(
    docker: &Docker,
    src_dir: &Path,
    tag: &str,
) -> Result<(), RuntimeError> {
    let context = tar_build_context(src_dir).map_err(|e| RuntimeError::ImageBuild {
        tag: tag.to_string(),
        reason: format!("could not tar build context {}: {e}", src_dir.display()),
    })?;

    let options = BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        t: tag.to_string(),
        rm: true,
        ..Default::default()
    };

    let build = async {
        let mut stream = docker.build_image(options, None, Some(context.into()));
        while let Some(update) = stream.next().await {
            let info = update.map_err(|e| RuntimeError::ImageBuild {
                tag: tag.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(error) = info.error {
                return Err(RuntimeError::ImageBuild {
                    tag: tag.to_string(),
                    reason: error,
                });
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(tag, "build: {line}");
                }
            }
        }
        Ok(())
    };

    tokio::time::timeout(BUILD_TIMEOUT, build)
        .await
        .map_err(|_| RuntimeError::ImageBuild {
            tag: tag.to_string(),
            reason: format!("build did not finish within {BUILD_TIMEOUT:?}"),
        })?
}

/// Bundle `src_dir` into an in-memory tarball usable as a build context.
fn tar_build_context(src_dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", src_dir)?;
    archive.into_inner()
}
