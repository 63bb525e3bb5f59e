//! VM image operations through the cloud CLI.

use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;

use crate::config::{AppConfig, Timeouts};
use crate::core::error::{OrchestratorError, Result};
use crate::core::executor::{CommandExecutor, CommandRequest, ensure_success, quote};

static IMAGE_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no image (found|with a name or id)|could not find resource|image \S+ could not be found")
        .expect("valid regex")
});

pub const STATUS_ACTIVE: &str = "active";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ImageInfo {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ImageInfo {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

pub struct ImageService<'a> {
    executor: &'a dyn CommandExecutor,
    config: &'a AppConfig,
}

impl<'a> ImageService<'a> {
    pub fn new(executor: &'a dyn CommandExecutor, config: &'a AppConfig) -> Self {
        Self { executor, config }
    }

    fn request(&self, label: &str, args: &str, timeout: u64) -> CommandRequest {
        CommandRequest::new(
            label,
            format!("{} {}", quote(&self.config.tools.openstack), args),
            Timeouts::of(timeout),
        )
        .envs(self.config.snapshot.environment.clone())
    }

    /// Look an image up by name or id. `None` when it does not exist.
    pub async fn find(&self, name: &str) -> Result<Option<ImageInfo>> {
        let req = self.request(
            "image show",
            &format!("image show -f json {}", quote(name)),
            self.config.timeouts.snapshot_query,
        );
        let output = self.executor.run(req.clone()).await;

        if !output.success && IMAGE_NOT_FOUND.is_match(&output.stderr) {
            return Ok(None);
        }

        let output = ensure_success(&req, output, &[])?;
        serde_json::from_str(&output.stdout)
            .map(Some)
            .map_err(|e| OrchestratorError::command("image show", format!("malformed output: {}", e)))
    }

    pub async fn create(&self, instance: &str, name: &str) -> Result<()> {
        let req = self.request(
            "server image create",
            &format!("server image create --name {} {}", quote(name), quote(instance)),
            self.config.timeouts.snapshot_create,
        );
        let output = self.executor.run(req.clone()).await;
        ensure_success(&req, output, &[])?;
        Ok(())
    }

    pub async fn save(&self, image_id: &str, path: &Path) -> Result<()> {
        let req = self.request(
            "image save",
            &format!(
                "image save --file {} {}",
                quote(&path.to_string_lossy()),
                quote(image_id)
            ),
            self.config.timeouts.snapshot_download,
        );
        let output = self.executor.run(req.clone()).await;
        ensure_success(&req, output, &[])?;
        Ok(())
    }

    pub async fn delete(&self, image_id: &str) -> Result<()> {
        let req = self.request(
            "image delete",
            &format!("image delete {}", quote(image_id)),
            self.config.timeouts.snapshot_delete,
        );
        let output = self.executor.run(req.clone()).await;
        ensure_success(&req, output, &[&*IMAGE_NOT_FOUND])?;
        Ok(())
    }
}
