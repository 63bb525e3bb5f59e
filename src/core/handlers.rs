//! Side effects of each transition.
//!
//! Every handler may be re-run after a crash or a failed guard, so each one
//! checks what is already done before acting: existing repositories,
//! snapshots, staged copies and archives are all accepted as-is.

use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Timeouts;
use crate::context::AppContext;
use crate::core::error::{OrchestratorError, Result};
use crate::core::executor::{CommandOutput, CommandRequest, ensure_success, quote};
use crate::core::models::{Host, Job, SourceType, TransferMetrics};
use crate::core::repository::{
    ALREADY_INITIALIZED, ARCHIVE_EXISTS, Input, RepositoryDriver, parse_borg_stats,
    parse_restic_stats, parse_rsync_stats,
};
use crate::core::snapshot::{ImageInfo, ImageService};
use crate::core::staging::{self, Checksum};
use crate::core::state_machine::{JobContext, Transition};
use crate::core::transport;
use crate::logging::LogThrottle;

#[derive(Clone)]
pub struct Handlers {
    ctx: AppContext,
}

impl Handlers {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, transition: Transition, job: &mut Job, jc: &JobContext) -> Result<()> {
        match transition {
            Transition::Start => self.start(job, jc).await,
            Transition::Dump => self.dump(job, jc).await,
            Transition::Download => self.download(job, jc).await,
            Transition::Upload => self.upload(job, jc).await,
            Transition::Cleanup => self.cleanup(job, jc).await,
            Transition::Backuped => {
                self.ctx.audit.info(job, "Backup complete").await;
                Ok(())
            }
            Transition::Failed => Ok(()),
        }
    }

    fn images(&self) -> ImageService<'_> {
        ImageService::new(self.ctx.executor.as_ref(), &self.ctx.config)
    }

    fn driver<'a>(&'a self, jc: &'a JobContext) -> RepositoryDriver<'a> {
        RepositoryDriver::new(
            &jc.repository,
            jc.template.sub_path.as_deref(),
            &self.ctx.config.tools,
        )
    }

    async fn exec(&self, request: CommandRequest) -> (CommandRequest, CommandOutput) {
        let output = self.ctx.executor.run(request.clone()).await;
        (request, output)
    }

    fn host<'a>(jc: &'a JobContext, operation: &'static str) -> Result<&'a Host> {
        jc.host
            .as_ref()
            .ok_or(OrchestratorError::UnsupportedTemplateType {
                operation,
                source_type: jc.template.source_type,
            })
    }

    fn source_command<'a>(jc: &'a JobContext, operation: &'static str) -> Result<&'a str> {
        jc.template
            .source_command()
            .ok_or(OrchestratorError::UnsupportedTemplateType {
                operation,
                source_type: jc.template.source_type,
            })
    }

    async fn start(&self, job: &mut Job, jc: &JobContext) -> Result<()> {
        let driver = self.driver(jc);
        let timeout = Timeouts::of(self.ctx.config.timeouts.repository_init);
        let Some(request) = driver.init_request(timeout) else {
            return Ok(());
        };

        let (request, output) = self.exec(request).await;
        let output = ensure_success(&request, output, &[&*ALREADY_INITIALIZED])?;

        let message = if output.success {
            format!("Initialized repository {}", driver.location())
        } else {
            format!("Repository {} already initialized", driver.location())
        };
        self.ctx.audit.info(job, message).await;
        Ok(())
    }

    async fn dump(&self, job: &mut Job, jc: &JobContext) -> Result<()> {
        let template = &jc.template;

        match template.source_type {
            SourceType::VmSnapshot => {
                let name = job.snapshot_name(template);
                let images = self.images();

                if let Some(info) = images.find(&name).await? {
                    self.ctx
                        .audit
                        .info(job, format!("Snapshot {} already exists ({})", name, info.status))
                        .await;
                    return Ok(());
                }

                let instance = template.vm_instance.as_deref().ok_or(
                    OrchestratorError::UnsupportedTemplateType {
                        operation: "dump",
                        source_type: template.source_type,
                    },
                )?;

                images.create(instance, &name).await?;
                self.ctx
                    .audit
                    .info(job, format!("Requested snapshot {} of instance {}", name, instance))
                    .await;
                Ok(())
            }
            t if t.is_streamed() => {
                self.ctx
                    .audit
                    .debug(job, "Nothing to prepare, source is streamed during download")
                    .await;
                Ok(())
            }
            source_type => Err(OrchestratorError::UnsupportedTemplateType {
                operation: "dump",
                source_type,
            }),
        }
    }

    async fn download(&self, job: &mut Job, jc: &JobContext) -> Result<()> {
        match jc.template.source_type {
            SourceType::VmSnapshot => self.download_snapshot(job, jc).await,
            t if t.is_streamed() => self.download_stream(job, jc).await,
            source_type => Err(OrchestratorError::UnsupportedTemplateType {
                operation: "download",
                source_type,
            }),
        }
    }

    /// Poll until the image reports its id, checksum and size.
    async fn wait_for_image(&self, job: &Job, name: &str) -> Result<ImageInfo> {
        let config = &self.ctx.config.snapshot;
        let interval = Duration::from_secs(config.poll_interval_secs);
        let throttle = LogThrottle::new(Duration::from_secs(60));
        let images = self.images();

        for attempt in 1..=config.poll_attempts.max(1) {
            match images.find(name).await? {
                Some(info) if info.is_active() && info.size.is_some() && info.checksum.is_some() => {
                    return Ok(info);
                }
                status => {
                    if throttle.should_log() {
                        info!(
                            job_id = %job.id,
                            snapshot = %name,
                            attempt,
                            status = status.as_ref().map(|i| i.status.as_str()).unwrap_or("missing"),
                            "Waiting for snapshot details"
                        );
                    }
                }
            }
            tokio::time::sleep(interval).await;
        }

        Err(OrchestratorError::command(
            "image show",
            format!(
                "snapshot {} not ready after {} attempts",
                name, config.poll_attempts
            ),
        ))
    }

    async fn download_snapshot(&self, job: &mut Job, jc: &JobContext) -> Result<()> {
        let template = &jc.template;
        let name = job.snapshot_name(template);
        let info = self.wait_for_image(job, &name).await?;

        job.snapshot_id = Some(info.id.clone());
        job.checksum = info
            .checksum
            .as_deref()
            .map(|c| Checksum::Md5(c.to_ascii_lowercase()).to_string());
        job.raw_size = info.size.unwrap_or_default();
        job.updated_at = self.ctx.clock.now();
        self.ctx.store.save(job).await?;

        let path = staging::staged_path(&self.ctx.config.staging_directory, template, job);
        if self.staged_copy_matches(job, &path).await? {
            self.ctx
                .audit
                .info(
                    job,
                    format!("Staged copy {} already matches snapshot, skipping transfer", path.display()),
                )
                .await;
            return Ok(());
        }

        staging::prepare_dir(&path).await?;
        self.images().save(&info.id, &path).await?;

        let size = staging::staged_size(&path).await?.unwrap_or(0);
        if size != job.raw_size {
            return Err(OrchestratorError::command(
                "image save",
                format!("downloaded {} bytes, snapshot has {}", size, job.raw_size),
            ));
        }

        self.ctx
            .audit
            .info(job, format!("Downloaded snapshot {} ({} bytes)", info.id, size))
            .await;
        Ok(())
    }

    /// Whether the staged file already has the recorded size and checksum.
    async fn staged_copy_matches(&self, job: &Job, path: &Path) -> Result<bool> {
        if job.raw_size == 0 || staging::staged_size(path).await? != Some(job.raw_size) {
            return Ok(false);
        }

        let Some(expected) = job.checksum.as_deref().and_then(Checksum::parse) else {
            return Ok(false);
        };

        let actual = match expected {
            Checksum::Md5(_) => {
                let request = CommandRequest::new(
                    "md5sum",
                    format!(
                        "{} {}",
                        quote(&self.ctx.config.tools.md5sum),
                        quote(&path.to_string_lossy())
                    ),
                    Timeouts::of(self.ctx.config.timeouts.checksum),
                );
                let (request, output) = self.exec(request).await;
                let output = ensure_success(&request, output, &[])?;
                let hex = output.stdout.split_whitespace().next().unwrap_or_default();
                Checksum::Md5(hex.to_ascii_lowercase())
            }
            Checksum::Blake3(_) => staging::blake3_file(path).await?,
        };

        debug!(job_id = %job.id, expected = %expected, actual = %actual, "Compared staged checksum");
        Ok(actual == expected)
    }

    async fn download_stream(&self, job: &mut Job, jc: &JobContext) -> Result<()> {
        let template = &jc.template;
        let host = Self::host(jc, "download")?;
        let command = Self::source_command(jc, "download")?;

        let remote = match template.source_type {
            SourceType::RemoteFsCopy => format!("tar -cf - {}", quote(command)),
            _ => command.to_string(),
        };

        let path = staging::staged_path(&self.ctx.config.staging_directory, template, job);
        let partial = path.with_file_name(format!(
            "{}.part",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));
        staging::prepare_dir(&path).await?;

        let line = format!(
            "set -o pipefail; {} | gzip -c > {part} && mv {part} {}",
            transport::remote_command(&self.ctx.config.tools.ssh, host, &remote),
            quote(&path.to_string_lossy()),
            part = quote(&partial.to_string_lossy()),
        );
        let request = CommandRequest::new(
            format!("{} over ssh", template.source_type),
            line,
            Timeouts::of(self.ctx.config.timeouts.source_dump),
        );

        let (request, output) = self.exec(request).await;
        if let Err(e) = ensure_success(&request, output, &[]) {
            if let Err(rm) = staging::remove_staged(&partial).await {
                self.ctx
                    .audit
                    .warning(job, format!("Could not remove partial dump: {:#}", rm))
                    .await;
            }
            return Err(e);
        }

        let size = staging::staged_size(&path).await?.unwrap_or(0);
        if size < template.min_artifact_size {
            staging::remove_staged(&path).await?;
            return Err(OrchestratorError::command(
                request.label,
                format!(
                    "artifact is {} bytes, below the minimum of {}",
                    size, template.min_artifact_size
                ),
            ));
        }

        let checksum = staging::blake3_file(&path).await?;
        job.raw_size = size;
        job.checksum = Some(checksum.to_string());
        job.updated_at = self.ctx.clock.now();
        self.ctx.store.save(job).await?;

        self.ctx
            .audit
            .info(job, format!("Staged {} ({} bytes) from {}", path.display(), size, host.hostname))
            .await;
        Ok(())
    }

    async fn upload(&self, job: &mut Job, jc: &JobContext) -> Result<()> {
        let template = &jc.template;
        let driver = self.driver(jc);
        let timeout = Timeouts::of(self.ctx.config.timeouts.upload);
        let ssh = &self.ctx.config.tools.ssh;

        let metrics = if template.source_type == SourceType::ReadOnlyDedupMirror {
            let host = Self::host(jc, "upload")?;
            let path = Self::source_command(jc, "upload")?;
            let request = driver.mirror_request(
                &transport::rsync_shell(ssh, host),
                &transport::rsync_source(host, path),
                timeout,
            )?;
            let (request, output) = self.exec(request).await;
            let output = ensure_success(&request, output, &[])?;
            parse_rsync_stats(&output.stdout)?
        } else {
            let input = match template.source_type {
                SourceType::SftpCopy => {
                    let host = Self::host(jc, "upload")?;
                    let path = Self::source_command(jc, "upload")?;
                    Input::Pipeline(transport::remote_command(
                        ssh,
                        host,
                        &format!("cat {}", quote(path)),
                    ))
                }
                _ => Input::File(
                    staging::staged_path(&self.ctx.config.staging_directory, template, job)
                        .to_string_lossy()
                        .into_owned(),
                ),
            };

            let archive = job.archive_name(template);
            let stdin_name = format!("{}.{}", template.slug, template.extension());
            let tags = [
                ("template", template.slug.as_str()),
                ("source", template.source_type.as_str()),
            ];

            let request = driver.upload_request(&input, &archive, &stdin_name, &tags, timeout)?;
            let (request, output) = self.exec(request).await;
            let output = ensure_success(&request, output, &[&*ARCHIVE_EXISTS])?;

            if !output.success {
                self.ctx
                    .audit
                    .info(job, format!("Archive {} already exists, not uploading again", archive))
                    .await;
            }
            self.upload_metrics(&driver, &archive, output).await?
        };

        job.metrics = Some(metrics);
        self.ctx
            .audit
            .info(
                job,
                format!(
                    "Uploaded to {}: {} bytes, {} bytes after deduplication",
                    driver.location(),
                    metrics.transferred_size,
                    metrics.deduplicated_size
                ),
            )
            .await;
        Ok(())
    }

    async fn upload_metrics(
        &self,
        driver: &RepositoryDriver<'_>,
        archive: &str,
        output: CommandOutput,
    ) -> Result<TransferMetrics> {
        let timeout = Timeouts::of(self.ctx.config.timeouts.snapshot_query);

        if let Some(request) = driver.stats_request(timeout) {
            let (request, stats) = self.exec(request).await;
            let stats = ensure_success(&request, stats, &[])?;
            return parse_restic_stats(&output.stdout, &stats.stdout);
        }

        if output.success {
            return parse_borg_stats(&output.stdout);
        }

        match driver.archive_info_request(archive, timeout) {
            Some(request) => {
                let (request, info) = self.exec(request).await;
                let info = ensure_success(&request, info, &[])?;
                parse_borg_stats(&info.stdout)
            }
            None => Err(OrchestratorError::command("upload", "no statistics available")),
        }
    }

    /// Prune the repository, drop the staged file, delete the snapshot.
    ///
    /// All three steps are attempted even if an earlier one fails; the first
    /// error is returned.
    pub async fn cleanup(&self, job: &Job, jc: &JobContext) -> Result<()> {
        let pruned = self.prune(job, jc).await;
        let released = self.release_artifacts(job, jc).await;
        pruned.and(released)
    }

    async fn prune(&self, job: &Job, jc: &JobContext) -> Result<()> {
        let template = &jc.template;
        let driver = self.driver(jc);
        let timeout = Timeouts::of(self.ctx.config.timeouts.prune);
        let Some(request) = driver.prune_request(&template.slug, &template.retention, timeout) else {
            return Ok(());
        };

        let (request, output) = self.exec(request).await;
        ensure_success(&request, output, &[])?;
        self.ctx
            .audit
            .info(
                job,
                format!(
                    "Pruned {} archives (keep daily {}, weekly {})",
                    template.slug, template.retention.keep_daily, template.retention.keep_weekly
                ),
            )
            .await;
        Ok(())
    }

    /// Drop the job's staged file and delete its snapshot, whichever exist.
    ///
    /// Both steps are attempted; the first error is returned.
    pub async fn release_artifacts(&self, job: &Job, jc: &JobContext) -> Result<()> {
        let template = &jc.template;
        let mut first_error: Option<OrchestratorError> = None;

        if template.source_type.stages_locally() {
            let path = staging::staged_path(&self.ctx.config.staging_directory, template, job);
            match staging::remove_staged(&path).await {
                Ok(true) => {
                    self.ctx
                        .audit
                        .info(job, format!("Removed staged artifact {}", path.display()))
                        .await
                }
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }

        if template.source_type.is_snapshot() {
            let name = job.snapshot_name(template);
            let images = self.images();
            let deleted = match images.find(&name).await {
                Ok(Some(info)) => images.delete(&info.id).await.map(|_| Some(info.id)),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            match deleted {
                Ok(Some(id)) => {
                    self.ctx
                        .audit
                        .info(job, format!("Deleted snapshot {} ({})", name, id))
                        .await
                }
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
