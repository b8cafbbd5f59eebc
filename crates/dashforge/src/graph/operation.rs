// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Build operations - the smallest executable units of a build graph.
//!
//! An [`Operation`] is a tagged variant over the four executable kinds
//! (image, exec, filesystem, metadata) plus [`Operation::Unknown`], which is
//! never executable and exists so dispatch can refuse explicitly instead of
//! silently succeeding. Every operation carries [`OperationMetadata`] with a
//! [`RetryPolicy`] - the only operation-level knob persisted in the IR - and
//! yields a stable [`content_digest`](Operation::content_digest).

use crate::digest::{Digest, DigestWriter};
use crate::graph::environment::{Environment, User};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Discriminator for the operation variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Image,
    Exec,
    Filesystem,
    Metadata,
    Unknown,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Image => "image",
            OperationKind::Exec => "exec",
            OperationKind::Filesystem => "filesystem",
            OperationKind::Metadata => "metadata",
            OperationKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Bounded exponential backoff for operation retries.
///
/// Before retry `k` (1-based) the scheduler waits
/// `min(initial_delay * backoff_multiplier^(k-1), max_delay)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of execution attempts, including the first.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the `retry`-th retry (1-based), capped at `max_delay`.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.backoff_multiplier.powi(exponent as i32);
        let delay = self.initial_delay.mul_f64(factor.max(0.0));
        delay.min(self.max_delay)
    }
}

/// Where in the build definition an operation originated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// Metadata carried by every operation. None of it participates in the
/// operation's content digest: retry budgets and descriptions are runtime
/// concerns, not identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Explicit human-readable description; overrides the derived rendering.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_location: Option<SourceLocation>,
}

/// Where a base image comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    /// A registry reference such as `docker.io/library/alpine:3.20`.
    Registry(String),
    /// The empty filesystem.
    Scratch,
    /// A local OCI layout directory.
    OciLayout(PathBuf),
    /// A local tarball.
    Tarball(PathBuf),
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Registry(reference) => f.write_str(reference),
            ImageSource::Scratch => f.write_str("scratch"),
            ImageSource::OciLayout(path) => write!(f, "oci-layout:{}", path.display()),
            ImageSource::Tarball(path) => write!(f, "tarball:{}", path.display()),
        }
    }
}

/// Realizes a stage's starting filesystem state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageOperation {
    pub source: ImageSource,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

/// A command to execute, with its own environment overlay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<User>,
}

impl Command {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_arguments<S: Into<String>>(mut self, arguments: impl IntoIterator<Item = S>) -> Self {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    /// Shell-style rendering: executable followed by arguments.
    pub fn display_line(&self) -> String {
        if self.arguments.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.arguments.join(" "))
        }
    }
}

/// A mount made available to an exec operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Runs a command against the stage's current filesystem state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecOperation {
    pub command: Command,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Extra environment applied on top of the context environment but under
    /// the command's own overlay.
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

/// Reference to another build stage, as written in `COPY --from=...`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageRef {
    /// By stage name (or id).
    Named(String),
    /// By zero-based position in the graph.
    Index(usize),
    /// The stage immediately preceding the current one.
    Previous,
}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageRef::Named(name) => f.write_str(name),
            StageRef::Index(index) => write!(f, "{index}"),
            StageRef::Previous => f.write_str("previous"),
        }
    }
}

/// Where the payload of a filesystem operation comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemSource {
    /// A path inside the build context.
    Context(String),
    /// Paths from another stage's final snapshot.
    Stage { stage: StageRef, paths: Vec<String> },
    /// Paths from an image not otherwise part of the build.
    Image { reference: String, paths: Vec<String> },
    Url(String),
    Git { remote: String, reference: String },
    /// Literal file content.
    Inline(Vec<u8>),
    /// No source; the operation creates content from nothing.
    Scratch,
}

impl FilesystemSource {
    /// Short rendering used in operation descriptions.
    fn display_fragment(&self) -> String {
        match self {
            FilesystemSource::Context(path) => path.clone(),
            FilesystemSource::Stage { stage, paths } => {
                format!("--from={} {}", stage, paths.join(" "))
            }
            FilesystemSource::Image { reference, paths } => {
                format!("--from={} {}", reference, paths.join(" "))
            }
            FilesystemSource::Url(url) => url.clone(),
            FilesystemSource::Git { remote, reference } => format!("{remote}#{reference}"),
            FilesystemSource::Inline(bytes) => format!("<inline {} bytes>", bytes.len()),
            FilesystemSource::Scratch => "scratch".to_string(),
        }
    }
}

/// The filesystem mutation to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemAction {
    Copy,
    Add,
    Remove,
    Mkdir,
    Symlink,
    Hardlink,
}

impl FilesystemAction {
    /// Instruction-style rendering.
    pub fn keyword(&self) -> &'static str {
        match self {
            FilesystemAction::Copy => "COPY",
            FilesystemAction::Add => "ADD",
            FilesystemAction::Remove => "REMOVE",
            FilesystemAction::Mkdir => "MKDIR",
            FilesystemAction::Symlink => "SYMLINK",
            FilesystemAction::Hardlink => "HARDLINK",
        }
    }
}

/// Ownership applied to created filesystem entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOwnership {
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group: Option<String>,
}

/// Applies a filesystem action using a resolved [`FilesystemSource`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilesystemOperation {
    pub action: FilesystemAction,
    pub source: FilesystemSource,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ownership: Option<FileOwnership>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub permissions: Option<u32>,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

/// Container healthcheck configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// A mutation of the image config or execution context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataAction {
    Env { key: String, value: String },
    WorkingDirectory(String),
    User(User),
    Entrypoint(Vec<String>),
    Cmd(Vec<String>),
    Label { key: String, value: String },
    Arg { name: String, default: Option<String> },
    Expose(String),
    StopSignal(String),
    Healthcheck(HealthcheckConfig),
    Shell(Vec<String>),
    Volume(String),
    OnBuild(String),
}

/// Mutates the stage's image config, environment, working directory, or user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataOperation {
    pub action: MetadataAction,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

/// The smallest executable unit of a build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Image(ImageOperation),
    Exec(ExecOperation),
    Filesystem(FilesystemOperation),
    Metadata(MetadataOperation),
    /// Never executable; dispatch refuses it explicitly.
    Unknown,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Image(_) => OperationKind::Image,
            Operation::Exec(_) => OperationKind::Exec,
            Operation::Filesystem(_) => OperationKind::Filesystem,
            Operation::Metadata(_) => OperationKind::Metadata,
            Operation::Unknown => OperationKind::Unknown,
        }
    }

    pub fn metadata(&self) -> Option<&OperationMetadata> {
        match self {
            Operation::Image(op) => Some(&op.metadata),
            Operation::Exec(op) => Some(&op.metadata),
            Operation::Filesystem(op) => Some(&op.metadata),
            Operation::Metadata(op) => Some(&op.metadata),
            Operation::Unknown => None,
        }
    }

    pub fn metadata_mut(&mut self) -> Option<&mut OperationMetadata> {
        match self {
            Operation::Image(op) => Some(&mut op.metadata),
            Operation::Exec(op) => Some(&mut op.metadata),
            Operation::Filesystem(op) => Some(&mut op.metadata),
            Operation::Metadata(op) => Some(&mut op.metadata),
            Operation::Unknown => None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.metadata()
            .map(|m| m.retry_policy.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        if let Some(metadata) = self.metadata_mut() {
            metadata.retry_policy = policy;
        }
        self
    }

    /// Single-line human rendering, instruction-style. An explicit
    /// description in the metadata wins over the derived form.
    pub fn describe(&self) -> String {
        if let Some(description) = self.metadata().and_then(|m| m.description.as_deref()) {
            return description.to_string();
        }
        match self {
            Operation::Image(op) => format!("FROM {}", op.source),
            Operation::Exec(op) => format!("RUN {}", op.command.display_line()),
            Operation::Filesystem(op) => format!(
                "{} {} {}",
                op.action.keyword(),
                op.source.display_fragment(),
                op.destination
            ),
            Operation::Metadata(op) => match &op.action {
                MetadataAction::Env { key, value } => format!("ENV {key}={value}"),
                MetadataAction::WorkingDirectory(dir) => format!("WORKDIR {dir}"),
                MetadataAction::User(user) => format!("USER {user}"),
                MetadataAction::Entrypoint(parts) => format!("ENTRYPOINT {}", parts.join(" ")),
                MetadataAction::Cmd(parts) => format!("CMD {}", parts.join(" ")),
                MetadataAction::Label { key, value } => format!("LABEL {key}={value}"),
                MetadataAction::Arg { name, default } => match default {
                    Some(default) => format!("ARG {name}={default}"),
                    None => format!("ARG {name}"),
                },
                MetadataAction::Expose(port) => format!("EXPOSE {port}"),
                MetadataAction::StopSignal(signal) => format!("STOPSIGNAL {signal}"),
                MetadataAction::Healthcheck(config) => {
                    format!("HEALTHCHECK CMD {}", config.test.join(" "))
                }
                MetadataAction::Shell(parts) => format!("SHELL {}", parts.join(" ")),
                MetadataAction::Volume(path) => format!("VOLUME {path}"),
                MetadataAction::OnBuild(instruction) => format!("ONBUILD {instruction}"),
            },
            Operation::Unknown => "UNKNOWN".to_string(),
        }
    }

    /// Stable content digest. Semantically equal operations yield equal
    /// digests; [`OperationMetadata`] (description, retry policy, source
    /// location) is excluded so a retry-budget tweak does not invalidate
    /// cached results.
    pub fn content_digest(&self) -> Digest {
        let mut writer = DigestWriter::new();
        writer.field("kind", &self.kind().to_string());
        match self {
            Operation::Image(op) => {
                match &op.source {
                    ImageSource::Registry(reference) => writer.field("registry", reference),
                    ImageSource::Scratch => writer.field("scratch", ""),
                    ImageSource::OciLayout(path) => {
                        writer.field("oci-layout", &path.to_string_lossy())
                    }
                    ImageSource::Tarball(path) => writer.field("tarball", &path.to_string_lossy()),
                };
            }
            Operation::Exec(op) => {
                writer.field("executable", &op.command.executable);
                writer.list_field("arguments", &op.command.arguments);
                writer.list_field("command-env", &op.command.environment.to_lines());
                writer.optional_field("cwd", op.command.working_directory.as_deref());
                writer.optional_field(
                    "user",
                    op.command.user.as_ref().map(|u| u.to_string()).as_deref(),
                );
                writer.list_field("env", &op.environment.to_lines());
                for mount in &op.mounts {
                    writer.field(
                        "mount",
                        &format!("{}:{}:{}", mount.source, mount.target, mount.readonly),
                    );
                }
            }
            Operation::Filesystem(op) => {
                writer.field("action", op.action.keyword());
                match &op.source {
                    FilesystemSource::Context(path) => writer.field("context", path),
                    FilesystemSource::Stage { stage, paths } => {
                        writer.field("stage", &stage.to_string());
                        writer.list_field("paths", paths)
                    }
                    FilesystemSource::Image { reference, paths } => {
                        writer.field("image", reference);
                        writer.list_field("paths", paths)
                    }
                    FilesystemSource::Url(url) => writer.field("url", url),
                    FilesystemSource::Git { remote, reference } => {
                        writer.field("git-remote", remote);
                        writer.field("git-ref", reference)
                    }
                    FilesystemSource::Inline(bytes) => writer.raw(bytes),
                    FilesystemSource::Scratch => writer.field("scratch", ""),
                };
                writer.field("destination", &op.destination);
                writer.optional_field(
                    "ownership",
                    op.ownership
                        .as_ref()
                        .map(|o| match &o.group {
                            Some(group) => format!("{}:{}", o.user, group),
                            None => o.user.clone(),
                        })
                        .as_deref(),
                );
                writer.optional_field(
                    "permissions",
                    op.permissions.map(|p| format!("{p:o}")).as_deref(),
                );
            }
            Operation::Metadata(op) => {
                // serde_json over enums with ordered fields is deterministic.
                let encoded = serde_json::to_string(&op.action).unwrap_or_default();
                writer.field("metadata-action", &encoded);
            }
            Operation::Unknown => {
                writer.field("unknown", "");
            }
        }
        writer.finish()
    }

    // Convenience constructors used by front-ends and tests.

    pub fn image(source: ImageSource) -> Self {
        Operation::Image(ImageOperation {
            source,
            metadata: OperationMetadata::default(),
        })
    }

    pub fn from_registry(reference: impl Into<String>) -> Self {
        Self::image(ImageSource::Registry(reference.into()))
    }

    pub fn from_scratch() -> Self {
        Self::image(ImageSource::Scratch)
    }

    pub fn run(executable: impl Into<String>, arguments: Vec<String>) -> Self {
        Operation::Exec(ExecOperation {
            command: Command::new(executable).with_arguments(arguments),
            mounts: Vec::new(),
            environment: Environment::new(),
            metadata: OperationMetadata::default(),
        })
    }

    pub fn copy(source: FilesystemSource, destination: impl Into<String>) -> Self {
        Operation::Filesystem(FilesystemOperation {
            action: FilesystemAction::Copy,
            source,
            destination: destination.into(),
            ownership: None,
            permissions: None,
            metadata: OperationMetadata::default(),
        })
    }

    pub fn copy_from_context(path: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::copy(FilesystemSource::Context(path.into()), destination)
    }

    pub fn copy_from_stage(
        stage: StageRef,
        paths: Vec<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self::copy(FilesystemSource::Stage { stage, paths }, destination)
    }

    pub fn env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Operation::Metadata(MetadataOperation {
            action: MetadataAction::Env {
                key: key.into(),
                value: value.into(),
            },
            metadata: OperationMetadata::default(),
        })
    }

    pub fn workdir(dir: impl Into<String>) -> Self {
        Operation::Metadata(MetadataOperation {
            action: MetadataAction::WorkingDirectory(dir.into()),
            metadata: OperationMetadata::default(),
        })
    }
}
