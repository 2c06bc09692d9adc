use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Command-line interface of the sitepub publisher.
#[derive(Parser, Debug, Clone)]
#[command(name = "sitepub")]
#[command(about = "Publish a rendered static site to object storage")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Mirror the site directory to a publish target
    Publish(PublishArgs),

    /// Upload, verify and delete a random file to check a target works
    TestTarget(TestTargetArgs),

    /// Copy static assets into an output directory
    Collect(CollectArgs),
}

/// Where publish targets are read from.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Name of the publish target
    #[arg(default_value = "default", env = "SITEPUB_TARGET")]
    pub target: String,

    /// JSON file mapping target names to their options
    #[arg(long, default_value = "sitepub.json", env = "SITEPUB_CONFIG")]
    pub config: PathBuf,

    /// Do not ask for confirmation
    #[arg(long, env = "SITEPUB_FORCE")]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Rendered site directory to publish
    #[arg(long, env = "SITEPUB_SITE_DIR")]
    pub site_dir: PathBuf,

    /// Copy static assets into the site directory before publishing
    #[arg(long, env = "SITEPUB_COLLECT_ASSETS", requires = "static_dir")]
    pub collect_assets: bool,

    /// Static assets directory, used with --collect-assets
    #[arg(long, env = "SITEPUB_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Path of the static assets inside the site directory
    #[arg(long, default_value = "static", env = "SITEPUB_STATIC_PREFIX")]
    pub static_prefix: String,

    /// Only log warnings and errors
    #[arg(long, short, env = "SITEPUB_QUIET")]
    pub quiet: bool,

    /// Do not fetch uploads back through their public URL
    #[arg(long, env = "SITEPUB_SKIP_VERIFY")]
    pub skip_verify: bool,

    /// Upload every file and never delete remote files
    #[arg(long, env = "SITEPUB_IGNORE_REMOTE_CONTENT")]
    pub ignore_remote_content: bool,

    /// Number of concurrent uploads and deletes
    #[arg(long, env = "SITEPUB_PARALLEL", value_parser = clap::value_parser!(u16).range(1..))]
    pub parallel: Option<u16>,

    /// Additional directory name to leave out (repeatable)
    #[arg(long = "exclude", value_name = "NAME")]
    pub exclude: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct TestTargetArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CollectArgs {
    /// Static assets directory
    #[arg(long, env = "SITEPUB_STATIC_DIR")]
    pub static_dir: PathBuf,

    /// Destination directory
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Additional directory name to leave out (repeatable)
    #[arg(long = "exclude", value_name = "NAME")]
    pub exclude: Vec<String>,
}

impl Command {
    /// Whether the operator asked for warnings only.
    pub fn quiet(&self) -> bool {
        matches!(self, Command::Publish(args) if args.quiet)
    }
}
