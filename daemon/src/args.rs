use clap::{ArgAction, Parser};
use pkgbuilderd_common::ReviewStatus;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Verbose logging
    #[arg(short, long, global = true, action(ArgAction::Count))]
    pub verbose: u8,
    /// Configuration file path
    #[arg(short, long, env = "PKGBUILDERD_CONFIG")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Debug, Parser)]
pub enum SubCommand {
    /// Start the transaction workers
    Run,
    /// Queue a transaction for one or more packages
    Enqueue(Enqueue),
    /// Record the review result of a build
    Review(Review),
    /// Reconcile a repository with its package index
    SyncRepo(SyncRepo),
    /// Print the order a batch of packages would be built in
    BuildOrder(BuildOrder),
    /// Load and print the config
    CheckConfig,
}

#[derive(Debug, Parser)]
pub struct Enqueue {
    #[arg(required = true)]
    pub packages: Vec<String>,
    /// Who requested this transaction
    #[arg(long)]
    pub initiated_by: Option<String>,
    /// Run the transaction right away instead of leaving it to the workers
    #[arg(long)]
    pub now: bool,
}

#[derive(Debug, Parser)]
pub struct Review {
    pub bnum: i64,
    pub reviewer: String,
    /// passed, failed or skip
    pub result: ReviewStatus,
}

#[derive(Debug, Parser)]
pub struct SyncRepo {
    pub repo: String,
    /// Defaults to every configured architecture
    pub arch: Option<String>,
}

#[derive(Debug, Parser)]
pub struct BuildOrder {
    /// Local checkout of the recipe tree
    #[arg(long)]
    pub checkout: PathBuf,
    #[arg(required = true)]
    pub packages: Vec<String>,
}
