use clap::{Parser, Subcommand};

/// ledgerline — personal-finance aggregation and analytics backend.
#[derive(Parser)]
#[command(name = "ledgerline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run database migrations against `DATABASE_PATH` and exit.
    Migrate,

    /// Start the HTTP API and the scheduled background jobs.
    Serve,

    /// Run one scheduled job immediately, then exit (for manual ops/cron).
    RunJob {
        /// Job name, e.g. "dailySnapshot" (see the scheduler's job table).
        job: String,
    },
}
