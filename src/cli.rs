use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Sentinel monitor supervisor")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<String>,

    /// Sub‑commands (serve, run, check)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Speak newline-delimited JSON on stdin/stdout (default if no sub‑command)
    Serve,
    /// Monitor one user in the foreground until interrupted
    Run {
        /// User the monitor runs for
        #[arg(long)]
        user_id: String,
    },
    /// Print elevation, admin policy and the resolved monitor invocation
    Check,
}
