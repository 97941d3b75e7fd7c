use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "foreman",
    about = "Supervised execution of coding-agent work plans",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a plan with a supervised agent subprocess
    Run {
        /// Plan context: inline text, or a path to a file to read it from
        context: String,

        /// Plan identifier (defaults to the context file stem or a fresh id)
        #[arg(long)]
        plan_id: Option<String>,

        /// Plan title shown to monitors (defaults to the first context line)
        #[arg(long)]
        plan_title: Option<String>,

        /// Path to the full plan document the agent can consult
        #[arg(long)]
        plan_path: Option<PathBuf>,

        /// Execution mode: normal, simple, tdd, review, or bare
        #[arg(long)]
        mode: Option<String>,

        /// Override the default agent backend
        #[arg(long)]
        agent: Option<String>,

        /// Drive implement/test/review as discrete role invocations instead
        /// of one orchestrating process
        #[arg(long)]
        roles: bool,

        /// Output capture: none, result, or all
        #[arg(long, default_value = "result")]
        capture: String,
    },

    /// Attach to a running session's relay socket as an operator console
    Attach {
        /// Tunnel socket path logged by the session's relay root
        socket: PathBuf,
    },

    /// Show project configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_flags() {
        let cli = Cli::parse_from([
            "foreman",
            "run",
            "plans/p-4.md",
            "--mode",
            "tdd",
            "--roles",
            "-v",
        ]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Run {
                context,
                mode,
                roles,
                capture,
                ..
            } => {
                assert_eq!(context, "plans/p-4.md");
                assert_eq!(mode.as_deref(), Some("tdd"));
                assert!(roles);
                assert_eq!(capture, "result");
            }
            _ => panic!("expected run command"),
        }
    }
}
