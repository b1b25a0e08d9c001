use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for pinto.
#[derive(Debug, Parser)]
#[command(name = "pinto")]
#[command(about = "Build and run Python projects and pipelines in isolated environments", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Log debug output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Also write logs to this file")]
    pub log_file: Option<PathBuf>,

    #[arg(short, long, default_value = ".", help = "Project or pipeline directory")]
    pub project: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Create the project's environment and install the project into it")]
    Build {
        #[arg(short, long, help = "Reinstall even if the project is already installed")]
        force: bool,

        #[arg(short = 'E', long = "extras", help = "Extra to install, may be repeated")]
        extras: Vec<String>,
    },

    #[command(about = "Run a command in a project's environment, or execute a pipeline")]
    Run {
        #[arg(short, long, help = "Variable file to apply while running")]
        environment: Option<PathBuf>,

        #[arg(
            trailing_var_arg = true,
            allow_hyphen_values = true,
            help = "Command and arguments to run"
        )]
        args: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_keeps_trailing_arguments() {
        let cli = Cli::parse_from([
            "pinto", "-p", "lib", "run", "-e", "vars.env", "testme", "--name", "thom",
        ]);
        assert_eq!(cli.project, PathBuf::from("lib"));
        match cli.command {
            Commands::Run { environment, args } => {
                assert_eq!(environment, Some(PathBuf::from("vars.env")));
                assert_eq!(args, ["testme", "--name", "thom"]);
            }
            Commands::Build { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_build() {
        let cli = Cli::parse_from(["pinto", "-v", "build", "-f", "-E", "extra", "--extras", "gpu"]);
        assert!(cli.verbose);
        assert_eq!(cli.project, PathBuf::from("."));
        match cli.command {
            Commands::Build { force, extras } => {
                assert!(force);
                assert_eq!(extras, ["extra", "gpu"]);
            }
            Commands::Run { .. } => panic!("expected build"),
        }
    }
}
