mod run;

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub enum Cli {
    /// Run the client daemon, see `run --help` for more information.
    Run(RunArgs),
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Path to the configuration file.
    #[clap(long, short, default_value = "slskd.toml")]
    pub config: PathBuf,

    /// Connect to the server immediately.
    #[clap(long, default_value_t = true)]
    pub connect: bool,
}

impl Cli {
    pub fn exec(self) -> eyre::Result<()> {
        match self {
            Self::Run(args) => run::run(args),
        }
    }
}

pub fn run() -> eyre::Result<()> {
    Cli::parse().exec()
}
