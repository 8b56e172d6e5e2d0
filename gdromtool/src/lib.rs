use argp::FromArgs;

pub mod cmd;
pub(crate) mod util;

// Re-export gdrom
pub use gdrom;

#[derive(FromArgs, Debug)]
#[argp(subcommand)]
pub enum SubCommand {
    Build(cmd::build::Args),
    Extract(cmd::extract::Args),
    Info(cmd::info::Args),
}

pub fn run(command: SubCommand) -> gdrom::Result<()> {
    match command {
        SubCommand::Build(c_args) => cmd::build::run(c_args),
        SubCommand::Extract(c_args) => cmd::extract::run(c_args),
        SubCommand::Info(c_args) => cmd::info::run(c_args),
    }
}
