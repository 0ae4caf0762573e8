use anyhow::Result;
use clap::Parser;
use tcp_tunnel::{
    cli::{Cli, Command},
    client, logging, server,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;

    match cli.command {
        Command::Client(args) => client::run(args.into_config()?).await,
        Command::Server(args) => server::run(args.load_config()?).await,
    }
}
