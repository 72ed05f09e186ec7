use actor_migrate::{cli::CLI, initializers::init_tracing};
use clap::Parser;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let CLI { opts, command } = CLI::parse();

    init_tracing(&opts)?;

    command.unwrap_or_default().run(&opts).await
}
