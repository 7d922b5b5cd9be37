//! Cairn - main entry point.

use cairn::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    let config = cli.into_config();
    config.validate()?;

    cairn::run(config).await?;
    Ok(())
}
