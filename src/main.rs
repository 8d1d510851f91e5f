mod gangway;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "gangway",
    version,
    about = "Gangway - reverse tunnel relay for exposing services behind NAT"
)]
struct Cli {
    /// Config file (.toml/.yaml/.yml). Falls back to GANGWAY_CONFIG, then gangway.toml > gangway.yaml > gangway.yml in the CWD, then the OS default path (Linux: /etc/gangway/gangway.toml).
    #[arg(long, env = "GANGWAY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    gangway::run(cli.config).await
}
