use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "revchat",
    about = "OpenAI-compatible gateway over session-cookie chat back-ends"
)]
pub struct Cli {
    /// Configuration file (TOML); missing file falls back to defaults plus
    /// REVCHAT_* environment variables.
    #[arg(long, env = "REVCHAT_CONFIG", default_value = "revchat.toml")]
    pub config: String,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Outbound proxy URL for all upstream traffic.
    #[arg(long)]
    pub proxy: Option<String>,

    /// Directory for persisted credential state.
    #[arg(long)]
    pub state_dir: Option<String>,
}
