//! `bnd-lua` command: writes the Lua binding headers described by a config.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Generate Lua binding glue from C++ declarations.
#[derive(Parser, Debug)]
#[command(name = "bnd-lua", version, about)]
struct Cli {
    /// Config listing the declaration files and patches.
    #[arg(default_value = "bnd-lua.toml")]
    config: PathBuf,

    /// Directory to write `include/LuaBindings/` under instead of `[output] dir`.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bnd_lua=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let written = bnd_lua::run(&cli.config, cli.output.as_deref())?;
    tracing::info!(dir = %written.display(), "bindings up to date");
    Ok(())
}
