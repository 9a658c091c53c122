use std::path::PathBuf;

use clap::Parser;

/// patcher - installs the localization text hook into a game's scripts module
#[derive(Debug, Parser)]
#[command(name = "patcher", version, about, long_about = None)]
pub struct Cli {
    /// Path to the game installation folder.
    #[arg(value_name = "GAME_FOLDER")]
    pub game_folder: PathBuf,

    /// Managed-scripts directory, relative to the game folder.
    #[arg(long, default_value = "Data/Managed", value_name = "REL_PATH")]
    pub managed_dir: PathBuf,

    /// File name of the scripts module to patch.
    #[arg(long, default_value = "GameScripts.cmm", value_name = "FILE")]
    pub assembly: String,

    /// Simple name of the hook module expected next to the scripts module.
    #[arg(long, default_value = "TextHook", value_name = "NAME")]
    pub hook: String,

    /// Resolve targets and report, but do not write the patched module.
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    pub verbose: bool,
}
