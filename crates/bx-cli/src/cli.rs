use std::path::PathBuf;

use bx_domain::BundleState;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "bx",
    author,
    version,
    about = "Inspect and drive a persistent bundle cache",
    disable_help_subcommand = true
)]
pub struct BxCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(
        long,
        value_name = "DIR",
        help = "Cache root to operate on (overrides BX_CACHE_PATH)",
        global = true
    )]
    pub cache_root: Option<PathBuf>,
    #[command(subcommand)]
    pub command: BxCommand,
}

#[derive(Subcommand, Debug)]
pub enum BxCommand {
    /// List every archive in the cache.
    Scan,
    /// Create an archive with its first revision.
    Install(ReviseArgs),
    /// Append a revision to an archive.
    Update(ReviseArgs),
    /// Drop the newest revision of an archive.
    Undo(IdArgs),
    /// Keep only the newest revision and advance the generation.
    Purge(IdArgs),
    /// Show archive state and the current manifest.
    Show(IdArgs),
    /// Change persisted archive state.
    Set(SetArgs),
    /// List entries of a revision's content.
    Entries(EntriesArgs),
    /// Resolve the Bundle-ClassPath of the current revision.
    Classpath(IdArgs),
    /// Extract a native library and print its path.
    NativeLibrary(EntryArgs),
    /// Show signer chains of the current revision.
    Signers(SignersArgs),
    /// Resolve a path in an archive's data area (id 0 is the system bundle).
    DataFile(EntryArgs),
    /// Delete one archive.
    Remove(IdArgs),
    /// Delete the whole cache root.
    Delete,
}

#[derive(Args, Debug)]
pub struct IdArgs {
    #[arg(value_name = "ID")]
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ReviseArgs {
    #[arg(value_name = "ID")]
    pub id: i64,
    #[arg(
        value_name = "LOCATION",
        help = "reference:file:<path>, inputstream:, or a URL"
    )]
    pub location: String,
    #[arg(
        long,
        value_name = "FILE",
        help = "Read the bundle content from FILE instead of the location"
    )]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    #[arg(value_name = "ID")]
    pub id: i64,
    #[arg(long, value_enum)]
    pub state: Option<StateArg>,
    #[arg(long, allow_negative_numbers = true)]
    pub start_level: Option<i32>,
    #[arg(long, value_name = "MILLIS")]
    pub last_modified: Option<i64>,
}

#[derive(Args, Debug)]
pub struct EntriesArgs {
    #[arg(value_name = "ID")]
    pub id: i64,
    #[arg(long, value_name = "INDEX", help = "Revision index (defaults to the newest)")]
    pub revision: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EntryArgs {
    #[arg(value_name = "ID")]
    pub id: i64,
    #[arg(value_name = "NAME")]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct SignersArgs {
    #[arg(value_name = "ID")]
    pub id: i64,
    #[arg(long, help = "Include chains that are not trusted")]
    pub all: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum StateArg {
    Installed,
    Active,
    Uninstalled,
}

impl From<StateArg> for BundleState {
    fn from(value: StateArg) -> Self {
        match value {
            StateArg::Installed => BundleState::Installed,
            StateArg::Active => BundleState::Active,
            StateArg::Uninstalled => BundleState::Uninstalled,
        }
    }
}
