use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mediadrop")]
#[command(author, version, about = "Telegram bot that turns a media link into a delivered file", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the bot with long polling
    Run,

    /// Print the format catalog extracted for a URL, without Telegram
    Info {
        /// Media URL to inspect
        url: String,
    },

    /// Print the completed downloads of an owner
    History {
        /// Telegram chat id of the owner
        owner: i64,

        /// Maximum number of entries
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
