//! Bot commands

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

use super::Bot;

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "I can do this:")]
pub enum Command {
    #[command(description = "how to use the bot")]
    Start,
    #[command(description = "show this help")]
    Help,
    #[command(description = "your recent downloads")]
    History,
}

pub const WELCOME: &str = "👋 Send me a link to a video, track or image and I'll fetch it for you.\n\n\
You pick the type and quality, I send the file. /history lists what you've downloaded.";

/// Registers the command list shown in the Telegram UI.
pub async fn setup_bot_commands(bot: &Bot) -> Result<(), teloxide::RequestError> {
    bot.set_my_commands(Command::bot_commands()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_lowercase_commands() {
        assert_eq!(Command::parse("/history", "mediadrop_bot").unwrap(), Command::History);
        assert_eq!(Command::parse("/start", "mediadrop_bot").unwrap(), Command::Start);
        assert!(Command::parse("/restore_12", "mediadrop_bot").is_err());
    }

    #[test]
    fn every_command_is_described() {
        let names: Vec<String> = Command::bot_commands()
            .into_iter()
            .map(|c| c.command.trim_start_matches('/').to_string())
            .collect();
        assert_eq!(names, vec!["start", "help", "history"]);
    }
}
