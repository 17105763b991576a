//! Update handler tree
//!
//! The same tree is used by the production dispatcher and by tests that
//! feed it synthetic updates.

use std::sync::Arc;

use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::Message;

use super::commands::{Command, WELCOME};
use super::flow::DownloadFlow;
use super::Bot;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub flow: Arc<DownloadFlow>,
}

impl HandlerDeps {
    pub fn new(flow: Arc<DownloadFlow>) -> Self {
        Self { flow }
    }
}

pub fn schema(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    let deps_commands = deps.clone();
    let deps_messages = deps.clone();
    let deps_callback = deps;

    dptree::entry()
        .branch(command_handler(deps_commands))
        .branch(message_handler(deps_messages))
        .branch(callback_handler(deps_callback))
}

fn command_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message().branch(dptree::entry().filter_command::<Command>().endpoint(
        move |bot: Bot, msg: Message, cmd: Command| {
            let deps = deps.clone();
            async move {
                log::info!("🎯 Received command: {:?} from chat {}", cmd, msg.chat.id);
                match cmd {
                    Command::Start | Command::Help => {
                        bot.send_message(msg.chat.id, WELCOME).await?;
                    }
                    Command::History => {
                        if let Err(e) = deps.flow.history(msg.chat.id.0).await {
                            log::error!("History for {} failed: {}", msg.chat.id, e);
                        }
                    }
                }
                Ok(())
            }
        },
    ))
}

/// Private text messages: links and `/restore_<id>`
fn message_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message()
        .filter(|msg: Message| msg.chat.is_private() && msg.text().is_some())
        .endpoint(move |msg: Message| {
            let deps = deps.clone();
            async move {
                let owner = msg.chat.id.0;
                let text = msg.text().unwrap_or_default();
                log::debug!("Message from {}: {}", owner, text);
                if let Err(e) = deps.flow.handle_text(owner, text).await {
                    log::error!("Handling message from {} failed: {}", owner, e);
                }
                Ok(())
            }
        })
}

fn callback_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_callback_query().endpoint(move |bot: Bot, q: CallbackQuery| {
        let deps = deps.clone();
        async move {
            let (Some(message), Some(data)) = (q.message.as_ref(), q.data.as_deref()) else {
                bot.answer_callback_query(q.id.clone()).await?;
                return Ok(());
            };
            let owner = message.chat().id.0;
            let message_id = message.id().0;
            if let Err(e) = deps.flow.handle_callback(owner, &q.id.0, message_id, data).await {
                log::error!("Callback {:?} from {} failed: {}", data, owner, e);
            }
            Ok(())
        }
    })
}
