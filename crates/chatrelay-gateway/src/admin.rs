use chatrelay_core::{AdminCommand, AdminConfig, BotConfig, TurnOrchestrator};
use chatrelay_schema::ConversationId;

/// Runs one admin command and returns the reply text.
pub async fn run_command(
    orchestrator: &TurnOrchestrator,
    admin: &AdminConfig,
    bot: &BotConfig,
    conversation_id: &ConversationId,
    command: AdminCommand,
    argument: &str,
) -> String {
    match command {
        AdminCommand::Help => help_text(orchestrator, admin, bot, conversation_id).await,
        AdminCommand::ClearChat => match orchestrator.sessions().reset(conversation_id).await {
            Ok(_) => "Done: conversation memory cleared".to_string(),
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "clear_chat could not delete the remote session");
                "Done: conversation memory cleared (remote cleanup failed)".to_string()
            }
        },
        AdminCommand::LoadPreset => {
            if argument.is_empty() {
                return "Usage: load_preset <preset name>".to_string();
            }
            match orchestrator.presets().get(argument) {
                Some(preset) => {
                    orchestrator
                        .sessions()
                        .set_preset(conversation_id, preset.name.clone())
                        .await;
                    format!("Done: preset {} loaded", preset.name)
                }
                None => format!("Cannot load preset {argument}"),
            }
        }
        AdminCommand::ResetPreset => {
            orchestrator.sessions().clear_preset(conversation_id).await;
            "Done: preset reset".to_string()
        }
        AdminCommand::ListPreset => {
            let lines: Vec<String> = orchestrator
                .presets()
                .iter()
                .map(|p| format!("{}: {}", p.name, p.description))
                .collect();
            format!("Available presets:\n{}", lines.join("\n"))
        }
        AdminCommand::ChatId => format!("Conversation id: {conversation_id}"),
    }
}

pub async fn help_text(
    orchestrator: &TurnOrchestrator,
    admin: &AdminConfig,
    bot: &BotConfig,
    conversation_id: &ConversationId,
) -> String {
    let assigned = orchestrator.sessions().preset_for(conversation_id).await;
    let preset = orchestrator.presets().resolve(assigned.as_deref());
    let prefix = if bot.single_chat_prefix.is_empty() {
        "(no prefix needed)".to_string()
    } else {
        bot.single_chat_prefix.join(", ")
    };
    let voice = if bot.group_voice_msg { "yes" } else { "no" };

    let mut lines = vec![
        "# Help".to_string(),
        format!("Model: {}", orchestrator.driver().model()),
        format!("Single chat prefix: {prefix}"),
        format!("Answer group voice messages: {voice}"),
        format!("Active preset: {}", preset.name),
        "## Admin commands:".to_string(),
    ];
    for (command, keyword) in &admin.commands {
        lines.push(format!("{keyword} {}", command.description()));
    }
    lines.push("## Enabled tools:".to_string());
    let tools = orchestrator.driver().tools().names();
    lines.push(if tools.is_empty() {
        "(none)".to_string()
    } else {
        tools.join(", ")
    });
    lines.join("\n")
}
