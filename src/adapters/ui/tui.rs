//! Interactive entry point. Inquire-based prompts for one archive run.
//!
//! Cyberpunk/Neon theme: prompt prefix [?], colored accents.

use crate::domain::{DomainError, RunReport};
use crate::ports::{CoordinatorPort, RunRequest};
use inquire::ui::{Color, RenderConfig, StyleSheet, Styled};
use inquire::{set_global_render_config, Confirm, Text};

/// Neon Purple (#bc13fe) for prompt prefix and accents.
const NEON_PURPLE: Color = Color::Rgb { r: 0xbc, g: 0x13, b: 0xfe };
/// Cyber Green (#0ff0fc) for help text.
const CYBER_GREEN: Color = Color::Rgb { r: 0x0f, g: 0xf0, b: 0xfc };

/// Applies the global Cyberpunk/Neon RenderConfig for inquire prompts.
pub(crate) fn apply_theme() {
    let config = RenderConfig::default_colored()
        .with_prompt_prefix(Styled::new("[?] ").with_fg(NEON_PURPLE))
        .with_answered_prompt_prefix(Styled::new("tg-archiver> ").with_fg(NEON_PURPLE))
        .with_help_message(StyleSheet::default().with_fg(CYBER_GREEN));
    set_global_render_config(config);
}

/// Prompts for a channel handle and id range, runs the archive, and returns
/// the end-of-run report (spec §2, §7). The destination channel for
/// uploads, if any, comes from config rather than a prompt here.
pub async fn run(coordinator: &dyn CoordinatorPort) -> Result<RunReport, DomainError> {
    let channel_handle = Text::new("Channel handle (without @):")
        .with_help_message("The source channel to archive, e.g. somechannel")
        .prompt()
        .map_err(|e| DomainError::Config(e.to_string()))?;

    let start_id = Text::new("Start message id:")
        .prompt()
        .map_err(|e| DomainError::Config(e.to_string()))?
        .parse::<i32>()
        .map_err(|e| DomainError::Config(format!("invalid start id: {}", e)))?;

    let end_id = Text::new("End message id:")
        .with_help_message("Inclusive; must be >= start id")
        .prompt()
        .map_err(|e| DomainError::Config(e.to_string()))?
        .parse::<i32>()
        .map_err(|e| DomainError::Config(format!("invalid end id: {}", e)))?;

    if end_id < start_id {
        return Err(DomainError::Config("end id must be >= start id".into()));
    }

    let confirmed = Confirm::new(&format!(
        "Archive messages {}..={} from @{}?",
        start_id, end_id, channel_handle
    ))
    .with_default(true)
    .prompt()
    .map_err(|e| DomainError::Config(e.to_string()))?;

    if !confirmed {
        return Err(DomainError::Config("run cancelled".into()));
    }

    coordinator
        .run(RunRequest { channel_handle, start_id, end_id })
        .await
}
