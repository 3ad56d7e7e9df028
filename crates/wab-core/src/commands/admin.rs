//! Owner/admin commands. The router enforces the admin gate before these run.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Local;
use serde_json::json;
use tracing::info;

use super::{CommandDescriptor, CommandEnv, CommandHandler, DispatchContext};
use crate::settings::{write_json_atomic, Mode};

pub fn commands() -> Vec<CommandDescriptor> {
    vec![
        CommandDescriptor::new("mode", Arc::new(SetMode))
            .admin_only()
            .usage("mode <private|public>")
            .description("Change bot mode (private/public)"),
        CommandDescriptor::new("antidelete", Arc::new(AntiDelete))
            .admin_only()
            .usage("antidelete <on|off>")
            .description("Toggle anti-delete feature"),
        CommandDescriptor::new("backup", Arc::new(Backup))
            .admin_only()
            .usage("backup")
            .description("Backup bot configuration"),
    ]
}

struct SetMode;

#[async_trait]
impl CommandHandler for SetMode {
    async fn execute(&self, ctx: &DispatchContext, env: &CommandEnv) -> anyhow::Result<()> {
        let current = env.settings.snapshot().await;
        let Some(arg) = ctx.args.first() else {
            env.reply(
                ctx,
                format!(
                    "ℹ️ Current bot mode: *{}*\n\nUsage: {}mode <private/public>",
                    current.mode.as_str(),
                    current.prefix
                ),
            )?;
            return Ok(());
        };

        let Some(mode) = Mode::parse(arg) else {
            env.reply(ctx, "❌ Invalid mode. Use \"private\" or \"public\".")?;
            return Ok(());
        };

        env.settings
            .update(|s| {
                s.mode = mode;
                s.restrict_to_admins = mode == Mode::Private;
            })
            .await
            .context("saving bot mode")?;
        info!(mode = mode.as_str(), sender = %ctx.sender_id, "bot mode changed");

        let text = match mode {
            Mode::Private => {
                "🔒 Bot is now in *Private Mode*\nOnly bot owner and admins can use commands."
            }
            Mode::Public => "🌐 Bot is now in *Public Mode*\nEveryone can use bot commands.",
        };
        env.reply(ctx, format!("✅ {text}"))?;
        Ok(())
    }
}

struct AntiDelete;

#[async_trait]
impl CommandHandler for AntiDelete {
    async fn execute(&self, ctx: &DispatchContext, env: &CommandEnv) -> anyhow::Result<()> {
        let Some(arg) = ctx.args.first() else {
            let s = env.settings.snapshot().await;
            let status = if s.anti_delete { "ON" } else { "OFF" };
            env.reply(
                ctx,
                format!(
                    "ℹ️ Anti-delete is currently: *{status}*\n\nUsage: {}antidelete <on/off>",
                    s.prefix
                ),
            )?;
            return Ok(());
        };

        let on = matches!(arg.to_lowercase().as_str(), "on" | "true" | "enable");
        env.settings
            .update(|s| s.anti_delete = on)
            .await
            .context("saving anti-delete setting")?;
        info!(anti_delete = on, sender = %ctx.sender_id, "anti-delete toggled");

        let text = if on {
            "🛡️ Anti-delete is now *ENABLED*"
        } else {
            "🚫 Anti-delete is now *DISABLED*"
        };
        env.reply(ctx, format!("✅ {text}"))?;
        Ok(())
    }
}

struct Backup;

#[async_trait]
impl CommandHandler for Backup {
    async fn execute(&self, ctx: &DispatchContext, env: &CommandEnv) -> anyhow::Result<()> {
        let now = Local::now();
        let settings = env.settings.snapshot().await;
        let cfg = &env.config;

        // Credentials and owner identities stay out of the backup.
        let snapshot = json!({
            "createdAt": now.to_rfc3339(),
            "settings": settings,
            "config": {
                "sidecarUrl": cfg.sidecar_url,
                "authDir": cfg.auth_dir,
                "storageDir": cfg.storage_dir,
                "settingsFile": cfg.settings_file,
                "sendIntervalMs": cfg.send_interval.as_millis() as u64,
                "reconnectDelayMs": cfg.reconnect_delay.as_millis() as u64,
                "ignoreSelfMessages": cfg.ignore_self_messages,
                "mediaDownloadLimit": cfg.media_download_limit,
            },
        });

        let filename = format!("bot-backup-{}.json", now.format("%Y-%m-%d"));
        let path = cfg.storage_dir.join(&filename);
        write_json_atomic(&path, &snapshot)
            .with_context(|| format!("writing backup to {}", path.display()))?;
        info!(path = %path.display(), "configuration backup written");

        env.reply(
            ctx,
            format!(
                "💾 *Bot Configuration Backup*\n\n📅 Date: {}\n📁 Backup saved as: {filename}",
                now.format("%Y-%m-%d %H:%M:%S")
            ),
        )?;
        Ok(())
    }
}
