use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandDescriptor, CommandEnv, CommandHandler, DispatchContext};

pub fn commands() -> Vec<CommandDescriptor> {
    vec![CommandDescriptor::new("help", Arc::new(Help))
        .aliases(&["menu", "commands"])
        .usage("help [command]")
        .description("List available commands")]
}

struct Help;

#[async_trait]
impl CommandHandler for Help {
    async fn execute(&self, ctx: &DispatchContext, env: &CommandEnv) -> anyhow::Result<()> {
        let prefix = env.settings.snapshot().await.prefix;

        let text = match ctx.args.first() {
            Some(name) => match env.registry.lookup(name) {
                Some(d) => describe_one(&prefix, &d),
                None => format!("❌ Unknown command: {name}\n\nType {prefix}help for the list."),
            },
            None => describe_all(&prefix, env),
        };

        env.reply(ctx, text)?;
        Ok(())
    }
}

fn describe_all(prefix: &str, env: &CommandEnv) -> String {
    let mut out = String::from("📖 *Commands*\n");
    for d in env.registry.descriptors() {
        let lock = if d.admin_only { " 🔒" } else { "" };
        out.push_str(&format!("\n• {prefix}{}{lock}", d.usage));
        if !d.description.is_empty() {
            out.push_str(&format!("\n  {}", d.description));
        }
    }
    out.push_str(&format!(
        "\n\n🔒 = admin only\nType {prefix}help <command> for details."
    ));
    out
}

fn describe_one(prefix: &str, d: &CommandDescriptor) -> String {
    let mut out = format!("ℹ️ *{prefix}{}*\n\nUsage: {prefix}{}", d.name, d.usage);
    if !d.description.is_empty() {
        out.push_str(&format!("\n{}", d.description));
    }
    if !d.aliases.is_empty() {
        let aliases: Vec<String> = d.aliases.iter().map(|a| format!("{prefix}{a}")).collect();
        out.push_str(&format!("\nAliases: {}", aliases.join(", ")));
    }
    if d.admin_only {
        out.push_str("\nAdmin only.");
    }
    out
}
