//! Command descriptors and the startup-time registry.

pub mod admin;
pub mod general;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::Config,
    domain::Jid,
    errors::Error,
    messaging::{queue::OutboundQueue, types::InboundMessage},
    settings::SettingsStore,
    Result,
};

/// Per-event data handed to exactly one handler invocation.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub raw_event: Arc<InboundMessage>,
    pub chat_id: Jid,
    pub sender_id: Jid,
    pub args: Vec<String>,
    pub is_from_self: bool,
}

/// Capabilities available to handlers.
#[derive(Clone)]
pub struct CommandEnv {
    pub queue: OutboundQueue,
    pub settings: Arc<SettingsStore>,
    pub registry: Arc<CommandRegistry>,
    pub config: Arc<Config>,
}

impl CommandEnv {
    /// Queue a text reply to the chat the command came from.
    pub fn reply(&self, ctx: &DispatchContext, text: impl Into<String>) -> Result<()> {
        self.queue.send_text(&ctx.chat_id, text)
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, ctx: &DispatchContext, env: &CommandEnv) -> anyhow::Result<()>;
}

/// Static registration record for one command.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub aliases: Vec<String>,
    pub admin_only: bool,
    pub usage: String,
    pub description: String,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandDescriptor {
    pub fn new(name: &str, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            admin_only: false,
            usage: name.to_string(),
            description: String::new(),
            handler,
        }
    }

    pub fn aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }

    pub fn usage(mut self, usage: &str) -> Self {
        self.usage = usage.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("admin_only", &self.admin_only)
            .finish_non_exhaustive()
    }
}

/// Registry keyed by lowercase name and alias. Names and aliases share one namespace.
#[derive(Debug)]
pub struct CommandRegistry {
    descriptors: Vec<Arc<CommandDescriptor>>,
    index: HashMap<String, usize>,
}

impl CommandRegistry {
    /// Fails on the first name/alias collision.
    pub fn new(descriptors: Vec<CommandDescriptor>) -> Result<Self> {
        let mut index = HashMap::new();
        let mut out = Vec::with_capacity(descriptors.len());

        for (pos, descriptor) in descriptors.into_iter().enumerate() {
            let keys = std::iter::once(&descriptor.name).chain(descriptor.aliases.iter());
            for key in keys {
                let key = key.trim().to_lowercase();
                if key.is_empty() || key.contains(char::is_whitespace) {
                    return Err(Error::Config(format!(
                        "invalid command name or alias {key:?} for {}",
                        descriptor.name
                    )));
                }
                if index.insert(key.clone(), pos).is_some() {
                    return Err(Error::DuplicateCommand(key));
                }
            }
            out.push(Arc::new(descriptor));
        }

        Ok(Self {
            descriptors: out,
            index,
        })
    }

    /// Case-insensitive lookup by name or alias.
    pub fn lookup(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        let idx = self.index.get(&name.to_lowercase())?;
        self.descriptors.get(*idx).cloned()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> &[Arc<CommandDescriptor>] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// All commands compiled into the bot.
pub fn builtin_commands() -> Vec<CommandDescriptor> {
    let mut all = general::commands();
    all.extend(admin::commands());
    all
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for handler tests.

    use super::*;
    use crate::{
        domain::MessageId,
        messaging::{
            port::MessageSender,
            queue::{OutboundQueue, QueueConfig},
            types::{MessageKind, OutboundPayload},
        },
        settings::Settings,
    };
    use std::{path::PathBuf, sync::Mutex, time::Duration};

    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<(Jid, OutboundPayload)>>,
    }

    impl RecordingSender {
        pub fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, p)| match p {
                    OutboundPayload::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, destination: &Jid, payload: &OutboundPayload) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.clone(), payload.clone()));
            Ok(())
        }
    }

    pub struct Fixture {
        pub env: CommandEnv,
        pub sender: Arc<RecordingSender>,
        pub dir: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    impl Fixture {
        /// Let the queue worker drain (call from paused-time tests).
        pub async fn drain(&self) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    pub fn fixture(name: &str, descriptors: Vec<CommandDescriptor>) -> Fixture {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = PathBuf::from(format!(
            "/tmp/wab-cmd-{name}-{}-{nanos}",
            std::process::id()
        ));
        let dir_str = dir.display().to_string();
        let config = Config::from_lookup(|key| match key {
            "STORAGE_DIR" => Some(dir_str.clone()),
            "AUTH_DIR" => Some(format!("{dir_str}/auth")),
            "OWNER_NUMBER" => Some("1555".to_string()),
            _ => None,
        })
        .unwrap();
        let settings =
            Arc::new(SettingsStore::load(&config.settings_file, Settings::default()).unwrap());

        let sender = Arc::new(RecordingSender::default());
        let (queue, _worker) = OutboundQueue::spawn(
            sender.clone(),
            QueueConfig {
                min_interval: Duration::from_millis(10),
            },
            None,
        );

        let env = CommandEnv {
            queue,
            settings,
            registry: Arc::new(CommandRegistry::new(descriptors).unwrap()),
            config: Arc::new(config),
        };
        Fixture { env, sender, dir }
    }

    pub fn message(chat: &str, sender: &str, text: &str) -> InboundMessage {
        InboundMessage {
            id: MessageId("MSG1".to_string()),
            chat: Jid::new(chat),
            sender: Jid::new(sender),
            from_me: false,
            push_name: None,
            kind: MessageKind::Text,
            text: Some(text.to_string()),
            quoted: None,
            timestamp: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn context(chat: &str, args: &[&str]) -> DispatchContext {
        let msg = message(chat, chat, "");
        DispatchContext {
            raw_event: Arc::new(msg),
            chat_id: Jid::new(chat),
            sender_id: Jid::new(chat),
            args: args.iter().map(|a| a.to_string()).collect(),
            is_from_self: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl CommandHandler for Noop {
        async fn execute(&self, _ctx: &DispatchContext, _env: &CommandEnv) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn play() -> CommandDescriptor {
        CommandDescriptor::new("play", Arc::new(Noop))
            .aliases(&["song", "music"])
            .usage("play <query>")
    }

    #[test]
    fn lookup_is_case_insensitive_and_alias_equivalent() {
        let reg = CommandRegistry::new(vec![play()]).unwrap();
        for key in ["PLAY", "song", "Music", "play"] {
            let d = reg.lookup(key).unwrap();
            assert_eq!(d.name, "play", "key {key}");
        }
        assert!(reg.lookup("video").is_none());
    }

    #[test]
    fn collisions_fail_fast() {
        let other = CommandDescriptor::new("audio", Arc::new(Noop)).aliases(&["Song"]);
        let err = CommandRegistry::new(vec![play(), other]).unwrap_err();
        assert!(matches!(err, Error::DuplicateCommand(ref k) if k == "song"));

        let dup_name = CommandDescriptor::new("PLAY", Arc::new(Noop));
        assert!(CommandRegistry::new(vec![play(), dup_name]).is_err());
    }

    #[test]
    fn rejects_names_with_whitespace() {
        let bad = CommandDescriptor::new("two words", Arc::new(Noop));
        assert!(matches!(
            CommandRegistry::new(vec![bad]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn builtins_register_without_collisions() {
        let reg = CommandRegistry::new(builtin_commands()).unwrap();
        assert!(reg.lookup("MENU").is_some());
        assert!(reg.lookup("mode").unwrap().admin_only);
        assert!(!reg.is_empty());
    }
}
