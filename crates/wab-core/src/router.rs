//! Inbound message -> command dispatch.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    commands::{CommandDescriptor, CommandEnv, CommandRegistry, DispatchContext},
    config::Config,
    errors::Error,
    messaging::{queue::OutboundQueue, types::InboundMessage},
    permissions::PermissionPolicy,
    settings::SettingsStore,
    supervisor::{InboundSink, SessionFaults},
    Result,
};

const DENIED_NOTICE: &str = "❌ You are not authorized to use this command.";
const FAILURE_NOTICE: &str = "❌ Something went wrong while running that command.";

#[derive(Clone, Copy, Debug, Default)]
pub struct RouterConfig {
    /// Drop events sent from the bot's own account.
    pub ignore_self: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Denied,
    Failed,
}

/// A resolved command invocation, before the permission gate.
pub struct ParsedCommand {
    pub descriptor: Arc<CommandDescriptor>,
    pub context: DispatchContext,
}

pub struct Router {
    env: CommandEnv,
    policy: Arc<dyn PermissionPolicy>,
    cfg: RouterConfig,
    faults: Option<SessionFaults>,
}

impl Router {
    pub fn new(
        registry: Arc<CommandRegistry>,
        settings: Arc<SettingsStore>,
        queue: OutboundQueue,
        policy: Arc<dyn PermissionPolicy>,
        cfg: RouterConfig,
        config: Arc<Config>,
    ) -> Self {
        Self {
            env: CommandEnv {
                queue,
                settings,
                registry,
                config,
            },
            policy,
            cfg,
            faults: None,
        }
    }

    /// Forward handler-raised session corruption to the connection supervisor.
    pub fn with_session_faults(mut self, faults: SessionFaults) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Resolve `msg` against `prefix`. `None` means "not a command"; that is not an error.
    pub fn parse(&self, msg: InboundMessage, prefix: &str) -> Option<ParsedCommand> {
        if !msg.kind.is_chat() {
            return None;
        }
        if msg.from_me && self.cfg.ignore_self {
            return None;
        }

        let (name, args) = split_command(msg.text.as_deref()?, prefix)?;
        let descriptor = self.env.registry.lookup(&name)?;

        let context = DispatchContext {
            chat_id: msg.chat.clone(),
            sender_id: msg.sender.clone(),
            is_from_self: msg.from_me,
            args,
            raw_event: Arc::new(msg),
        };
        Some(ParsedCommand {
            descriptor,
            context,
        })
    }

    /// Dispatch one inbound event. Returns the handle of the spawned invocation,
    /// or `None` when the event is not a known command.
    pub async fn dispatch(&self, msg: InboundMessage) -> Option<JoinHandle<DispatchOutcome>> {
        let prefix = self.env.settings.snapshot().await.prefix;
        let parsed = self.parse(msg, &prefix)?;
        Some(self.spawn_invocation(parsed))
    }

    fn spawn_invocation(&self, parsed: ParsedCommand) -> JoinHandle<DispatchOutcome> {
        let env = self.env.clone();
        let policy = self.policy.clone();
        let faults = self.faults.clone();
        tokio::spawn(run_invocation(parsed, env, policy, faults))
    }
}

impl Router {
    /// Start the dispatch loop and return the sink the supervisor feeds.
    ///
    /// Events are parsed in arrival order; handlers then run concurrently.
    pub fn spawn_inbox(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> (RouterInbox, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        let handle = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };
                // Invocation handles are detached; outcomes are logged by the task.
                let _ = self.dispatch(msg).await;
            }
            debug!("router inbox stopped");
        });
        (RouterInbox { tx }, handle)
    }
}

/// Ordered hand-off from the connection supervisor to the router.
pub struct RouterInbox {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl InboundSink for RouterInbox {
    fn deliver(&self, message: InboundMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::External("router inbox is closed".to_string()))
    }
}

async fn run_invocation(
    parsed: ParsedCommand,
    env: CommandEnv,
    policy: Arc<dyn PermissionPolicy>,
    faults: Option<SessionFaults>,
) -> DispatchOutcome {
    let ParsedCommand {
        descriptor,
        context,
    } = parsed;
    let name = descriptor.name.clone();

    let restrict = env.settings.snapshot().await.restrict_to_admins;
    if descriptor.admin_only || restrict {
        let allowed = policy
            .is_authorized(&context.sender_id, &context.chat_id, true)
            .await;
        if !allowed {
            info!(command = %name, sender = %context.sender_id, "command denied");
            if let Err(e) = env.reply(&context, DENIED_NOTICE) {
                warn!(command = %name, "failed to queue denial notice: {e}");
            }
            return DispatchOutcome::Denied;
        }
    }

    debug!(command = %name, chat = %context.chat_id, args = context.args.len(), "dispatching");

    // Nested task: a panicking handler surfaces as a JoinError instead of unwinding here.
    let handler = descriptor.handler.clone();
    let task_env = env.clone();
    let task_ctx = context.clone();
    let joined = tokio::spawn(async move { handler.execute(&task_ctx, &task_env).await }).await;

    let failure = match joined {
        Ok(Ok(())) => return DispatchOutcome::Completed,
        Ok(Err(e)) => {
            let failure = format!("{e:#}");
            if is_session_corrupt(&e) {
                match &faults {
                    Some(faults) => faults.report(failure.clone()),
                    None => {
                        warn!(command = %name, "session corruption with no supervisor attached")
                    }
                }
            }
            failure
        }
        Err(e) if e.is_panic() => "handler panicked".to_string(),
        Err(e) => e.to_string(),
    };
    error!(command = %name, chat = %context.chat_id, "command failed: {failure}");
    if let Err(e) = env.reply(&context, FAILURE_NOTICE) {
        warn!(command = %name, "failed to queue failure notice: {e}");
    }
    DispatchOutcome::Failed
}

fn is_session_corrupt(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Error>().is_some_and(Error::is_session_corrupt))
}

/// Split `text` into a lowercase command token and raw argument tokens.
///
/// The token must follow the prefix directly: `"! play"` is not a command.
pub(crate) fn split_command(text: &str, prefix: &str) -> Option<(String, Vec<String>)> {
    let rest = text.trim_start().strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut tokens = rest.split_whitespace();
    let name = tokens.next()?.to_lowercase();
    let args = tokens.map(str::to_string).collect();
    Some((name, args))
}
