//! Command adapter: turns chat requests into supervisor calls and renders
//! the results as replies and keyboards.

use std::sync::Arc;
use std::time::Instant;

use scripthost_gateway_protocol::{InlineButton, InlineKeyboard, ReplyKeyboard};
use tracing::{info, warn};

use super::manager::{CallbackResponse, Reply};
use super::token::{Action, ActionToken, MAX_CALLBACK_BYTES, NOOP};
use crate::config::BotConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::host::HostSnapshot;
use crate::process::{InstanceSummary, Supervisor, UploadKind};
use crate::workspace::ScriptFile;

// ============================================================================
// Main menu
// ============================================================================

/// Entries of the persistent reply keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuItem {
    UploadFile,
    MyScripts,
    Statistics,
    ResourceMonitor,
    ContactOwner,
}

impl MenuItem {
    pub const ALL: [MenuItem; 5] = [
        MenuItem::UploadFile,
        MenuItem::MyScripts,
        MenuItem::Statistics,
        MenuItem::ResourceMonitor,
        MenuItem::ContactOwner,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MenuItem::UploadFile => "📤 Upload File",
            MenuItem::MyScripts => "📂 My Scripts",
            MenuItem::Statistics => "📊 Statistics",
            MenuItem::ResourceMonitor => "📈 Resource Monitor",
            MenuItem::ContactOwner => "📞 Contact Owner",
        }
    }

    pub fn from_label(text: &str) -> Option<Self> {
        let text = text.trim();
        Self::ALL.into_iter().find(|item| item.label() == text)
    }

    fn keyboard() -> ReplyKeyboard {
        let row = |items: &[MenuItem]| -> Vec<String> {
            items.iter().map(|i| i.label().to_string()).collect()
        };
        ReplyKeyboard {
            rows: vec![
                row(&[MenuItem::UploadFile, MenuItem::MyScripts]),
                row(&[MenuItem::Statistics, MenuItem::ResourceMonitor]),
                row(&[MenuItem::ContactOwner]),
            ],
            resize: true,
        }
    }
}

// ============================================================================
// Views
// ============================================================================

/// A user's control panel: running instances first, then runnable files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptListView {
    pub user: String,
    pub running: Vec<InstanceSummary>,
    pub files: Vec<ScriptFile>,
}

impl ScriptListView {
    pub fn is_empty(&self) -> bool {
        self.running.is_empty() && self.files.is_empty()
    }

    pub fn keyboard(&self) -> InlineKeyboard {
        if self.is_empty() {
            return InlineKeyboard::single_row(vec![InlineButton::new(
                "❌ No scripts found",
                NOOP,
            )]);
        }

        let mut rows = Vec::with_capacity(self.running.len() + self.files.len());
        for instance in &self.running {
            rows.push(vec![InlineButton::new(
                format!("🛑 Stop {} (ID: {})", instance.file_name, instance.id),
                ActionToken::stop(&self.user, instance.id).to_string(),
            )]);
        }
        for file in &self.files {
            rows.push(vec![
                InlineButton::new(
                    format!("▶️ Run {}", file.name),
                    ActionToken::run(&self.user, &file.name).to_string(),
                ),
                InlineButton::new(
                    "🗑️ Delete",
                    ActionToken::delete_file(&self.user, &file.name).to_string(),
                ),
            ]);
        }

        let keyboard = InlineKeyboard { rows };
        if let Some(button) = keyboard
            .buttons()
            .find(|b| b.callback_data.len() > MAX_CALLBACK_BYTES)
        {
            warn!(
                user = %self.user,
                data = %button.callback_data,
                "Action token exceeds callback data limit"
            );
        }
        keyboard
    }

    pub fn into_reply(self, header: impl Into<String>) -> Reply {
        let keyboard = self.keyboard();
        Reply::text(header).with_inline_keyboard(keyboard)
    }
}

/// Answer to a button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub toast: String,
    /// Show the toast as a modal alert.
    pub alert: bool,
    /// Refreshed control panel, replacing the pressed message.
    pub reply: Option<Reply>,
}

impl ActionOutcome {
    fn toast(text: impl Into<String>) -> Self {
        Self {
            toast: text.into(),
            alert: false,
            reply: None,
        }
    }

    fn alert(text: impl Into<String>) -> Self {
        Self {
            toast: text.into(),
            alert: true,
            reply: None,
        }
    }

    fn with_reply(mut self, reply: Option<Reply>) -> Self {
        self.reply = reply;
        self
    }
}

impl From<ActionOutcome> for CallbackResponse {
    fn from(outcome: ActionOutcome) -> Self {
        CallbackResponse {
            text: Some(outcome.toast),
            show_alert: outcome.alert,
            edit: outcome.reply,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotStats {
    pub uptime_seconds: u64,
    pub active_instances: usize,
}

impl BotStats {
    pub fn to_reply(self) -> Reply {
        Reply::text(format!(
            "⏱ Uptime: {}s\n🚀 Your active scripts: {}",
            self.uptime_seconds, self.active_instances
        ))
    }
}

// ============================================================================
// CommandAdapter
// ============================================================================

pub struct CommandAdapter {
    supervisor: Arc<Supervisor>,
    bot: BotConfig,
    started_at: Instant,
}

impl CommandAdapter {
    pub fn new(supervisor: Arc<Supervisor>, bot: BotConfig) -> Self {
        Self {
            supervisor,
            bot,
            started_at: Instant::now(),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn on_start(&self, user: &str) -> Reply {
        info!(user, "Session started");
        Reply::text(self.bot.welcome.clone()).with_reply_keyboard(MenuItem::keyboard())
    }

    pub fn upload_prompt(&self) -> Reply {
        Reply::text("📎 Please send the file (.py / .js / .sh / .zip)")
    }

    /// Store an upload; archives are extracted right away.
    pub async fn on_upload(&self, user: &str, file_name: &str, bytes: &[u8]) -> Reply {
        if bytes.len() as u64 > self.bot.max_upload_bytes {
            warn!(user, file = file_name, size = bytes.len(), "Upload over size limit");
            return Reply::text(format!(
                "❌ File is too large (limit {} bytes).",
                self.bot.max_upload_bytes
            ));
        }

        let workspace = self.supervisor.workspace();
        let path = match workspace.save_upload(user, file_name, bytes).await {
            Ok(path) => path,
            Err(e) => return Reply::text(failure_text(&e)),
        };

        if UploadKind::from_file_name(file_name) != Some(UploadKind::Archive) {
            return Reply::text(format!("✅ {file_name} uploaded successfully!"));
        }

        match workspace.extract_archive(user, &path).await {
            Ok(names) if names.is_empty() => {
                Reply::text("✅ ZIP file has been extracted (it was empty).")
            }
            Ok(names) => Reply::text(format!(
                "✅ ZIP file has been extracted!\n{}",
                names.join("\n")
            )),
            Err(e) => Reply::text(failure_text(&e)),
        }
    }

    pub async fn on_list_scripts(&self, user: &str) -> SupervisorResult<ScriptListView> {
        let files = self.supervisor.workspace().list_scripts(user).await?;
        Ok(ScriptListView {
            user: user.to_string(),
            running: self.supervisor.instances(user),
            files,
        })
    }

    /// The control panel as a message.
    pub async fn control_panel(&self, user: &str, header: &str) -> Reply {
        match self.on_list_scripts(user).await {
            Ok(view) => view.into_reply(header),
            Err(e) => Reply::text(failure_text(&e)),
        }
    }

    /// Handle a button press from `sender` carrying callback `data`.
    pub async fn on_action(&self, sender: &str, data: &str) -> ActionOutcome {
        if data == NOOP {
            return ActionOutcome::toast("Nothing to do here");
        }

        let token = match ActionToken::parse(data) {
            Ok(token) => token,
            Err(e) => {
                warn!(sender, data, error = %e, "Malformed action token");
                return ActionOutcome::alert("❌ Invalid data");
            }
        };

        if token.user != sender {
            warn!(
                sender,
                owner = %token.user,
                action = token.action.name(),
                "Rejected action on another user's scripts"
            );
            return ActionOutcome::alert("⛔ This button belongs to another user.");
        }
        let user = token.user.as_str();

        match token.action {
            Action::Run { file_name } => match self.supervisor.run(user, &file_name).await {
                Ok(id) => {
                    let header =
                        format!("✅ Script running!\n📄 File: {file_name}\n🆔 ID: {id}");
                    ActionOutcome::toast(format!("🚀 {file_name} started!"))
                        .with_reply(self.refreshed(user, &header).await)
                }
                Err(e) => ActionOutcome::alert(failure_text(&e)),
            },

            Action::Stop { id } => {
                let file_name = self.supervisor.instance(user, id).map(|s| s.file_name);
                if self.supervisor.stop(user, id) {
                    let name = file_name.unwrap_or_else(|| format!("instance {id}"));
                    ActionOutcome::toast(format!("🛑 {name} stopped"))
                        .with_reply(self.refreshed(user, "📂 Control panel updated:").await)
                } else {
                    ActionOutcome::toast("⚠️ Script not running")
                }
            }

            Action::DeleteFile { file_name } => {
                match self.supervisor.cascade_delete(user, &file_name).await {
                    Ok(outcome) if outcome.file_existed => {
                        ActionOutcome::toast(format!("🗑️ {file_name} deleted"))
                            .with_reply(self.refreshed(user, "📂 File removed").await)
                    }
                    Ok(outcome) if !outcome.killed.is_empty() => {
                        ActionOutcome::alert("❌ File not found")
                            .with_reply(self.refreshed(user, "📂 Control panel updated:").await)
                    }
                    Ok(_) => ActionOutcome::alert("❌ File not found"),
                    Err(e) => ActionOutcome::alert(failure_text(&e)),
                }
            }
        }
    }

    pub fn on_stats(&self, user: &str) -> BotStats {
        BotStats {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            active_instances: self.supervisor.stats(user).active_instances,
        }
    }

    pub async fn on_monitor(&self, user: &str) -> Reply {
        let snapshot = HostSnapshot::read().await;
        let cpu = snapshot
            .cpu_percent
            .map(|c| format!("{c:.1}%"))
            .unwrap_or_else(|| "unavailable".to_string());
        let ram = snapshot
            .memory
            .map(|m| format!("{:.1}%", m.used_percent()))
            .unwrap_or_else(|| "unavailable".to_string());
        let running = self.supervisor.stats(user).active_instances;

        Reply::text(format!(
            "📈 System Monitor\n\n🧠 CPU: {cpu}\n💾 RAM: {ram}\n\
             🚀 Your running scripts: {running}"
        ))
    }

    pub fn on_contact(&self) -> Reply {
        Reply::text(format!("👤 Owner: {}", self.bot.owner_contact))
    }

    async fn refreshed(&self, user: &str, header: &str) -> Option<Reply> {
        match self.on_list_scripts(user).await {
            Ok(view) => Some(view.into_reply(header)),
            Err(e) => {
                warn!(user, error = %e, "Failed to refresh control panel");
                None
            }
        }
    }
}

/// User-facing text for a failed operation.
pub fn failure_text(error: &SupervisorError) -> String {
    match error {
        SupervisorError::UnsupportedType { .. } => {
            "❌ Invalid file format! Send .py, .js, .sh or .zip files.".to_string()
        }
        SupervisorError::InvalidFileName { file_name } => {
            format!("❌ Invalid file name: {file_name}")
        }
        SupervisorError::ScriptNotFound { file_name } => format!("❌ {file_name} not found"),
        SupervisorError::CorruptArchive { reason, .. } => {
            format!("❌ Could not extract archive: {reason}")
        }
        SupervisorError::StorageFault { .. } => "❌ Storage error, please try again.".to_string(),
        SupervisorError::SpawnFault { file_name, source } => {
            format!("❌ Could not start {file_name}: {source}")
        }
    }
}
