//! CLI (Command Line Interface) mode
//!
//! Interactive REPL that chats through the local supervisor.
//! Also supports non-interactive execute mode for one-shot routing.

use std::sync::Arc;

use nu_ansi_term::{Color, Style};
use reedline::{
    ColumnarMenu, Completer, DefaultHinter, Emacs, KeyCode, KeyModifiers, Keybindings, MenuBuilder,
    Prompt, Reedline, ReedlineEvent, ReedlineMenu, Signal, Suggestion,
};
use serde_json::Value as JsonValue;
use tracing::info;

use switchyard_core::{ChatRequest, Speaker, Supervisor, TurnOutcome};

/// Available commands for autocomplete display
const COMMANDS: &[(&str, &str)] = &[
    ("/help", "ヘルプを表示"),
    ("/exit", "プログラムを終了"),
    ("/quit", "プログラムを終了"),
    ("/new", "新しいセッションを開始"),
    ("/session", "現在のセッション情報を表示"),
    ("/history", "会話履歴を表示"),
    ("/agents", "登録済みエージェント一覧を表示"),
    ("/stats", "クラスタ統計を表示"),
];

/// Command completer for reedline
#[derive(Clone)]
pub struct CommandCompleter {
    commands: Vec<(&'static str, &'static str)>,
}

impl CommandCompleter {
    pub fn new() -> Self {
        Self {
            commands: COMMANDS.to_vec(),
        }
    }
}

impl Default for CommandCompleter {
    fn default() -> Self {
        Self::new()
    }
}

impl Completer for CommandCompleter {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        // 行頭が / で始まる場合は常に候補を表示
        if !line.starts_with('/') {
            return Vec::new();
        }

        self.commands
            .iter()
            .filter(|(cmd, _)| cmd.starts_with(line))
            .map(|(cmd, desc)| Suggestion {
                value: cmd.to_string(),
                description: Some(desc.to_string()),
                extra: None,
                span: reedline::Span::new(0, pos),
                append_whitespace: true,
                style: None,
            })
            .collect()
    }
}

/// Custom prompt with colored styling
struct ColoredPrompt {
    style: Style,
}

impl ColoredPrompt {
    fn new() -> Self {
        Self {
            style: Color::Cyan.bold(),
        }
    }
}

impl Prompt for ColoredPrompt {
    fn render_prompt_left(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Owned(self.style.paint("> ").to_string())
    }

    fn render_prompt_right(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed("")
    }

    fn render_prompt_indicator(
        &self,
        _prompt_mode: reedline::PromptEditMode,
    ) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed("")
    }

    fn render_prompt_multiline_indicator(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed("")
    }

    fn render_prompt_history_search_indicator(
        &self,
        _history_search: reedline::PromptHistorySearch,
    ) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed("")
    }
}

/// How one REPL input was consumed
enum CommandOutcome {
    /// Plain chat input, route it
    NotACommand,
    /// A slash command ran; prompt again
    Handled,
    /// Leave the REPL so teardown can run
    Quit,
}

/// Run CLI interactive mode
pub async fn run_cli(supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    info!(
        "Starting CLI mode with {} agents on supervisor {}",
        supervisor.registry().len(),
        supervisor.id()
    );

    // Welcome message
    print_welcome();

    // Setup keybindings
    let mut keybindings = default_keybindings();

    // Trigger completion on '/' key
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Char('/'),
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );

    // Setup menu - with_only_buffer_difference(false) makes menu show even without buffer changes
    let menu = Box::new(
        ColumnarMenu::default()
            .with_name("command_menu")
            .with_columns(1)
            .with_column_width(Some(40))
            .with_only_buffer_difference(false),
    );

    // Setup hinter
    let hinter = DefaultHinter::default().with_style(Style::new().dimmed());

    // Create line editor
    let mut line_editor = Reedline::create()
        .with_completer(Box::new(CommandCompleter::new()))
        .with_menu(ReedlineMenu::EngineCompleter(menu))
        .with_hinter(Box::new(hinter))
        .with_edit_mode(Box::new(Emacs::new(keybindings)));

    let prompt = ColoredPrompt::new();

    // Session carried across turns; /new drops it
    let mut session_id: Option<String> = None;

    loop {
        let signal = line_editor.read_line(&prompt);

        match signal {
            Ok(Signal::Success(line)) => {
                let input = line.trim();

                // Handle empty input
                if input.is_empty() {
                    continue;
                }

                // Handle special commands
                match handle_command(&supervisor, input, &mut session_id).await {
                    CommandOutcome::Handled => continue,
                    CommandOutcome::Quit => break,
                    CommandOutcome::NotACommand => {}
                }

                // Route the message through the local supervisor
                match send_message(&supervisor, input, &mut session_id).await {
                    Ok(response) => {
                        println!("\n{}\n", response);
                    }
                    Err(e) => {
                        eprintln!("\n❌ エラー: {}\n", e);
                    }
                }
            }
            Ok(Signal::CtrlC) => {
                println!("^C");
                continue;
            }
            Ok(Signal::CtrlD) => {
                println!("\n👋 さようなら！\n");
                break;
            }
            Err(err) => {
                eprintln!("\n❌ エラー: {}\n", err);
                break;
            }
        }
    }

    Ok(())
}

/// Default keybindings for reedline
fn default_keybindings() -> Keybindings {
    let mut keybindings = Keybindings::new();
    // Tab key triggers completion
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Tab,
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Enter, ReedlineEvent::Submit);
    // Esc key clears/closes menus
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Esc, ReedlineEvent::Esc);
    keybindings.add_binding(
        KeyModifiers::CONTROL,
        KeyCode::Char('c'),
        ReedlineEvent::CtrlC,
    );
    keybindings.add_binding(
        KeyModifiers::CONTROL,
        KeyCode::Char('d'),
        ReedlineEvent::CtrlD,
    );
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Up, ReedlineEvent::Up);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Down, ReedlineEvent::Down);
    keybindings
}

/// Route one message, remembering the session id the reply came back with
async fn send_message(
    supervisor: &Arc<Supervisor>,
    input: &str,
    session_id: &mut Option<String>,
) -> anyhow::Result<String> {
    let mut request = ChatRequest::new(input);
    if let Some(id) = session_id.as_deref() {
        request = request.with_session(id);
    }

    match supervisor.handle_message(request).await? {
        TurnOutcome::Reply(reply) => {
            *session_id = Some(reply.session_id.clone());
            Ok(format!("🤖 [{}] {}", reply.agent, reply.response))
        }
        TurnOutcome::Redirect(target) => Ok(format!(
            "↪️ セッション {} は {} ({}) が担当しています",
            target.session_id, target.supervisor_id, target.address
        )),
    }
}

/// Handle special commands (/help, /exit, /new, /session, ...)
async fn handle_command(
    supervisor: &Arc<Supervisor>,
    input: &str,
    session_id: &mut Option<String>,
) -> CommandOutcome {
    let lower = input.to_lowercase();

    match lower.as_str() {
        "/exit" | "/quit" | "/q" => {
            println!("\n👋 さようなら！\n");
            CommandOutcome::Quit
        }
        "/new" => {
            *session_id = None;
            println!("\n✅ 新しいセッションを開始します。\n");
            CommandOutcome::Handled
        }
        "/session" => {
            print_session(supervisor, session_id.as_deref()).await;
            CommandOutcome::Handled
        }
        "/history" => {
            print_history(supervisor, session_id.as_deref()).await;
            CommandOutcome::Handled
        }
        "/agents" => {
            print_agents(supervisor);
            CommandOutcome::Handled
        }
        "/stats" => {
            print_stats(supervisor).await;
            CommandOutcome::Handled
        }
        "/help" | "/?" => {
            print_help();
            CommandOutcome::Handled
        }
        _ if lower.starts_with('/') => {
            eprintln!(
                "\n❓ 不明なコマンド: {}。/help でコマンド一覧を確認してください。\n",
                input
            );
            CommandOutcome::Handled
        }
        _ => CommandOutcome::NotACommand,
    }
}

/// Print current session details
async fn print_session(supervisor: &Arc<Supervisor>, session_id: Option<&str>) {
    let Some(id) = session_id else {
        println!("\nℹ️ アクティブなセッションはありません。メッセージを送ると作成されます。\n");
        return;
    };

    match supervisor.store().get_session(id).await {
        Ok(session) => {
            println!();
            println!("📋 セッション情報:");
            println!("  ID:         {}", session.id);
            println!("  状態:       {:?}", session.status);
            println!("  ターン数:   {}", session.turn_count());
            println!("  所有者:     {}", session.owner_id);
            println!("  バージョン: {}", session.version);
            println!(
                "  有効期限:   {}",
                session.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if !session.variables.is_empty() {
                println!("  変数:");
                let mut keys: Vec<&String> = session.variables.keys().collect();
                keys.sort();
                for key in keys {
                    println!("    {}: {}", key, compact_json(&session.variables[key]));
                }
            }
            println!();
        }
        Err(e) => {
            eprintln!("\n❌ セッションを取得できません: {}\n", e);
        }
    }
}

/// Single-line rendering for a session variable
fn compact_json(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Print conversation history from the store
async fn print_history(supervisor: &Arc<Supervisor>, session_id: Option<&str>) {
    let Some(id) = session_id else {
        println!("\n📜 会話履歴はまだありません。\n");
        return;
    };

    let session = match supervisor.store().get_session(id).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("\n❌ セッションを取得できません: {}\n", e);
            return;
        }
    };

    println!();
    println!("📜 会話履歴 ({} 件):", session.turn_count());
    println!("{}", "─".repeat(50));

    for (i, turn) in session.turns.iter().enumerate() {
        let speaker = match turn.speaker {
            Speaker::User => "👤 あなた".to_string(),
            Speaker::Agent => format!("🤖 {}", turn.agent.as_deref().unwrap_or("agent")),
        };
        let preview: String = turn.text.chars().take(100).collect();
        let suffix = if turn.text.chars().count() > 100 { "..." } else { "" };
        println!(
            "{}. {}: {}{}",
            i + 1,
            speaker,
            preview.replace('\n', " "),
            suffix
        );
    }

    println!("{}", "─".repeat(50));
    println!();
}

/// Print the agent registry listing
fn print_agents(supervisor: &Arc<Supervisor>) {
    let agents = supervisor.registry().list();

    println!();
    println!("🤖 登録済みエージェント ({} 件):", agents.len());
    for agent in agents {
        let caps = agent
            .descriptor
            .capabilities
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  {:<22} [{}] {:?} ({} 回処理)",
            agent.descriptor.name, caps, agent.descriptor.status, agent.stats.dispatches
        );
    }
    println!();
}

/// Print aggregate statistics
async fn print_stats(supervisor: &Arc<Supervisor>) {
    match supervisor.stats().await {
        Ok(stats) => {
            println!();
            println!("📊 クラスタ統計:");
            println!("  スーパーバイザー: {}", stats.supervisor_id);
            println!("  実行中ターン:     {}", stats.in_flight);
            println!(
                "  セッション:       {} (active {}, error {})",
                stats.sessions.total, stats.sessions.active, stats.sessions.error
            );
            println!(
                "  エージェント:     {} (active {}, degraded {})",
                stats.agents.total, stats.agents.active, stats.agents.degraded
            );
            println!(
                "  ディレクトリ:     {} 台のスーパーバイザー",
                stats.supervisors.len()
            );
            println!();
        }
        Err(e) => {
            eprintln!("\n❌ 統計を取得できません: {}\n", e);
        }
    }
}

/// Print welcome message
fn print_welcome() {
    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║          🚦 switchyard CLI - 対話モード                    ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  メッセージを入力して Enter でチャット開始                  ║");
    println!("║  コマンド: /help, /new, /session, /agents, /stats          ║");
    println!("║  / を入力するとコマンド候補が表示されます                   ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

/// Print help message
fn print_help() {
    println!();
    println!("📖 利用可能なコマンド:");
    for (cmd, desc) in COMMANDS {
        println!("  {} - {}", cmd, desc);
    }
    println!();
    println!("💡 ヒント: / から入力するとコマンド候補が表示されます");
    println!("💡 矢印キー(↑/↓)で候補を選択、Enterで確定できます");
    println!();
}

// ============================================================================
// 非対話モード (Non-interactive mode)
// ============================================================================

/// 非対話モード: メッセージを 1 件ルーティングして終了
///
/// # 使用例
/// ```bash
/// switchyard --execute "Check my availability for Friday"
/// ```
pub async fn run_execute(supervisor: Arc<Supervisor>, message: &str) -> anyhow::Result<()> {
    // メッセージが空の場合はエラー
    let message = message.trim();
    if message.is_empty() {
        eprintln!("エラー: メッセージが空です");
        std::process::exit(1);
    }

    info!("Routing one-shot message through {}", supervisor.id());

    match supervisor.handle_message(ChatRequest::new(message)).await {
        Ok(TurnOutcome::Reply(reply)) => {
            println!("{}", reply.response);
            Ok(())
        }
        Ok(TurnOutcome::Redirect(target)) => {
            eprintln!(
                "セッションは {} ({}) が担当しています",
                target.supervisor_id, target.address
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    }
}
