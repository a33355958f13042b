mod backend;
mod client;
mod config;
mod conversation;
mod error;
mod stream;

use anyhow::{bail, Context, Result};
use backend::BackendClient;
use clap::{Parser, Subcommand};
use client::{ChatClient, StreamEvent};
use config::{ChatConfig, EndpointArgs};
use conversation::{Conversation, Notice};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use dhanvantari_shared::{
    AyurvedicRemedy, ChatRequest, DiagnosisType, MedicineScanResponse, MessageRole,
    VisualDiagnosisResponse,
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "dhanvantari", version, about = "Ayurvedic wellness assistant in the terminal")]
struct Cli {
    #[command(flatten)]
    endpoints: EndpointArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat with Dhanvantari (default)
    Chat,
    /// Ask a single question and stream the answer to stdout
    Ask {
        #[arg(required = true)]
        question: Vec<String>,
    },
    /// Identify a medicine from a photo and list herbal alternatives
    Scan { image: PathBuf },
    /// Analyze a skin, eye, tongue or nail photo
    Diagnose {
        image: PathBuf,
        #[arg(short, long, default_value = "skin")]
        kind: DiagnosisType,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            // Log to a file so the TUI is not corrupted
            let log_file = std::fs::File::create("dhanvantari-cli.log").ok();
            if let Some(file) = log_file {
                tracing_subscriber::fmt()
                    .with_writer(file)
                    .with_ansi(false)
                    .init();
            }
            run_chat(cli.endpoints.chat_config()?).await
        }
        Command::Ask { question } => {
            tracing_subscriber::fmt().with_writer(io::stderr).init();
            ask(cli.endpoints.chat_config()?, question.join(" ")).await
        }
        Command::Scan { image } => {
            tracing_subscriber::fmt().with_writer(io::stderr).init();
            let client = BackendClient::new(&cli.endpoints.backend_url);
            let result = client
                .scan_medicine(&image)
                .await
                .with_context(|| format!("scan of {} failed", image.display()))?;
            print_scan(&result);
            Ok(())
        }
        Command::Diagnose { image, kind } => {
            tracing_subscriber::fmt().with_writer(io::stderr).init();
            let client = BackendClient::new(&cli.endpoints.backend_url);
            let result = client
                .analyze_diagnosis(&image, kind)
                .await
                .with_context(|| format!("{} diagnosis of {} failed", kind, image.display()))?;
            print_diagnosis(&result);
            Ok(())
        }
    }
}

async fn ask(config: ChatConfig, question: String) -> Result<()> {
    let client = ChatClient::new(config.chat_url, config.api_key);
    let mut conversation = Conversation::with_greeting();
    if conversation.append_user_message(&question).is_none() {
        bail!("nothing to ask");
    }

    let request = ChatRequest {
        messages: conversation.api_messages(),
        language: config.language,
    };
    let cancel = CancellationToken::new();
    let mut events = client.start_chat(request, cancel.clone());
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                conversation.cancel();
                break;
            }
            event = events.recv() => {
                match event {
                    Some(StreamEvent::Delta(delta)) => {
                        write!(stdout, "{}", delta)?;
                        stdout.flush()?;
                        conversation.on_delta(&delta);
                    }
                    Some(event) => {
                        if let Some(notice) = conversation.apply(event) {
                            bail!(notice.message());
                        }
                    }
                    None => break,
                }
            }
        }
    }
    writeln!(stdout)?;
    Ok(())
}

fn print_remedies(remedies: &[AyurvedicRemedy]) {
    if remedies.is_empty() {
        return;
    }
    println!("\nAyurvedic remedies:");
    for remedy in remedies {
        println!("  🌿 {}", remedy.name);
        println!("     Usage: {}", remedy.usage);
        println!("     Benefits: {}", remedy.benefits);
        if let Some(preparation) = &remedy.preparation {
            println!("     Preparation: {}", preparation);
        }
    }
}

fn print_scan(result: &MedicineScanResponse) {
    if let Some(error) = &result.error {
        println!("Scan error: {}", error);
    }
    match &result.medicine_name {
        Some(name) => println!("Medicine: {} ({:.0}% confidence)", name, result.confidence * 100.0),
        None => println!("Medicine could not be identified."),
    }
    if let Some(category) = &result.category {
        println!("Category: {}", category);
    }
    if let Some(uses) = &result.uses {
        println!("Uses: {}", uses);
    }
    print_remedies(&result.ayurvedic_remedies);
}

fn print_diagnosis(result: &VisualDiagnosisResponse) {
    if let Some(error) = &result.error {
        println!("Analysis error: {}", error);
    }
    println!(
        "{} analysis ({:.0}% confidence)",
        result.analysis_type,
        result.confidence * 100.0
    );
    if result.conditions.is_empty() {
        println!("No conditions detected.");
    }
    for condition in &result.conditions {
        println!(
            "  - {} [{:?}, {:.0}%]",
            condition.name,
            condition.severity,
            condition.confidence * 100.0
        );
        if let Some(description) = &condition.description {
            println!("    {}", description);
        }
    }
    print_remedies(&result.ayurvedic_remedies);
    if !result.recommendations.is_empty() {
        println!("\nRecommendations:");
        for recommendation in &result.recommendations {
            println!("  • {}", recommendation);
        }
    }
}

struct ActiveStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
}

struct App {
    conversation: Conversation,
    input: String,
    scroll: u16,
    notice: Option<Notice>,
    language: String,
    active: Option<ActiveStream>,
}

impl App {
    fn new(language: String) -> Self {
        Self {
            conversation: Conversation::with_greeting(),
            input: String::new(),
            scroll: 0,
            notice: None,
            language,
            active: None,
        }
    }

    fn submit(&mut self, client: &ChatClient) {
        if self.conversation.append_user_message(&self.input).is_none() {
            return;
        }
        self.input.clear();
        self.notice = None;
        self.scroll = 0;

        let request = ChatRequest {
            messages: self.conversation.api_messages(),
            language: self.language.clone(),
        };
        let cancel = CancellationToken::new();
        let events = client.start_chat(request, cancel.clone());
        self.active = Some(ActiveStream { events, cancel });
    }

    fn apply(&mut self, event: StreamEvent) {
        if let Some(notice) = self.conversation.apply(event) {
            self.notice = Some(notice);
        }
    }

    fn stream_closed(&mut self) {
        self.active = None;
        if self.conversation.is_busy() {
            debug!("Stream closed without a final event");
            self.conversation.on_stream_end();
        }
    }

    fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            self.conversation.cancel();
        }
    }
}

async fn next_stream_event(active: &mut Option<ActiveStream>) -> Option<StreamEvent> {
    match active.as_mut() {
        Some(stream) => stream.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_chat(config: ChatConfig) -> Result<()> {
    info!("Starting chat against {} in {}", config.chat_url, config.language);
    let client = ChatClient::new(config.chat_url, config.api_key);
    let mut app = App::new(config.language);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        while let Ok(event) = event::read() {
            if ui_tx.send(event).is_err() {
                break;
            }
        }
    });

    let res = run_app(&mut terminal, &mut app, &client, &mut ui_rx).await;
    app.cancel();

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    res
}

async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    client: &ChatClient,
    ui_rx: &mut mpsc::UnboundedReceiver<Event>,
) -> Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            Some(event) = ui_rx.recv() => {
                if let Event::Key(key) = event {
                    if key.kind == KeyEventKind::Press {
                        match key.code {
                            KeyCode::Char('q') if key.modifiers.contains(event::KeyModifiers::CONTROL) => {
                                return Ok(())
                            }
                            KeyCode::Char(c) => {
                                app.input.push(c);
                            }
                            KeyCode::Backspace => {
                                app.input.pop();
                            }
                            KeyCode::Enter => {
                                app.submit(client);
                            }
                            KeyCode::Esc => {
                                app.cancel();
                            }
                            KeyCode::Up => {
                                app.scroll = app.scroll.saturating_add(1);
                            }
                            KeyCode::Down => {
                                app.scroll = app.scroll.saturating_sub(1);
                            }
                            _ => {}
                        }
                    }
                }
            }
            event = next_stream_event(&mut app.active) => {
                match event {
                    Some(event) => app.apply(event),
                    None => app.stream_closed(),
                }
            }
        }
    }
}

/// Rows to skip so the newest line sits at the bottom of `area`, minus
/// however far the user has scrolled back. Counts rows the way the
/// paragraph itself word-wraps them.
fn bottom_offset(text: &Paragraph, area: Rect, scroll: u16) -> u16 {
    let inner_width = area.width.saturating_sub(2);
    let inner_height = area.height.saturating_sub(2);
    let rows = u16::try_from(text.line_count(inner_width)).unwrap_or(u16::MAX);
    rows.saturating_sub(inner_height).saturating_sub(scroll)
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(f.area());

    let (status_text, status_color) = match &app.notice {
        Some(notice) => (format!("● {}", notice), Color::Red),
        None if app.conversation.is_busy() => {
            ("● Dhanvantari is composing... (Esc to stop)".to_string(), Color::Yellow)
        }
        None => (format!("● Ready ({})", app.language), Color::Green),
    };
    let status = Paragraph::new(status_text)
        .style(Style::default().fg(status_color))
        .block(Block::default());
    f.render_widget(status, chunks[0]);

    let snapshot = app.conversation.snapshot();
    let mut lines = Vec::new();
    for msg in snapshot.iter() {
        let (prefix, style) = match msg.role {
            MessageRole::User => ("You", Style::default().fg(Color::Cyan)),
            MessageRole::Assistant => ("Dhanvantari", Style::default().fg(Color::Green)),
        };
        lines.push(Line::from(Span::styled(
            format!("{}:", prefix),
            style.add_modifier(Modifier::BOLD),
        )));
        for line in msg.content.lines() {
            lines.push(Line::from(Span::raw(line)));
        }
        lines.push(Line::from(""));
    }

    // Placeholder until the first delta arrives
    let waiting = app.conversation.is_busy()
        && snapshot.last().is_some_and(|m| m.role == MessageRole::User);
    if waiting {
        lines.push(Line::from(Span::styled(
            "Dhanvantari:",
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::from("●●●"));
    }

    let text = Paragraph::new(lines).wrap(Wrap { trim: false });
    let offset = bottom_offset(&text, chunks[1], app.scroll);
    let messages = text
        .block(Block::default().borders(Borders::ALL).title("Dhanvantari"))
        .scroll((offset, 0));
    f.render_widget(messages, chunks[1]);

    let input = Paragraph::new(app.input.as_str())
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Describe your symptoms (Enter to send, Ctrl-Q to quit)"),
        )
        .wrap(Wrap { trim: true });

    f.render_widget(input, chunks[2]);
}
