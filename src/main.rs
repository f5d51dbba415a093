mod ui;

use std::{
    error::Error,
    io::{self, stdin},
    path::PathBuf,
    time::Duration,
};

use chrono::Utc;
use clap::{error::ErrorKind, CommandFactory, Parser, Subcommand};
use crossterm::{
    event::{KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    tty::IsTty,
};
use proctype::{
    api::{HttpResultsApi, ResultsApi},
    app_dirs::AppDirs,
    attempt::ProctoredAttempt,
    capture::{CapturePlatform, FfmpegPlatform, SimulatedPlatform, SimulationScript},
    config::{Config, ConfigStore, FileConfigStore},
    journal::SubmissionJournal,
    keystroke::KeyInput,
    logging,
    runtime::{AttemptEvent, CrosstermEventSource, FixedTicker, Runner},
    submission::SubmissionCoordinator,
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Frame, Terminal,
};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::ui::{ResultsView, WEAKEST_LETTERS};

/// proctored typing tests in the terminal
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Takes timed typing tests while the screen and camera are recorded, then submits the graded result and uploads the recordings."
)]
pub struct Cli {
    /// config file to use instead of the default location
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// api base url, overrides the config file
    #[clap(long, global = true)]
    server: Option<String>,

    /// bearer token for the api, overrides the config file
    #[clap(long, global = true)]
    token: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// take a proctored test
    Take {
        test_id: String,

        /// record with an in-process stand-in instead of ffmpeg
        #[clap(long)]
        simulate_capture: bool,
    },
    /// submissions that failed to send and are kept locally
    Outbox {
        #[clap(subcommand)]
        action: OutboxAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq)]
enum OutboxAction {
    /// show pending submissions
    List,
    /// send pending submissions again
    Retry,
}

impl Cli {
    fn load_config(&self) -> Config {
        let store = match &self.config {
            Some(path) => FileConfigStore::with_path(path),
            None => FileConfigStore::new(),
        };
        let mut config = store.load();
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(token) = &self.token {
            config.api_token = Some(token.clone());
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppState {
    Consent,
    Blocked,
    Typing,
    Submitting,
    Results,
}

pub struct App<P: CapturePlatform, A: ResultsApi> {
    pub attempt: ProctoredAttempt<P, A>,
    pub state: AppState,
    pub results: Option<ResultsView>,
}

impl<P: CapturePlatform, A: ResultsApi> App<P, A> {
    pub fn new(attempt: ProctoredAttempt<P, A>) -> Self {
        let state = if attempt.session().blocked().is_some() {
            AppState::Blocked
        } else {
            AppState::Consent
        };
        Self {
            attempt,
            state,
            results: None,
        }
    }

    fn begin(&mut self, rt: &Runtime) {
        self.state = match rt.block_on(self.attempt.begin()) {
            Ok(()) => AppState::Typing,
            Err(_) => AppState::Blocked,
        };
    }

    fn finish(&mut self, rt: &Runtime) {
        let outcome = rt.block_on(self.attempt.finish());
        if let Some(done) = self.attempt.completion() {
            self.results = Some(ResultsView::new(
                self.attempt.session().test(),
                done,
                self.attempt.session().letters().weakest(WEAKEST_LETTERS),
                self.attempt.recordings(),
                &outcome,
            ));
        }
        self.state = AppState::Results;
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = cli.load_config();

    match &cli.command {
        Command::Take {
            test_id,
            simulate_capture,
        } => {
            if !stdin().is_tty() {
                let mut cmd = Cli::command();
                cmd.error(ErrorKind::Io, "stdin must be a tty").exit();
            }
            logging::init(AppDirs::log_dir().as_deref());
            take(&config, test_id, *simulate_capture)
        }
        Command::Outbox { action } => {
            logging::init(None);
            outbox(&config, *action)
        }
    }
}

fn open_journal(config: &Config) -> Option<SubmissionJournal> {
    let path = config.journal_path();
    match SubmissionJournal::open(&path) {
        Ok(journal) => Some(journal),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "submission journal unavailable");
            None
        }
    }
}

fn take(config: &Config, test_id: &str, simulate_capture: bool) -> Result<(), Box<dyn Error>> {
    let rt = Runtime::new()?;
    let _guard = rt.enter();
    let api = HttpResultsApi::new(&config.server_url, config.api_token.clone())?;
    let journal = open_journal(config);

    if simulate_capture {
        let platform = SimulatedPlatform::new(SimulationScript::default());
        run_attempt(&rt, api, test_id, platform, config, journal)
    } else {
        let platform = FfmpegPlatform::new(&config.capture);
        run_attempt(&rt, api, test_id, platform, config, journal)
    }
}

fn run_attempt<P: CapturePlatform, A: ResultsApi>(
    rt: &Runtime,
    api: A,
    test_id: &str,
    platform: P,
    config: &Config,
    journal: Option<SubmissionJournal>,
) -> Result<(), Box<dyn Error>> {
    let attempt = rt.block_on(ProctoredAttempt::load(
        api,
        test_id,
        platform,
        &config.capture,
        journal,
        &mut rand::thread_rng(),
    ))?;

    enable_raw_mode()?;

    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(attempt);
    let outcome = start_tui(
        &mut terminal,
        &mut app,
        rt,
        Duration::from_millis(config.tick_ms),
    );
    app.attempt.abandon();

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Some(Err(reason)) = app.results.as_ref().map(|r| &r.submission) {
        eprintln!("submission failed and was saved locally: {reason}");
        eprintln!("run `proctype outbox retry` to send it again");
    }
    outcome
}

fn is_quit(key: &KeyEvent) -> bool {
    key.code == KeyCode::Esc
        || (key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c'))
}

fn start_tui<B: Backend, P: CapturePlatform, A: ResultsApi>(
    terminal: &mut Terminal<B>,
    app: &mut App<P, A>,
    rt: &Runtime,
    tick: Duration,
) -> Result<(), Box<dyn Error>> {
    let runner = Runner::new(CrosstermEventSource::new(), FixedTicker::new(tick));
    terminal.draw(|f| render(app, f))?;

    loop {
        match runner.step() {
            AttemptEvent::Tick => {
                if app.state == AppState::Typing {
                    if app.attempt.tick(Utc::now()) {
                        submit(terminal, app, rt)?;
                    }
                    terminal.draw(|f| render(app, f))?;
                }
            }
            AttemptEvent::Resize => {
                terminal.draw(|f| render(app, f))?;
            }
            AttemptEvent::Key(key) => {
                if is_quit(&key) {
                    if app.state == AppState::Typing {
                        info!("left the test before finishing");
                    }
                    break;
                }

                match app.state {
                    AppState::Consent => {
                        if key.code == KeyCode::Enter {
                            request_capture(terminal, app, rt)?;
                        }
                    }
                    AppState::Blocked => {
                        let retryable = app
                            .attempt
                            .session()
                            .blocked()
                            .is_some_and(|reason| reason.is_retryable());
                        if key.code == KeyCode::Enter && retryable {
                            request_capture(terminal, app, rt)?;
                        }
                    }
                    AppState::Typing => {
                        let outcome = app.attempt.key(KeyInput::from_crossterm(&key), Utc::now());
                        if outcome.completion.is_some() {
                            submit(terminal, app, rt)?;
                        }
                    }
                    AppState::Submitting => {}
                    AppState::Results => {
                        if matches!(key.code, KeyCode::Enter | KeyCode::Char('q')) {
                            break;
                        }
                    }
                }
                terminal.draw(|f| render(app, f))?;
            }
        }
    }

    Ok(())
}

fn request_capture<B: Backend, P: CapturePlatform, A: ResultsApi>(
    terminal: &mut Terminal<B>,
    app: &mut App<P, A>,
    rt: &Runtime,
) -> Result<(), Box<dyn Error>> {
    terminal.draw(|f| {
        let area = f.area();
        ui::render_notice(
            "Requesting screen and camera access...",
            area,
            f.buffer_mut(),
        )
    })?;
    app.begin(rt);
    Ok(())
}

fn submit<B: Backend, P: CapturePlatform, A: ResultsApi>(
    terminal: &mut Terminal<B>,
    app: &mut App<P, A>,
    rt: &Runtime,
) -> Result<(), Box<dyn Error>> {
    app.state = AppState::Submitting;
    terminal.draw(|f| render(app, f))?;
    app.finish(rt);
    Ok(())
}

fn render<P: CapturePlatform, A: ResultsApi>(app: &App<P, A>, f: &mut Frame) {
    f.render_widget(app, f.area());
}

fn outbox(config: &Config, action: OutboxAction) -> Result<(), Box<dyn Error>> {
    let journal = SubmissionJournal::open(config.journal_path())?;

    match action {
        OutboxAction::List => {
            let pending = journal.pending()?;
            if pending.is_empty() {
                println!("no pending submissions");
            }
            for entry in pending {
                println!(
                    "{:>4}  {}  {}  attempts: {}  last failure: {}",
                    entry.id,
                    entry.test_id,
                    entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.attempts,
                    entry.failure
                );
            }
        }
        OutboxAction::Retry => {
            let rt = Runtime::new()?;
            let api = HttpResultsApi::new(&config.server_url, config.api_token.clone())?;
            let coordinator = SubmissionCoordinator::new(api, Some(journal));
            let report = rt.block_on(coordinator.retry_pending())?;

            if report.sent.is_empty() && report.failed.is_empty() {
                println!("no pending submissions");
            }
            for (id, result_id) in &report.sent {
                println!("{id:>4}  sent as result {result_id}");
            }
            for (id, reason) in &report.failed {
                println!("{id:>4}  still failing: {reason}");
            }
            if !report.failed.is_empty() {
                return Err(format!("{} submission(s) still pending", report.failed.len()).into());
            }
        }
    }

    Ok(())
}
