use proctype::{
    api::ResultsApi,
    attempt::RecordingSizes,
    capture::CapturePlatform,
    error::{ProctorError, ProctorResult},
    session::{BlockReason, CompletionSnapshot, TestSession},
    submission::{self, SubmissionReceipt, UploadOutcome},
    test_definition::{PriorResult, TestDefinition},
};
use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Paragraph, Widget, Wrap},
};
use unicode_width::UnicodeWidthStr;

use crate::{App, AppState};

const HORIZONTAL_MARGIN: u16 = 5;
const VERTICAL_MARGIN: u16 = 2;
pub const WEAKEST_LETTERS: usize = 5;

fn bold() -> Style {
    Style::default().add_modifier(Modifier::BOLD)
}

fn dim_bold() -> Style {
    bold().add_modifier(Modifier::DIM)
}

fn italic() -> Style {
    Style::default().add_modifier(Modifier::ITALIC)
}

fn red_bold() -> Style {
    bold().fg(Color::Red)
}

fn green_bold() -> Style {
    bold().fg(Color::Green)
}

/// `m:ss`
pub fn format_countdown(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn visible(c: char) -> String {
    match c {
        ' ' => "·".to_owned(),
        '\n' => "↵".to_owned(),
        c => c.to_string(),
    }
}

/// Everything the results screen shows, captured once the attempt is over.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsView {
    pub score: f64,
    pub speed: f64,
    pub accuracy: f64,
    pub passed: bool,
    pub completion_secs: i64,
    /// Result id on success, the failure otherwise.
    pub submission: Result<String, String>,
    pub upload: Option<UploadOutcome>,
    pub weakest: Vec<(char, f64)>,
    pub recordings: Option<RecordingSizes>,
}

impl ResultsView {
    pub fn new(
        test: &TestDefinition,
        done: &CompletionSnapshot,
        weakest: Vec<(char, f64)>,
        recordings: Option<RecordingSizes>,
        outcome: &ProctorResult<SubmissionReceipt>,
    ) -> Self {
        let speed = done.metrics.wpm;
        let accuracy = done.metrics.accuracy;
        let (submission, upload) = match outcome {
            Ok(receipt) => (Ok(receipt.result_id.clone()), Some(receipt.upload.clone())),
            Err(ProctorError::SubmissionFailed(reason)) => (Err(reason.clone()), None),
            Err(e) => (Err(e.to_string()), None),
        };
        Self {
            score: submission::score(accuracy, speed),
            speed,
            accuracy,
            passed: submission::passed(test, accuracy, speed),
            completion_secs: done.completion_secs,
            submission,
            upload,
            weakest,
            recordings,
        }
    }
}

impl<P: CapturePlatform, A: ResultsApi> Widget for &App<P, A> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let session = self.attempt.session();
        match self.state {
            AppState::Consent => {
                render_consent(session.test(), self.attempt.prior_result(), area, buf)
            }
            AppState::Blocked => render_blocked(session.blocked(), area, buf),
            AppState::Typing => render_typing(session, area, buf),
            AppState::Submitting => render_notice(
                "Stopping recording and submitting your result...",
                area,
                buf,
            ),
            AppState::Results => match &self.results {
                Some(results) => render_results(results, area, buf),
                None => render_notice("No result", area, buf),
            },
        }
    }
}

fn centered_rows(area: Rect, rows: u16) -> Vec<Rect> {
    let pad = area.height.saturating_sub(rows) / 2;
    let mut constraints = vec![Constraint::Length(pad)];
    constraints.extend((0..rows).map(|_| Constraint::Length(1)));
    constraints.push(Constraint::Min(0));
    Layout::default()
        .direction(Direction::Vertical)
        .horizontal_margin(HORIZONTAL_MARGIN)
        .constraints(constraints)
        .split(area)
        .iter()
        .skip(1)
        .take(rows as usize)
        .copied()
        .collect()
}

fn render_lines(lines: Vec<Line>, area: Rect, buf: &mut Buffer) {
    let rows = centered_rows(area, lines.len() as u16);
    for (line, row) in lines.into_iter().zip(rows) {
        Paragraph::new(line)
            .alignment(Alignment::Center)
            .render(row, buf);
    }
}

pub fn render_notice(message: &str, area: Rect, buf: &mut Buffer) {
    Paragraph::new(Span::styled(
        message.to_string(),
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD | Modifier::ITALIC),
    ))
    .alignment(Alignment::Center)
    .wrap(Wrap { trim: true })
    .render(centered_rows(area, 1)[0], buf);
}

pub fn render_consent(
    test: &TestDefinition,
    prior: Option<&PriorResult>,
    area: Rect,
    buf: &mut Buffer,
) {
    let mut lines = vec![
        Line::from(Span::styled(test.title.clone(), bold())),
        Line::from(""),
        Line::from("This test records your screen and your camera until you finish."),
    ];
    if let Some(minutes) = test.time_limit_minutes.filter(|_| test.has_time_limit) {
        lines.push(Line::from(format!("Time limit: {minutes} min")));
    }
    if test.disable_backspace {
        lines.push(Line::from("Backspace is disabled for this test."));
    }
    if let Some(prior) = prior {
        lines.push(Line::from(Span::styled(
            format!(
                "Previous attempt: {} wpm   {}% acc   score {}",
                prior.speed, prior.accuracy, prior.score
            ),
            italic(),
        )));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        "(enter) allow recording and start / (esc)ape",
        italic(),
    )));
    render_lines(lines, area, buf);
}

pub fn render_blocked(reason: Option<&BlockReason>, area: Rect, buf: &mut Buffer) {
    let message = reason
        .map(BlockReason::message)
        .unwrap_or_else(|| "This test cannot continue.".to_string());
    let legend = if reason.is_some_and(BlockReason::is_retryable) {
        "(enter) try again / (esc)ape"
    } else {
        "(esc)ape"
    };

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .horizontal_margin(HORIZONTAL_MARGIN)
        .vertical_margin(VERTICAL_MARGIN)
        .constraints([
            Constraint::Min(1),
            Constraint::Length(3),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Min(1),
        ])
        .split(area);

    Paragraph::new(Span::styled(message, red_bold()))
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true })
        .render(chunks[1], buf);
    Paragraph::new(Span::styled(legend, italic()))
        .alignment(Alignment::Center)
        .render(chunks[3], buf);
}

pub fn render_typing(session: &TestSession, area: Rect, buf: &mut Buffer) {
    let recorder = session.recorder();
    let target = recorder.target();
    let input = recorder.input();
    let metrics = session.metrics();

    let max_chars_per_line = area.width.saturating_sub(HORIZONTAL_MARGIN * 2).max(1);
    let prompt_width = session.target().width() as u16;
    let prompt_occupied_lines = if prompt_width <= max_chars_per_line {
        1
    } else {
        prompt_width.div_ceil(max_chars_per_line) + 1
    };
    let padding = area.height.saturating_sub(prompt_occupied_lines + 4) / 2;

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .horizontal_margin(HORIZONTAL_MARGIN)
        .constraints([
            Constraint::Length(padding),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(prompt_occupied_lines),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(area);

    let mut spans = input
        .iter()
        .enumerate()
        .map(|(idx, &typed)| match target.get(idx) {
            Some(&expected) if expected == typed => Span::styled(visible(expected), green_bold()),
            _ => Span::styled(visible(typed), red_bold()),
        })
        .collect::<Vec<Span>>();

    if let Some(&next) = target.get(input.len()) {
        spans.push(Span::styled(
            visible(next),
            dim_bold().add_modifier(Modifier::UNDERLINED),
        ));
    }
    if input.len() + 1 < target.len() {
        let rest: String = target[input.len() + 1..]
            .iter()
            .map(|&c| if c == '\n' { '↵' } else { c })
            .collect();
        spans.push(Span::styled(rest, dim_bold()));
    }

    Paragraph::new(Line::from(spans))
        .alignment(if prompt_occupied_lines == 1 {
            Alignment::Center
        } else {
            Alignment::Left
        })
        .wrap(Wrap { trim: true })
        .render(chunks[4], buf);

    if let Some(remaining) = session.time_remaining_secs() {
        Paragraph::new(Span::styled(format_countdown(remaining), dim_bold()))
            .alignment(Alignment::Center)
            .render(chunks[1], buf);
    }

    Paragraph::new(Span::styled(
        format!("{} wpm   {}% acc", metrics.wpm, metrics.accuracy),
        bold(),
    ))
    .alignment(Alignment::Center)
    .render(chunks[2], buf);

    Paragraph::new(Span::styled(
        "● recording screen and camera   (esc) leave test",
        italic().fg(Color::Red),
    ))
    .render(chunks[6], buf);
}

pub fn render_results(results: &ResultsView, area: Rect, buf: &mut Buffer) {
    let verdict = if results.passed {
        Span::styled("PASSED", green_bold())
    } else {
        Span::styled("NOT PASSED", red_bold())
    };

    let mut lines = vec![
        Line::from(vec![
            Span::styled(
                format!(
                    "{} wpm   {}% acc   score {}   ",
                    results.speed, results.accuracy, results.score
                ),
                bold(),
            ),
            verdict,
        ]),
        Line::from(Span::styled(
            format!("finished in {}s", results.completion_secs),
            italic(),
        )),
        Line::from(""),
    ];

    match &results.submission {
        Ok(result_id) => lines.push(Line::from(Span::styled(
            format!("Result submitted ({result_id})"),
            Style::default().fg(Color::Green),
        ))),
        Err(reason) => {
            lines.push(Line::from(Span::styled(
                "Submission failed, do not leave this page.",
                red_bold(),
            )));
            lines.push(Line::from(Span::styled(reason.clone(), italic())));
            lines.push(Line::from(Span::styled(
                "The result is saved locally; `proctype outbox retry` sends it again.",
                italic(),
            )));
        }
    }

    match &results.upload {
        Some(UploadOutcome::Uploaded) => lines.push(Line::from("Recordings uploaded")),
        Some(UploadOutcome::NothingToUpload) => lines.push(Line::from("No recordings to upload")),
        Some(UploadOutcome::Failed(reason)) => lines.push(Line::from(Span::styled(
            format!("Recording upload failed: {reason}"),
            Style::default().fg(Color::Yellow),
        ))),
        None => {}
    }

    if let Some(sizes) = results.recordings {
        let kib = |n: Option<usize>| match n {
            Some(bytes) => format!("{} KiB", bytes.div_ceil(1024)),
            None => "none".to_string(),
        };
        lines.push(Line::from(Span::styled(
            format!("screen {}   camera {}", kib(sizes.screen), kib(sizes.camera)),
            dim_bold(),
        )));
    }

    if !results.weakest.is_empty() {
        let weakest = results
            .weakest
            .iter()
            .map(|(c, miss_rate)| format!("{} {:.0}%", visible(*c), miss_rate))
            .collect::<Vec<_>>()
            .join("   ");
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            format!("most missed: {weakest}"),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::ITALIC),
        )));
    }

    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled("(esc)ape", italic())));
    render_lines(lines, area, buf);
}
