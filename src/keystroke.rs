use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw key event after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    Backspace,
    Enter,
    Char(char),
    /// Modifiers, navigation and any other multi-character key name.
    Ignored,
}

impl KeyInput {
    /// Classifies a key name in the `KeyboardEvent.key` vocabulary.
    pub fn classify(key: &str) -> Self {
        match key {
            "Backspace" => KeyInput::Backspace,
            "Enter" => KeyInput::Enter,
            _ => {
                let mut chars = key.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if !c.is_control() => KeyInput::Char(c),
                    _ => KeyInput::Ignored,
                }
            }
        }
    }

    pub fn from_crossterm(key: &crossterm::event::KeyEvent) -> Self {
        use crossterm::event::{KeyCode, KeyEventKind, KeyModifiers};

        if key.kind == KeyEventKind::Release {
            return KeyInput::Ignored;
        }
        if key
            .modifiers
            .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT | KeyModifiers::SUPER)
        {
            return KeyInput::Ignored;
        }
        match key.code {
            KeyCode::Backspace => KeyInput::Backspace,
            KeyCode::Enter => KeyInput::Enter,
            KeyCode::Char(c) => KeyInput::Char(c),
            _ => KeyInput::Ignored,
        }
    }
}

/// What was logged for a key: the typed character or a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum KeyToken {
    Char(char),
    Backspace,
    Enter,
}

impl KeyToken {
    /// The character this key adds to the input, if any.
    pub fn typed_char(&self) -> Option<char> {
        match self {
            KeyToken::Char(c) => Some(*c),
            KeyToken::Enter => Some('\n'),
            KeyToken::Backspace => None,
        }
    }
}

impl From<KeyToken> for String {
    fn from(token: KeyToken) -> Self {
        match token {
            KeyToken::Char(c) => c.to_string(),
            KeyToken::Backspace => "Backspace".to_string(),
            KeyToken::Enter => "Enter".to_string(),
        }
    }
}

impl TryFrom<String> for KeyToken {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match KeyInput::classify(&value) {
            KeyInput::Backspace => Ok(KeyToken::Backspace),
            KeyInput::Enter => Ok(KeyToken::Enter),
            KeyInput::Char(c) => Ok(KeyToken::Char(c)),
            KeyInput::Ignored if value == "\n" => Ok(KeyToken::Enter),
            KeyInput::Ignored => Err(format!("not a recordable key: {value:?}")),
        }
    }
}

/// One accepted key event. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keystroke {
    pub key: KeyToken,
    /// Milliseconds since the first accepted keystroke.
    pub timestamp: i64,
    pub expected: Option<char>,
    pub correct: bool,
    /// Cursor index before the edit.
    pub position: usize,
}

impl Keystroke {
    pub fn is_backspace(&self) -> bool {
        self.key == KeyToken::Backspace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDisposition {
    /// Logged and applied to the input.
    Accepted,
    /// Swallowed by policy (disabled backspace).
    Suppressed,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub disposition: KeyDisposition,
    /// The host should cancel the key's default action. Always set once the
    /// recorder sees a key; only a session that refuses input lets keys through.
    pub prevent_default: bool,
    /// This keystroke was the first accepted one and set the start time.
    pub started: bool,
}

impl RecordOutcome {
    fn new(disposition: KeyDisposition, started: bool) -> Self {
        Self {
            disposition,
            prevent_default: true,
            started,
        }
    }
}

/// Turns key events into the input buffer and the keystroke log.
#[derive(Debug, Clone)]
pub struct KeystrokeRecorder {
    target: Vec<char>,
    input: Vec<char>,
    log: Vec<Keystroke>,
    started_at: Option<DateTime<Utc>>,
    disable_backspace: bool,
}

impl KeystrokeRecorder {
    pub fn new(target: &str, disable_backspace: bool) -> Self {
        Self {
            target: target.chars().collect(),
            input: Vec::new(),
            log: Vec::new(),
            started_at: None,
            disable_backspace,
        }
    }

    pub fn record(&mut self, key: KeyInput, now: DateTime<Utc>) -> RecordOutcome {
        let token = match key {
            KeyInput::Ignored => return RecordOutcome::new(KeyDisposition::Ignored, false),
            KeyInput::Backspace if self.disable_backspace => {
                return RecordOutcome::new(KeyDisposition::Suppressed, false)
            }
            KeyInput::Backspace => KeyToken::Backspace,
            KeyInput::Enter => KeyToken::Enter,
            KeyInput::Char(c) => KeyToken::Char(c),
        };

        let started = self.started_at.is_none();
        let started_at = *self.started_at.get_or_insert(now);

        let position = self.input.len();
        let expected = self.expected_char(position);
        let correct = match token.typed_char() {
            Some(typed) => {
                self.input.push(typed);
                Some(typed) == expected
            }
            None => {
                self.input.pop();
                false
            }
        };

        self.log.push(Keystroke {
            key: token,
            timestamp: (now - started_at).num_milliseconds().max(0),
            expected,
            correct,
            position,
        });

        RecordOutcome::new(KeyDisposition::Accepted, started)
    }

    pub fn expected_char(&self, idx: usize) -> Option<char> {
        self.target.get(idx).copied()
    }

    pub fn target(&self) -> &[char] {
        &self.target
    }

    pub fn input(&self) -> &[char] {
        &self.input
    }

    pub fn current_input(&self) -> String {
        self.input.iter().collect()
    }

    pub fn keystrokes(&self) -> &[Keystroke] {
        &self.log
    }

    /// The most recent keystroke and the one logged just before it.
    pub fn last_two(&self) -> (Option<&Keystroke>, Option<&Keystroke>) {
        let n = self.log.len();
        (
            self.log.last(),
            n.checked_sub(2).and_then(|i| self.log.get(i)),
        )
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn matches_target(&self) -> bool {
        !self.target.is_empty() && self.input == self.target
    }

    pub fn backspace_count(&self) -> usize {
        self.log.iter().filter(|k| k.is_backspace()).count()
    }
}
