use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

/// Generates ordered, human-readable ids of the form
/// `PREFIX-YYYYMMDD-HHMMSS-NNNN-XXXX`.
///
/// `NNNN` counts ids minted within the same second and resets when the
/// second changes; `XXXX` is a random hex tag. The generator is a plain
/// value: share it with `Arc` and pass it to whatever mints ids.
pub struct IdGenerator {
    prefix: String,
    state: Mutex<CounterState>,
}

struct CounterState {
    second: String,
    counter: u32,
}

/// Components of an id produced by [`IdGenerator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: String,
    pub created_at: NaiveDateTime,
    pub sequence: u32,
    pub tag: String,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().to_uppercase(),
            state: Mutex::new(CounterState {
                second: String::new(),
                counter: 0,
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn generate(&self) -> String {
        self.generate_at(Utc::now())
    }

    pub fn generate_at(&self, now: DateTime<Utc>) -> String {
        let second = now.format("%Y%m%d-%H%M%S").to_string();
        let sequence = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.second != second {
                state.second = second.clone();
                state.counter = 0;
            }
            state.counter += 1;
            state.counter
        };
        let tag: u16 = rand::random();
        format!("{}-{}-{:04}-{:04X}", self.prefix, second, sequence, tag)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new("RUN")
    }
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Z][A-Z0-9_]*)-(\d{8}-\d{6})-(\d{4,})-([0-9A-F]{4})$").expect("valid id regex")
    })
}

/// Split an id back into its components. Returns `None` for foreign ids.
pub fn parse_id(id: &str) -> Option<ParsedId> {
    let caps = id_pattern().captures(id)?;
    let created_at = NaiveDateTime::parse_from_str(&caps[2], "%Y%m%d-%H%M%S").ok()?;
    Some(ParsedId {
        prefix: caps[1].to_string(),
        created_at,
        sequence: caps[3].parse().ok()?,
        tag: caps[4].to_string(),
    })
}
