//! Listener reactions: free text to structured intent.
//!
//! Pure keyword matching, no model involved. Evaluation order matters:
//! quit, then station management, then commands and the sleep timer, then
//! sentiment, modifiers, direction and mood.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

macro_rules! re {
    ($pattern:expr) => {
        Lazy::new(|| Regex::new($pattern).expect("reaction pattern"))
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Liked,
    Disliked,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Stay close to what is playing.
    Tweak,
    /// Start over with something unrelated.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Focus,
    Energy,
    Chill,
    Sad,
    Happy,
    Sleep,
    Party,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Focus => "focus",
            Mood::Energy => "energy",
            Mood::Chill => "chill",
            Mood::Sad => "sad",
            Mood::Happy => "happy",
            Mood::Sleep => "sleep",
            Mood::Party => "party",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Command {
    Quit,
    ListRadios,
    SwitchRadio { radio: String },
    CreateRadio { radio: String },
    DeleteRadio { radio: String },
    Save,
    What,
    History,
    Share,
    OpenFolder,
    Help,
    SleepTimer { minutes: u32 },
    CancelSleep,
    SleepStatus,
}

/// Structured reading of one listener message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reaction {
    pub signal: Option<Signal>,
    pub direction: Option<Direction>,
    pub modifiers: Vec<String>,
    pub mood: Option<Mood>,
    pub command: Option<Command>,
    pub raw: String,
}

static QUIT: Lazy<Regex> = re!(r"\bquit\b|\bexit\b|\bbye\b");
static LIST_RADIOS: Lazy<Regex> =
    re!(r"what radios|list radios|my radios|show radios|\bradios\b");
static SWITCH: Lazy<Regex> =
    re!(r"^(?:switch to|change to|go to|use)\s+(?:my\s+)?(?:the\s+)?(.+?)(?:\s+radio)?$");
static CREATE: Lazy<Regex> = re!(
    r"(?:create|new|start|make)\s+(?:a\s+)?(?:radio\s+(?:called\s+|named\s+)?|new\s+radio\s+(?:called\s+|named\s+)?)(.+?)(?:\s+radio)?$"
);
// "radio" is required so that "remove vocals" stays a modifier
static DELETE_SUFFIX: Lazy<Regex> =
    re!(r"(?:delete|remove|kill)\s+(?:the\s+)?(?:my\s+)?(.+?)\s+radio$");
static DELETE_PREFIX: Lazy<Regex> =
    re!(r"(?:delete|remove|kill)\s+(?:the\s+)?(?:my\s+)?radio\s+(.+?)$");

static SAVE: Lazy<Regex> = re!(r"\bsave\b|\bkeep\b|\bfavorite\b|\bfav\b");
static WHAT: Lazy<Regex> =
    re!(r"what is this|what's this|\binfo\b|\brecipe\b|\bparams\b|\bdetails\b");
static HISTORY: Lazy<Regex> =
    re!(r"\bhistory\b|\blast played\b|\brecent\b|\btracks\b|\bsongs\b");
static SHARE: Lazy<Regex> = re!(r"\bshare\b");
static OPEN_FOLDER: Lazy<Regex> = re!(r"open folder|open in finder|\bfinder\b");
static HELP: Lazy<Regex> = re!(r"^\s*help\s*$");

static CANCEL_SLEEP: Lazy<Regex> = re!(r"cancel\s+sleep|^\s*sleep\s+off\s*$");
static SLEEP_FOR: Lazy<Regex> = re!(r"^\s*sleep\s+(\d+)\s*(h|m|min|mins|hours?)?\s*$");
static SLEEP_STATUS: Lazy<Regex> = re!(r"^\s*sleep\s*$");

static LIKED: Lazy<Regex> = re!(
    r"\blove\b|\bperfect\b|\bamazing\b|\bincredible\b|\bfire\b|\byes\b|❤️|🔥|💯|\bgreat\b|\bawesome\b|\bbanging\b|\bbanger\b"
);
static DISLIKED: Lazy<Regex> = re!(r"\bhate\b|\bterrible\b|\bawful\b|\bnope\b|\bdislike\b|\bno+\b");
static SKIPPED: Lazy<Regex> = re!(r"\bskip\b|\bnext\b|\bpass\b|\bnot this\b");
static WEAK_LIKED: Lazy<Regex> =
    re!(r"\bgood\b|\blike\b|\bnice\b|\bcool\b|\bsolid\b|\bokay\b|\bok\b|\bfresh\b");

static RESET: Lazy<Regex> = re!(
    r"something (?:completely )?different|change it up|\breset\b|surprise me|totally different"
);
static TWEAK: Lazy<Regex> = re!(r"more like this|similar|\bkeep it\b|\bstay\b|same vibe");

static SEGMENT_SPLIT: Lazy<Regex> = re!(r",|\band\b");
static MODIFIER: Lazy<Regex> = re!(r"\b(?:more|less|add|remove|no)\s+([\w ]{2,25})$");
static COMPARATIVE: Lazy<Regex> = re!(
    r"\b(faster|slower|louder|quieter|harder|softer|heavier|lighter|darker|brighter|rawer|smoother)\b"
);

static MOODS: Lazy<Vec<(Mood, Regex)>> = Lazy::new(|| {
    [
        (Mood::Focus, r"\bfocus\b|\bwork\b|\bconcentrate\b|\bstudy\b"),
        (Mood::Energy, r"\benergy\b|\bpump\b|\bworkout\b|\bhype\b"),
        (Mood::Chill, r"\bchill\b|\brelax\b|\bsoothe\b|\beasy\b|\bmellow\b"),
        (Mood::Sad, r"\bsad\b|\bmelancholy\b|\bdepressing\b|\bheavy\b|\bemotion\b"),
        (Mood::Happy, r"\bhappy\b|\bjoyful\b|\buplifting\b|\bupbeat\b"),
        (Mood::Sleep, r"\bsleep\b|\bdream\b|\bnight\b"),
        (Mood::Party, r"\bparty\b|\bdance\b|\bclub\b|\brave\b"),
    ]
    .into_iter()
    .map(|(mood, pattern)| (mood, Regex::new(pattern).expect("mood pattern")))
    .collect()
});

static OFF_TOPIC: Lazy<Regex> = re!(
    r"\bweather\b|\bwhat time\b|\bwhat's the time\b|\bdate\b|\bnews\b|\bsports\b|\bcalculate\b|\btranslate\b|\bgoogle\b|\bwikipedia\b|\bstocks?\b|\bcurrency\b|\btell me a joke\b"
);

/// Toast sent back for requests the radio cannot serve.
pub const OFF_TOPIC_REPLY: &str = "I only speak music. Try 'more bass' or 'something darker'.";

impl Reaction {
    fn empty(raw: &str) -> Self {
        Self {
            signal: None,
            direction: None,
            modifiers: Vec::new(),
            mood: None,
            command: None,
            raw: raw.to_string(),
        }
    }

    fn command(raw: &str, command: Command) -> Self {
        Self {
            command: Some(command),
            ..Self::empty(raw)
        }
    }

    pub fn parse(text: &str) -> Self {
        let t = text.trim().to_lowercase();
        let mut reaction = Self::empty(text);
        if t.is_empty() {
            return reaction;
        }

        if QUIT.is_match(&t) {
            return Self::command(text, Command::Quit);
        }
        if LIST_RADIOS.is_match(&t) {
            return Self::command(text, Command::ListRadios);
        }
        if let Some(radio) = capture_name(&SWITCH, &t) {
            return Self::command(text, Command::SwitchRadio { radio });
        }
        if let Some(radio) = capture_name(&CREATE, &t) {
            return Self::command(text, Command::CreateRadio { radio });
        }
        if let Some(radio) =
            capture_name(&DELETE_SUFFIX, &t).or_else(|| capture_name(&DELETE_PREFIX, &t))
        {
            return Self::command(text, Command::DeleteRadio { radio });
        }

        if SAVE.is_match(&t) {
            reaction.command = Some(Command::Save);
            reaction.signal = Some(Signal::Liked);
        }
        if WHAT.is_match(&t) {
            reaction.command = Some(Command::What);
        }
        if HISTORY.is_match(&t) {
            reaction.command = Some(Command::History);
        }
        if SHARE.is_match(&t) {
            reaction.command = Some(Command::Share);
        }
        if OPEN_FOLDER.is_match(&t) {
            reaction.command = Some(Command::OpenFolder);
        }
        if HELP.is_match(&t) {
            reaction.command = Some(Command::Help);
        }

        if CANCEL_SLEEP.is_match(&t) {
            return Self::command(text, Command::CancelSleep);
        }
        if let Some(caps) = SLEEP_FOR.captures(&t) {
            let amount: u32 = caps[1].parse().unwrap_or(0);
            let hours = caps.get(2).is_some_and(|u| u.as_str().starts_with('h'));
            let minutes = if hours {
                amount.saturating_mul(60)
            } else {
                amount
            };
            return Self::command(text, Command::SleepTimer { minutes });
        }
        if SLEEP_STATUS.is_match(&t) {
            return Self::command(text, Command::SleepStatus);
        }

        if LIKED.is_match(&t) {
            reaction.signal = Some(Signal::Liked);
        } else if DISLIKED.is_match(&t) {
            reaction.signal = Some(Signal::Disliked);
        } else if SKIPPED.is_match(&t) {
            reaction.signal = Some(Signal::Skipped);
        } else if WEAK_LIKED.is_match(&t) {
            reaction.signal = Some(Signal::Liked);
        }

        reaction.modifiers = extract_modifiers(&t);

        reaction.direction = if RESET.is_match(&t) {
            Some(Direction::Reset)
        } else if TWEAK.is_match(&t) || reaction.signal.is_some() || !reaction.modifiers.is_empty()
        {
            Some(Direction::Tweak)
        } else {
            None
        };

        reaction.mood = MOODS
            .iter()
            .find(|(_, re)| re.is_match(&t))
            .map(|(mood, _)| *mood);

        reaction
    }

    /// Canned reaction for a transport button.
    pub fn from_signal(signal: Signal) -> Self {
        let raw = match signal {
            Signal::Liked => "like",
            Signal::Disliked => "dislike",
            Signal::Skipped => "skip",
        };
        Self {
            signal: Some(signal),
            direction: Some(Direction::Tweak),
            ..Self::empty(raw)
        }
    }

    /// Does this message ask for a different next track than the one queued?
    ///
    /// Sentiment alone never does; modifiers, a mood, a reset, or free text
    /// that matched nothing at all do.
    pub fn wants_change(&self) -> bool {
        !self.modifiers.is_empty()
            || self.mood.is_some()
            || self.direction == Some(Direction::Reset)
            || (self.signal.is_none() && self.command.is_none() && !self.raw.trim().is_empty())
    }

    /// True when the message is only a command (no musical content).
    pub fn is_pure_command(&self) -> bool {
        self.command.is_some()
            && self.signal.is_none()
            && self.modifiers.is_empty()
            && self.mood.is_none()
    }
}

fn capture_name(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    let name = clean_radio_name(caps.get(1)?.as_str());
    (!name.is_empty()).then_some(name)
}

fn extract_modifiers(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut push = |modifier: &str| {
        let modifier = modifier.trim();
        if !modifier.is_empty() && modifier.len() < 40 && !found.iter().any(|m| m == modifier) {
            found.push(modifier.to_string());
        }
    };

    for segment in SEGMENT_SPLIT.split(text) {
        // the object of "more"/"no" runs to the end of its segment
        if let Some(caps) = MODIFIER.captures(segment.trim()) {
            push(&caps[1]);
        }
    }
    for caps in COMPARATIVE.captures_iter(text) {
        push(&caps[1]);
    }
    found
}

/// Lowercase slug safe to use as a directory name.
pub fn clean_radio_name(raw: &str) -> String {
    static NOT_WORD: Lazy<Regex> = re!(r"[^\w\s-]");
    static SPACES: Lazy<Regex> = re!(r"\s+");
    let name = raw.trim().to_lowercase();
    let name = NOT_WORD.replace_all(&name, "");
    let name = SPACES.replace_all(&name, "-");
    name.trim_matches('-').to_string()
}

/// Requests the radio does not handle (weather, news, jokes...).
pub fn is_off_topic(text: &str) -> bool {
    OFF_TOPIC.is_match(&text.to_lowercase())
}

pub const HELP_TEXT: &str = "React in plain words: 'more bass', 'darker', 'something different', \
'love it', 'skip'. Commands: save, what, history, radios, switch to <name>, \
create radio <name>, delete radio <name>, sleep 30, sleep off.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_wins_over_everything() {
        let r = Reaction::parse("love it but bye");
        assert_eq!(r.command, Some(Command::Quit));
        assert_eq!(r.signal, None);
    }

    #[test]
    fn test_station_commands() {
        assert_eq!(Reaction::parse("list radios").command, Some(Command::ListRadios));
        assert_eq!(
            Reaction::parse("switch to my Late Night radio").command,
            Some(Command::SwitchRadio {
                radio: "late-night".into()
            })
        );
        assert_eq!(
            Reaction::parse("create a radio called Deep Focus!").command,
            Some(Command::CreateRadio {
                radio: "deep-focus".into()
            })
        );
        assert_eq!(
            Reaction::parse("delete the jazz radio").command,
            Some(Command::DeleteRadio {
                radio: "jazz".into()
            })
        );
        assert_eq!(
            Reaction::parse("remove radio old-stuff").command,
            Some(Command::DeleteRadio {
                radio: "old-stuff".into()
            })
        );
    }

    #[test]
    fn test_remove_without_radio_is_a_modifier() {
        let r = Reaction::parse("remove vocals");
        assert_eq!(r.command, None);
        assert_eq!(r.modifiers, vec!["vocals"]);
        assert!(r.wants_change());
    }

    #[test]
    fn test_use_only_switches_at_start() {
        let r = Reaction::parse("can you use more bass");
        assert_eq!(r.command, None);
        assert_eq!(r.modifiers, vec!["bass"]);
    }

    #[test]
    fn test_save_implies_liked() {
        let r = Reaction::parse("save this one");
        assert_eq!(r.command, Some(Command::Save));
        assert_eq!(r.signal, Some(Signal::Liked));
        assert!(!r.wants_change());
    }

    #[test]
    fn test_sleep_commands() {
        assert_eq!(
            Reaction::parse("sleep 30").command,
            Some(Command::SleepTimer { minutes: 30 })
        );
        assert_eq!(
            Reaction::parse("sleep 2h").command,
            Some(Command::SleepTimer { minutes: 120 })
        );
        assert_eq!(
            Reaction::parse("sleep 1 hour").command,
            Some(Command::SleepTimer { minutes: 60 })
        );
        assert_eq!(Reaction::parse("sleep off").command, Some(Command::CancelSleep));
        assert_eq!(Reaction::parse("cancel sleep").command, Some(Command::CancelSleep));
        assert_eq!(Reaction::parse("sleep").command, Some(Command::SleepStatus));
        // a mood, not a timer
        let r = Reaction::parse("music to sleep to");
        assert_eq!(r.command, None);
        assert_eq!(r.mood, Some(Mood::Sleep));
    }

    #[test]
    fn test_signal_priority() {
        assert_eq!(Reaction::parse("love it").signal, Some(Signal::Liked));
        assert_eq!(Reaction::parse("🔥🔥").signal, Some(Signal::Liked));
        assert_eq!(Reaction::parse("nooo").signal, Some(Signal::Disliked));
        assert_eq!(Reaction::parse("next please").signal, Some(Signal::Skipped));
        assert_eq!(Reaction::parse("it's ok").signal, Some(Signal::Liked));
        // strong liked words win over "no"
        assert_eq!(Reaction::parse("no, perfect").signal, Some(Signal::Liked));
    }

    #[test]
    fn test_pure_sentiment_keeps_queue() {
        for text in ["love it", "skip", "hate this", "nice"] {
            let r = Reaction::parse(text);
            assert!(!r.wants_change(), "{text}");
            assert_eq!(r.direction, Some(Direction::Tweak));
        }
    }

    #[test]
    fn test_modifiers() {
        let r = Reaction::parse("more bass and less reverb, no vocals");
        assert_eq!(r.modifiers, vec!["bass", "reverb", "vocals"]);
        assert_eq!(r.signal, Some(Signal::Disliked));
        assert_eq!(r.direction, Some(Direction::Tweak));

        let r = Reaction::parse("darker and faster");
        assert_eq!(r.modifiers, vec!["darker", "faster"]);
        assert!(r.wants_change());
    }

    #[test]
    fn test_modifiers_count_as_tweak_without_signal() {
        let r = Reaction::parse("add some strings");
        assert_eq!(r.signal, None);
        assert_eq!(r.modifiers, vec!["some strings"]);
        assert_eq!(r.direction, Some(Direction::Tweak));
    }

    #[test]
    fn test_direction_and_mood() {
        let r = Reaction::parse("surprise me");
        assert_eq!(r.direction, Some(Direction::Reset));
        assert!(r.wants_change());

        let r = Reaction::parse("something to study");
        assert_eq!(r.mood, Some(Mood::Focus));
        assert!(r.wants_change());

        let r = Reaction::parse("same vibe");
        assert_eq!(r.direction, Some(Direction::Tweak));
    }

    #[test]
    fn test_free_text_wants_change() {
        let r = Reaction::parse("jazz with a saxophone");
        assert_eq!(r.signal, None);
        assert_eq!(r.command, None);
        assert!(r.wants_change());

        assert!(!Reaction::parse("   ").wants_change());
    }

    #[test]
    fn test_off_topic() {
        assert!(is_off_topic("What's the weather like?"));
        assert!(is_off_topic("tell me a joke"));
        assert!(!is_off_topic("update the vibe"));
        assert!(!is_off_topic("more bass"));
    }

    #[test]
    fn test_clean_radio_name() {
        assert_eq!(clean_radio_name("  My Jazz  Club! "), "my-jazz-club");
        assert_eq!(clean_radio_name("../../etc"), "etc");
        assert_eq!(clean_radio_name("---"), "");
    }

    #[test]
    fn test_button_reactions() {
        let r = Reaction::from_signal(Signal::Skipped);
        assert_eq!(r.raw, "skip");
        assert!(!r.wants_change());
    }
}
