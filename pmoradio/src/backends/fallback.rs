//! Keyword fallback used when the language model gives nothing usable.
//!
//! Matches whole words from small genre/mood/instrument vocabularies and
//! keeps the previous track's tempo and key as the starting point.

use crate::params::{
    random_seed, normalize_tags, TrackRecipe, BPM_MAX, BPM_MIN, DEFAULT_KEY,
    DEFAULT_TIME_SIGNATURE, INSTRUMENTAL_LYRICS, VOCAL_TAGS,
};

const BASE_BPM: u16 = 110;
const BPM_SHIFT: u16 = 30;

const GENRES: &[&str] = &[
    "acoustic", "afrobeat", "ambient", "blues", "bossa nova", "breakbeat", "cinematic",
    "classical", "country", "dark ambient", "deep house", "disco", "downtempo", "dream pop",
    "drum and bass", "dub", "dubstep", "edm", "electronic", "folk", "funk", "future bass",
    "garage", "gospel", "hip hop", "house", "idm", "indie", "indie folk", "indie pop",
    "indie rock", "industrial", "jazz", "latin", "lo-fi", "lounge", "metal", "minimal",
    "neo soul", "new wave", "orchestral", "phonk", "pop", "post rock", "punk", "r&b", "rap",
    "reggae", "rock", "shoegaze", "soul", "synthpop", "techno", "trance", "trap", "trip hop",
    "vaporwave",
];

const MOODS: &[&str] = &[
    "aggressive", "blissful", "bright", "brooding", "calm", "cheerful", "cozy", "dark",
    "dreamy", "driving", "eerie", "emotional", "energetic", "epic", "euphoric", "gentle",
    "groovy", "haunting", "hopeful", "hypnotic", "intense", "intimate", "joyful", "lonely",
    "melancholic", "mellow", "mysterious", "nocturnal", "nostalgic", "peaceful", "playful",
    "powerful", "romantic", "sad", "serene", "smooth", "soothing", "tense", "triumphant",
    "upbeat", "uplifting", "warm", "wistful",
];

const INSTRUMENTS: &[&str] = &[
    "808", "accordion", "acoustic guitar", "bass", "bass guitar", "bells", "brass", "cello",
    "choir", "clarinet", "distorted guitar", "double bass", "drum machine", "drums",
    "electric guitar", "electric piano", "flute", "harp", "horns", "marimba", "organ",
    "percussion", "piano", "rhodes", "saxophone", "sitar", "strings", "sub bass", "synth",
    "synth bass", "synth lead", "synth pad", "trumpet", "ukulele", "vibraphone", "violin",
];

const TEXTURES: &[&str] = &[
    "airy", "analog", "crisp", "dusty", "ethereal", "gritty", "lush", "punchy", "raw",
    "saturated", "tape-saturated", "vintage",
];

const VOCAL_ALIASES: &[(&str, &str)] = &[
    ("female singer", "female vocal"),
    ("male singer", "male vocal"),
    ("female voice", "female vocal"),
    ("male voice", "male vocal"),
    ("female vocals", "female vocal"),
    ("male vocals", "male vocal"),
    ("with vocals", "female vocal"),
];

const MOOD_INSTRUMENTS: &[(&str, &[&str])] = &[
    ("chill", &["synth pad", "electric piano", "drums"]),
    ("energy", &["drums", "synth bass", "electric guitar"]),
    ("focus", &["piano", "synth pad", "strings"]),
    ("sad", &["piano", "strings", "cello"]),
    ("happy", &["acoustic guitar", "piano", "drums"]),
    ("party", &["drums", "synth bass", "808"]),
    ("sleep", &["synth pad", "piano", "strings"]),
];

const SLOW_WORDS: &[&str] = &["slow", "chill", "relax", "ambient", "mellow", "sleep", "dream"];
const FAST_WORDS: &[&str] = &["fast", "energy", "pump", "hype", "dance", "party", "trap"];

const LYRICS_CHILL: &str = "[Verse 1 - smooth]\nDrifting through the evening air\nNothing but the sound of rain\n\n[Chorus]\nLet it wash away\nLet it all just fade";
const LYRICS_ENERGY: &str = "[Verse 1 - powerful]\nFeel the fire burning bright\nEvery step we take ignites\n\n[Chorus - anthemic]\nWe don't stop we rise\nHigher every time";
const LYRICS_SAD: &str = "[Verse 1 - gentle]\nEmpty rooms and fading light\nEchoes of a different time\n\n[Chorus]\nWhere did all the colors go\nI still see them in the snow";
const LYRICS_DEFAULT: &str = "[Verse 1]\nWalking down an open road\nCarrying an easy load\n\n[Chorus]\nLa la la la la\nLa la la la la";

/// `term` appears in `text` delimited by start/end, whitespace, `,` or `.`.
fn contains_word(text: &str, term: &str) -> bool {
    let is_sep = |c: char| c.is_whitespace() || c == ',' || c == '.';
    text.match_indices(term).any(|(start, _)| {
        let end = start + term.len();
        let before = text[..start].chars().next_back().map_or(true, is_sep);
        let after = text[end..].chars().next().map_or(true, is_sep);
        before && after
    })
}

/// Longest terms first, at most `limit` matches.
fn find_terms(text: &str, vocabulary: &[&'static str], limit: usize) -> Vec<&'static str> {
    let mut sorted: Vec<&'static str> = vocabulary.to_vec();
    sorted.sort_by_key(|t| std::cmp::Reverse(t.len()));
    sorted
        .into_iter()
        .filter(|term| contains_word(text, term))
        .take(limit)
        .collect()
}

fn from_previous(previous: Option<&TrackRecipe>, vocabulary: &[&str], limit: usize) -> Vec<String> {
    previous
        .map(|p| {
            p.tag_list()
                .filter(|t| vocabulary.contains(t))
                .take(limit)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Builds a usable recipe from the words of `message` alone.
pub fn keyword_recipe(message: &str, previous: Option<&TrackRecipe>) -> TrackRecipe {
    let msg = message.to_lowercase();

    let mut genres: Vec<String> = find_terms(&msg, GENRES, 2).into_iter().map(String::from).collect();
    let mut moods: Vec<String> = find_terms(&msg, MOODS, 3).into_iter().map(String::from).collect();
    let mut instruments: Vec<String> =
        find_terms(&msg, INSTRUMENTS, 4).into_iter().map(String::from).collect();
    let textures = find_terms(&msg, TEXTURES, 2);

    let vocal = VOCAL_ALIASES
        .iter()
        .find(|(alias, _)| msg.contains(alias))
        .map(|(_, target)| *target)
        .or_else(|| VOCAL_TAGS.iter().copied().find(|v| contains_word(&msg, v)))
        .unwrap_or("instrumental");

    if !moods.is_empty() && instruments.is_empty() {
        if let Some((_, mapped)) = MOOD_INSTRUMENTS.iter().find(|(mood, _)| msg.contains(mood)) {
            instruments = mapped.iter().map(|s| s.to_string()).collect();
        }
    }

    if genres.is_empty() {
        genres = from_previous(previous, GENRES, 2);
    }
    if genres.is_empty() {
        genres.push("atmospheric".to_string());
    }
    if moods.is_empty() {
        moods.push("experimental".to_string());
    }
    if instruments.is_empty() {
        instruments = from_previous(previous, INSTRUMENTS, 3);
    }
    if instruments.is_empty() {
        instruments = vec!["synth pad".to_string(), "drums".to_string()];
    }

    let mut parts: Vec<String> = Vec::new();
    parts.extend(genres);
    parts.extend(moods);
    parts.extend(instruments);
    parts.push(vocal.to_string());
    parts.extend(textures.into_iter().map(String::from));
    let mut warnings = Vec::new();
    let tags = normalize_tags(&parts.join(", "), &mut warnings);

    let base_bpm = previous.map_or(BASE_BPM, |p| p.bpm);
    let bpm = if SLOW_WORDS.iter().any(|w| msg.contains(w)) {
        base_bpm.saturating_sub(BPM_SHIFT).max(BPM_MIN)
    } else if FAST_WORDS.iter().any(|w| msg.contains(w)) {
        (base_bpm + BPM_SHIFT).min(BPM_MAX)
    } else {
        base_bpm
    };

    let instrumental = vocal == "instrumental";
    let lyrics = if instrumental {
        INSTRUMENTAL_LYRICS
    } else if msg.contains("chill") {
        LYRICS_CHILL
    } else if msg.contains("energy") {
        LYRICS_ENERGY
    } else if msg.contains("sad") {
        LYRICS_SAD
    } else {
        LYRICS_DEFAULT
    };

    let excerpt: String = message.chars().take(60).collect();
    TrackRecipe {
        tags,
        lyrics: lyrics.to_string(),
        bpm,
        key_scale: previous.map_or_else(|| DEFAULT_KEY.to_string(), |p| p.key_scale.clone()),
        time_signature: DEFAULT_TIME_SIGNATURE,
        vocal_language: "en".to_string(),
        instrumental,
        rationale: format!("Keyword fallback from: '{excerpt}'"),
        seed: random_seed(),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_boundaries() {
        assert!(contains_word("some jazz, please", "jazz"));
        assert!(contains_word("jazz", "jazz"));
        assert!(!contains_word("something", "thin"));
        assert!(!contains_word("popular", "pop"));
    }

    #[test]
    fn test_genres_moods_and_vocals() {
        let r = keyword_recipe("Smooth jazz with a female singer and piano", None);
        assert_eq!(r.tags, "jazz, smooth, piano, female vocal");
        assert!(!r.instrumental);
        assert_eq!(r.lyrics, LYRICS_DEFAULT);
        assert_eq!(r.bpm, BASE_BPM);
        assert_eq!(r.key_scale, DEFAULT_KEY);
        assert!(r.rationale.starts_with("Keyword fallback from: 'Smooth jazz"));
    }

    #[test]
    fn test_mood_maps_to_instruments() {
        let r = keyword_recipe("something sad and mellow", None);
        assert_eq!(
            r.tags,
            "atmospheric, mellow, sad, piano, strings, cello, instrumental"
        );
        assert!(r.instrumental);
        assert_eq!(r.lyrics, INSTRUMENTAL_LYRICS);
        // "mellow" slows things down
        assert_eq!(r.bpm, BASE_BPM - BPM_SHIFT);
    }

    #[test]
    fn test_previous_track_is_the_base() {
        let previous = keyword_recipe("techno with synth bass", None);
        let previous = TrackRecipe {
            bpm: 170,
            key_scale: "F# Minor".into(),
            ..previous
        };
        let r = keyword_recipe("party!", Some(&previous));
        assert!(r.tags.starts_with("techno, experimental, synth bass"), "{}", r.tags);
        assert_eq!(r.bpm, BPM_MAX);
        assert_eq!(r.key_scale, "F# Minor");
    }
}
