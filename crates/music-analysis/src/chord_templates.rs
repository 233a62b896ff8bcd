use crate::types::{ChordQuality, KeyEstimate, KeyMode};

/// A chord template: quality + interval set from the root as a bitmask
/// over the 12 pitch classes.
pub struct ChordTemplate {
    pub quality: ChordQuality,
    pub intervals: u16,
    pub size: usize,
}

impl ChordTemplate {
    const fn new(quality: ChordQuality, intervals: &[u8]) -> Self {
        let mut mask = 0u16;
        let mut i = 0;
        while i < intervals.len() {
            mask |= 1 << intervals[i];
            i += 1;
        }
        Self {
            quality,
            intervals: mask,
            size: intervals.len(),
        }
    }

    pub fn contains(&self, interval: u8) -> bool {
        self.intervals & (1 << (interval % 12)) != 0
    }
}

/// The candidate chord set, one template per recognized quality.
pub static TEMPLATES: &[ChordTemplate] = &[
    ChordTemplate::new(ChordQuality::Maj, &[0, 4, 7]),
    ChordTemplate::new(ChordQuality::Min, &[0, 3, 7]),
    ChordTemplate::new(ChordQuality::Dim, &[0, 3, 6]),
    ChordTemplate::new(ChordQuality::Aug, &[0, 4, 8]),
    ChordTemplate::new(ChordQuality::Maj7, &[0, 4, 7, 11]),
    ChordTemplate::new(ChordQuality::Min7, &[0, 3, 7, 10]),
    ChordTemplate::new(ChordQuality::Dom7, &[0, 4, 7, 10]),
    ChordTemplate::new(ChordQuality::Sus4, &[0, 5, 7]),
];

pub fn template_for(quality: ChordQuality) -> &'static ChordTemplate {
    &TEMPLATES[quality.index()]
}

const MAJOR_SCALE: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
const NATURAL_MINOR_SCALE: [u8; 7] = [0, 2, 3, 5, 7, 8, 10];

/// Scale pitch classes of a key, absolute (not relative to tonic).
pub fn scale_of(key: &KeyEstimate) -> [u8; 7] {
    let base = match key.mode {
        KeyMode::Major => MAJOR_SCALE,
        KeyMode::Minor => NATURAL_MINOR_SCALE,
    };
    let mut out = [0u8; 7];
    for (i, &deg) in base.iter().enumerate() {
        out[i] = (deg + key.tonic) % 12;
    }
    out
}

/// A chord is diatonic when every chord tone lies in the key's scale.
pub fn is_diatonic(root: u8, quality: ChordQuality, key: &KeyEstimate) -> bool {
    let scale = scale_of(key);
    let template = template_for(quality);
    (0..12u8)
        .filter(|&i| template.contains(i))
        .all(|i| scale.contains(&((root + i) % 12)))
}

const NUMERALS: [&str; 7] = ["I", "II", "III", "IV", "V", "VI", "VII"];

/// Roman numeral of a chord relative to a key.
///
/// Minor and diminished chords use lower case; out-of-scale roots are
/// spelled as the flat of the next scale degree.
pub fn roman_numeral(root: u8, quality: ChordQuality, key: &KeyEstimate) -> String {
    let degree = (root + 12 - key.tonic) % 12;
    let base = match key.mode {
        KeyMode::Major => MAJOR_SCALE,
        KeyMode::Minor => NATURAL_MINOR_SCALE,
    };

    let (prefix, numeral) = match base.iter().position(|&d| d == degree) {
        Some(i) => ("", NUMERALS[i]),
        // Any chromatic pc is one semitone under some scale degree
        None => {
            let i = base
                .iter()
                .position(|&d| d == (degree + 1) % 12)
                .unwrap_or(0);
            ("b", NUMERALS[i])
        }
    };

    let lowercase = matches!(
        quality,
        ChordQuality::Min | ChordQuality::Min7 | ChordQuality::Dim
    );
    let numeral = if lowercase {
        numeral.to_lowercase()
    } else {
        numeral.to_string()
    };

    let suffix = match quality {
        ChordQuality::Maj | ChordQuality::Min => "",
        ChordQuality::Dim => "\u{00b0}",
        ChordQuality::Aug => "+",
        ChordQuality::Maj7 => "maj7",
        ChordQuality::Min7 => "7",
        ChordQuality::Dom7 => "7",
        ChordQuality::Sus4 => "sus4",
    };

    format!("{prefix}{numeral}{suffix}")
}

const NOTE_NAMES_SHARP: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];
const NOTE_NAMES_FLAT: [&str; 12] = [
    "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
];

/// Pitch classes conventionally spelled with flats.
pub static FLAT_KEY_ROOTS: [u8; 6] = [1, 3, 5, 6, 8, 10];

pub fn note_name(pitch_class: u8, use_flats: bool) -> &'static str {
    let idx = (pitch_class % 12) as usize;
    if use_flats {
        NOTE_NAMES_FLAT[idx]
    } else {
        NOTE_NAMES_SHARP[idx]
    }
}
