use serde::{Deserialize, Serialize};

/// Musical role a track plays within an arrangement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Drums,
    Bass,
    Chords,
    Lead,
    Arp,
    Pad,
    Other,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Drums,
        Role::Bass,
        Role::Chords,
        Role::Lead,
        Role::Arp,
        Role::Pad,
        Role::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Drums => "drums",
            Role::Bass => "bass",
            Role::Chords => "chords",
            Role::Lead => "lead",
            Role::Arp => "arp",
            Role::Pad => "pad",
            Role::Other => "other",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Role> {
        Role::ALL.iter().copied().find(|r| r.as_str() == s)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probability distribution over roles. Sums to 1.0 within 1e-6.
///
/// Roles are not exclusive: downstream consumers threshold on a
/// probability (typically 0.5) rather than taking the argmax blindly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoleProbs {
    pub drums: f64,
    pub bass: f64,
    pub chords: f64,
    pub lead: f64,
    pub arp: f64,
    pub pad: f64,
    pub other: f64,
}

impl RoleProbs {
    /// Degenerate distribution for tracks with nothing to classify.
    pub fn other_only() -> Self {
        Self {
            drums: 0.0,
            bass: 0.0,
            chords: 0.0,
            lead: 0.0,
            arp: 0.0,
            pad: 0.0,
            other: 1.0,
        }
    }

    pub fn get(&self, role: Role) -> f64 {
        match role {
            Role::Drums => self.drums,
            Role::Bass => self.bass,
            Role::Chords => self.chords,
            Role::Lead => self.lead,
            Role::Arp => self.arp,
            Role::Pad => self.pad,
            Role::Other => self.other,
        }
    }

    pub fn sum(&self) -> f64 {
        Role::ALL.iter().map(|&r| self.get(r)).sum()
    }

    /// Most probable role, ties broken by declaration order of `Role::ALL`.
    pub fn argmax(&self) -> (Role, f64) {
        let mut best = (Role::Drums, self.drums);
        for &role in &Role::ALL[1..] {
            let p = self.get(role);
            if p > best.1 {
                best = (role, p);
            }
        }
        best
    }
}

/// Scalar descriptors of one track. All values finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Features {
    /// Onsets per bar over the whole song.
    pub density: f64,
    /// Time-weighted mean excess voices, scaled by the observed maximum.
    pub polyphony_ratio: f64,
    /// Max pitch minus min pitch, semitones.
    pub pitch_range: f64,
    pub median_pitch: f64,
    /// Off-grid-weight mass per onset.
    pub syncopation: f64,
    /// Mean Jaccard similarity of adjacent one-bar onset sets.
    pub repetition: f64,
    pub drum_likeness: f64,
    /// Interquartile range of inter-onset intervals.
    pub onset_iqr: f64,
    pub mean_duration_beats: f64,
    /// Fraction of onsets landing on the downbeat.
    pub downbeat_ratio: f64,
    /// Fraction of melodic moves that look like broken-chord intervals.
    pub broken_chord_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    Major,
    Minor,
}

impl std::fmt::Display for KeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMode::Major => write!(f, "major"),
            KeyMode::Minor => write!(f, "minor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyEstimate {
    /// Pitch class 0-11 (C=0).
    pub tonic: u8,
    pub mode: KeyMode,
    /// Relative margin of the winning correlation, clamped to [0, 1].
    pub confidence: f64,
    /// Fraction of quartile windows agreeing with the global choice.
    pub stability_samples: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordQuality {
    Maj,
    Min,
    Dim,
    Aug,
    Maj7,
    Min7,
    Dom7,
    Sus4,
}

impl ChordQuality {
    pub const ALL: [ChordQuality; 8] = [
        ChordQuality::Maj,
        ChordQuality::Min,
        ChordQuality::Dim,
        ChordQuality::Aug,
        ChordQuality::Maj7,
        ChordQuality::Min7,
        ChordQuality::Dom7,
        ChordQuality::Sus4,
    ];

    /// Suffix for chord symbol display.
    pub fn suffix(&self) -> &'static str {
        match self {
            ChordQuality::Maj => "",
            ChordQuality::Min => "m",
            ChordQuality::Dim => "dim",
            ChordQuality::Aug => "aug",
            ChordQuality::Maj7 => "maj7",
            ChordQuality::Min7 => "m7",
            ChordQuality::Dom7 => "7",
            ChordQuality::Sus4 => "sus4",
        }
    }

    pub fn index(&self) -> usize {
        ChordQuality::ALL
            .iter()
            .position(|q| q == self)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordEvent {
    pub start_beat: f64,
    pub end_beat: f64,
    /// Root pitch class 0-11.
    pub root: u8,
    pub quality: ChordQuality,
    /// Roman numeral relative to the detected key, e.g. "V7", "vi".
    pub roman: String,
    pub confidence: f64,
}

/// Named note-division rates an arpeggio can run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpRate {
    Quarter,
    Eighth,
    EighthTriplet,
    Sixteenth,
    SixteenthTriplet,
    ThirtySecond,
    Unknown,
}

impl ArpRate {
    pub const NAMED: [ArpRate; 6] = [
        ArpRate::Quarter,
        ArpRate::Eighth,
        ArpRate::EighthTriplet,
        ArpRate::Sixteenth,
        ArpRate::SixteenthTriplet,
        ArpRate::ThirtySecond,
    ];

    /// Duration of one step in beats; `None` for `Unknown`.
    pub fn beats(&self) -> Option<f64> {
        match self {
            ArpRate::Quarter => Some(1.0),
            ArpRate::Eighth => Some(0.5),
            ArpRate::EighthTriplet => Some(1.0 / 3.0),
            ArpRate::Sixteenth => Some(0.25),
            ArpRate::SixteenthTriplet => Some(1.0 / 6.0),
            ArpRate::ThirtySecond => Some(0.125),
            ArpRate::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArpRate::Quarter => "1/4",
            ArpRate::Eighth => "1/8",
            ArpRate::EighthTriplet => "1/8T",
            ArpRate::Sixteenth => "1/16",
            ArpRate::SixteenthTriplet => "1/16T",
            ArpRate::ThirtySecond => "1/32",
            ArpRate::Unknown => "unknown",
        }
    }
}

/// One arpeggio window: the broken-chord shape inside a chord span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpDescriptor {
    pub start_beat: f64,
    pub end_beat: f64,
    /// Root the intervals are measured from.
    pub root_pitch: u8,
    pub rate: ArpRate,
    /// Semitone offsets from the root, mod 12, one per onset.
    pub interval_sequence: Vec<u8>,
    /// Octave index of each onset relative to the first note.
    pub octave_jumps: Vec<i8>,
    /// Mean duration/rate, clipped to [0.05, 1.0].
    pub gate: f64,
}

/// Per-track aggregation over all arp windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpSummary {
    pub dominant_rate: ArpRate,
    pub mean_gate: f64,
    pub common_interval_sequence: Vec<u8>,
    pub window_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Intro,
    Verse,
    Chorus,
    Bridge,
    Outro,
    Unknown,
}

/// A contiguous span of bars. Sections tile a prefix of the song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub start_bar: u32,
    /// Exclusive.
    pub end_bar: u32,
    /// Cluster letter by order of first appearance: A, B, C...
    pub form_label: String,
    pub type_hint: Option<SectionType>,
    pub type_confidence: Option<f64>,
}
