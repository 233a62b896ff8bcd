use serde_json::{json, Value};

use music_analysis::{quantize_rate, ArpRate, Role};

use crate::chunk::Chunk;

/// Canonical playable form of a pattern. The variant is chosen from the
/// track's role: drum grids keep absolute pitches, melodic shapes keep
/// intervals, arps keep rate/contour structure.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Representation {
    Drum {
        steps_per_bar: u8,
        /// (step, pitch, velocity) triples.
        hits: Vec<(u16, u8, u8)>,
    },
    Melodic {
        /// (step, interval-from-first, duration_beats) triples.
        events: Vec<(u16, i8, f64)>,
    },
    Arp {
        rate: ArpRate,
        interval_sequence: Vec<u8>,
        octave_jumps: Vec<i8>,
        gate: f64,
    },
}

/// Build the representation for a chunk based on its role.
pub fn build_representation(chunk: &Chunk, role: Role) -> Representation {
    match role {
        Role::Drums => Representation::Drum {
            steps_per_bar: chunk.steps_per_bar,
            hits: chunk
                .onsets
                .iter()
                .map(|o| (o.step, o.pitch, o.velocity))
                .collect(),
        },
        Role::Arp => arp_representation(chunk),
        _ => melodic_representation(chunk),
    }
}

fn melodic_representation(chunk: &Chunk) -> Representation {
    let first = chunk.first_pitch().unwrap_or(0);
    Representation::Melodic {
        events: chunk
            .onsets
            .iter()
            .map(|o| {
                let interval = (o.pitch as i16 - first as i16).clamp(-64, 63) as i8;
                (o.step, interval, o.duration_beats)
            })
            .collect(),
    }
}

fn arp_representation(chunk: &Chunk) -> Representation {
    let mut starts: Vec<f64> = chunk.onsets.iter().map(|o| o.start_beat).collect();
    starts.sort_by(f64::total_cmp);
    starts.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    let iois: Vec<f64> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    let (rate, _) = quantize_rate(&iois);

    let root = chunk.onsets.iter().map(|o| o.pitch).min().unwrap_or(0);
    let first = chunk.first_pitch().unwrap_or(root);

    let interval_sequence: Vec<u8> = chunk
        .onsets
        .iter()
        .map(|o| ((o.pitch as i16 - root as i16).rem_euclid(12)) as u8)
        .collect();
    let octave_jumps: Vec<i8> = chunk
        .onsets
        .iter()
        .map(|o| ((o.pitch as i16 - first as i16).div_euclid(12)) as i8)
        .collect();

    let step_beats = rate
        .beats()
        .or_else(|| {
            let mut sorted = iois.clone();
            sorted.sort_by(f64::total_cmp);
            sorted.get(sorted.len() / 2).copied()
        })
        .unwrap_or(1.0);
    let mean_duration = if chunk.onsets.is_empty() {
        0.0
    } else {
        chunk.onsets.iter().map(|o| o.duration_beats).sum::<f64>() / chunk.onsets.len() as f64
    };
    let gate = (mean_duration / step_beats).clamp(0.05, 1.0);

    Representation::Arp {
        rate,
        interval_sequence,
        octave_jumps,
        gate,
    }
}

/// Canonical JSON: UTF-8, object keys sorted (serde_json maps are
/// BTreeMap-backed, so serialization order is already sorted).
pub fn to_canonical_json(representation: &Representation) -> String {
    let value = match representation {
        Representation::Drum {
            steps_per_bar,
            hits,
        } => json!({
            "stepsPerBar": steps_per_bar,
            "hits": hits
                .iter()
                .map(|&(step, pitch, vel)| json!({"step": step, "pitch": pitch, "vel": vel}))
                .collect::<Vec<Value>>(),
        }),
        Representation::Melodic { events } => json!({
            "events": events
                .iter()
                .map(|&(step, interval, dur)| {
                    json!({"step": step, "interval": interval, "dur": dur})
                })
                .collect::<Vec<Value>>(),
        }),
        Representation::Arp {
            rate,
            interval_sequence,
            octave_jumps,
            gate,
        } => json!({
            "rate": rate.as_str(),
            "interval_sequence": interval_sequence,
            "octave_jumps": octave_jumps,
            "gate": gate,
        }),
    };
    value.to_string()
}

/// Parse a canonical JSON representation back into its variant, keyed by
/// the shape of the object.
pub fn from_canonical_json(json: &str) -> Option<Representation> {
    let value: Value = serde_json::from_str(json).ok()?;
    let object = value.as_object()?;

    if object.contains_key("hits") {
        let steps_per_bar = object.get("stepsPerBar")?.as_u64()? as u8;
        let hits = object
            .get("hits")?
            .as_array()?
            .iter()
            .map(|h| {
                Some((
                    h.get("step")?.as_u64()? as u16,
                    h.get("pitch")?.as_u64()? as u8,
                    h.get("vel")?.as_u64()? as u8,
                ))
            })
            .collect::<Option<Vec<_>>>()?;
        return Some(Representation::Drum {
            steps_per_bar,
            hits,
        });
    }

    if object.contains_key("events") {
        let events = object
            .get("events")?
            .as_array()?
            .iter()
            .map(|e| {
                Some((
                    e.get("step")?.as_u64()? as u16,
                    e.get("interval")?.as_i64()? as i8,
                    e.get("dur")?.as_f64()?,
                ))
            })
            .collect::<Option<Vec<_>>>()?;
        return Some(Representation::Melodic { events });
    }

    if object.contains_key("rate") {
        let rate_str = object.get("rate")?.as_str()?;
        let rate = [
            ArpRate::Quarter,
            ArpRate::Eighth,
            ArpRate::EighthTriplet,
            ArpRate::Sixteenth,
            ArpRate::SixteenthTriplet,
            ArpRate::ThirtySecond,
            ArpRate::Unknown,
        ]
        .into_iter()
        .find(|r| r.as_str() == rate_str)?;

        let interval_sequence = object
            .get("interval_sequence")?
            .as_array()?
            .iter()
            .map(|v| Some(v.as_u64()? as u8))
            .collect::<Option<Vec<_>>>()?;
        let octave_jumps = object
            .get("octave_jumps")?
            .as_array()?
            .iter()
            .map(|v| Some(v.as_i64()? as i8))
            .collect::<Option<Vec<_>>>()?;
        let gate = object.get("gate")?.as_f64()?;

        return Some(Representation::Arp {
            rate,
            interval_sequence,
            octave_jumps,
            gate,
        });
    }

    None
}
