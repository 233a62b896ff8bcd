use std::collections::BTreeMap;

use tracing::debug;

use crate::chunk::Chunk;
use crate::fingerprint::{fingerprint, Fingerprint, RhythmMode};
use crate::representation::build_representation;
use crate::types::{Pattern, PatternInstance, PatternStats, Transform};

/// Rhythm prefilter: candidate pairs must differ in at most this
/// fraction of grid bits.
const HAMMING_PREFILTER: f64 = 0.15;

/// Single-linkage clustering threshold on the blended similarity.
const CLUSTER_THRESHOLD: f64 = 0.85;

const RHYTHM_WEIGHT: f64 = 0.6;
const PITCH_WEIGHT: f64 = 0.4;

/// Intra-song mining: chunks with identical `combo_fp` collapse into one
/// canonical pattern; every occurrence becomes an instance with
/// confidence 1.0.
///
/// The canonical chunk is the first occurrence in (track_id, start_bar,
/// length) order; transposed occurrences record their pitch offset.
pub fn dedup_song(chunks: &[Chunk], mode: RhythmMode) -> (Vec<Pattern>, Vec<PatternInstance>) {
    let mut fingerprinted: Vec<(&Chunk, Fingerprint)> = chunks
        .iter()
        .map(|c| (c, fingerprint(c, mode)))
        .collect();
    fingerprinted.sort_by(|(a, _), (b, _)| {
        a.track_id
            .cmp(&b.track_id)
            .then(a.start_bar.cmp(&b.start_bar))
            .then(a.length_bars.cmp(&b.length_bars))
    });

    // combo_fp -> indices of occurrences, insertion-ordered within key
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, (_, fp)) in fingerprinted.iter().enumerate() {
        groups.entry(fp.combo_fp.clone()).or_default().push(i);
    }

    let mut patterns = Vec::new();
    let mut instances = Vec::new();

    for indices in groups.values() {
        let (canonical_chunk, canonical_fp) = &fingerprinted[indices[0]];
        let canonical_first = canonical_chunk.first_pitch().unwrap_or(0);

        let song_count = 1;
        patterns.push(Pattern {
            pattern_id: canonical_fp.pattern_id.clone(),
            role: canonical_chunk.role,
            length_bars: canonical_chunk.length_bars,
            meter: canonical_chunk.meter,
            grid_resolution: canonical_chunk.steps_per_bar,
            rhythm_fp: canonical_fp.rhythm_fp.clone(),
            pitch_fp: canonical_fp.pitch_fp.clone(),
            combo_fp: canonical_fp.combo_fp.clone(),
            representation: build_representation(canonical_chunk, canonical_chunk.role),
            stats: PatternStats {
                instance_count: indices.len() as u32,
                song_count,
                first_pitch: canonical_first,
                rhythm_bits: hex::encode(&canonical_fp.rhythm_bits),
                total_bits: canonical_fp.total_bits,
                pitch_intervals: canonical_fp.pitch_intervals.clone(),
                shape: canonical_fp.shape.clone(),
            },
        });

        for &idx in indices {
            let (chunk, fp) = &fingerprinted[idx];
            let pitch_offset =
                chunk.first_pitch().unwrap_or(0) as i16 - canonical_first as i16;
            instances.push(PatternInstance {
                pattern_id: fp.pattern_id.clone(),
                song_id: chunk.song_id.clone(),
                track_id: chunk.track_id.clone(),
                start_bar: chunk.start_bar,
                confidence: 1.0,
                transform: Transform {
                    pitch_offset,
                    time_scale: 1.0,
                },
            });
        }
    }

    debug!(
        chunks = chunks.len(),
        patterns = patterns.len(),
        "intra-song dedup complete"
    );
    (patterns, instances)
}

/// Cross-corpus mining: near-duplicate patterns merge under one
/// canonical representative.
///
/// Patterns are bucketed by (role, length, meter, grid); within a bucket,
/// pairs passing the rhythm Hamming prefilter are scored as
/// `0.6 * rhythm_sim + 0.4 * pitch_sim` and single-linkage clustered at
/// S >= 0.85. The canonical member has the most instances (ties: lowest
/// pattern_id); every other member's instances are re-parented with
/// confidence = similarity to the canonical and a transposition offset.
pub fn cluster_corpus(
    patterns: Vec<Pattern>,
    instances: Vec<PatternInstance>,
) -> (Vec<Pattern>, Vec<PatternInstance>) {
    // Deterministic working order
    let mut patterns = patterns;
    patterns.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));

    // Buckets of indices by (role, length_bars, meter, grid)
    let mut buckets: BTreeMap<(String, u8, (u8, u8), u8), Vec<usize>> = BTreeMap::new();
    for (i, p) in patterns.iter().enumerate() {
        buckets
            .entry((
                p.role.as_str().to_string(),
                p.length_bars,
                p.meter,
                p.grid_resolution,
            ))
            .or_default()
            .push(i);
    }

    // Union-find over pattern indices
    let mut parent: Vec<usize> = (0..patterns.len()).collect();
    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        if parent[x] != x {
            let root = find(parent, parent[x]);
            parent[x] = root;
        }
        parent[x]
    }

    let mut pair_similarity: BTreeMap<(usize, usize), f64> = BTreeMap::new();

    for indices in buckets.values() {
        for (a_pos, &a) in indices.iter().enumerate() {
            for &b in &indices[a_pos + 1..] {
                let Some(similarity) = similarity(&patterns[a], &patterns[b]) else {
                    continue;
                };
                pair_similarity.insert((a, b), similarity);
                if similarity >= CLUSTER_THRESHOLD {
                    let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
                    if ra != rb {
                        // Lower index wins the root slot for determinism
                        parent[ra.max(rb)] = ra.min(rb);
                    }
                }
            }
        }
    }

    // Collect clusters
    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..patterns.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }

    let mut kept_patterns: Vec<Pattern> = Vec::new();
    // old pattern_id -> (canonical pattern_id, confidence, extra pitch offset)
    let mut remap: BTreeMap<String, (String, f64, i16)> = BTreeMap::new();

    for members in clusters.values() {
        let canonical_idx = *members
            .iter()
            .max_by(|&&a, &&b| {
                patterns[a]
                    .stats
                    .instance_count
                    .cmp(&patterns[b].stats.instance_count)
                    // Ties break toward the lexicographically lowest id
                    .then_with(|| patterns[b].pattern_id.cmp(&patterns[a].pattern_id))
            })
            .unwrap_or(&members[0]);

        let canonical = &patterns[canonical_idx];
        let mut total_instances = 0u32;

        for &m in members {
            let member = &patterns[m];
            total_instances += member.stats.instance_count;

            let confidence = if m == canonical_idx {
                1.0
            } else {
                let key = (m.min(canonical_idx), m.max(canonical_idx));
                pair_similarity.get(&key).copied().unwrap_or(CLUSTER_THRESHOLD)
            };
            let pitch_offset =
                member.stats.first_pitch as i16 - canonical.stats.first_pitch as i16;
            remap.insert(
                member.pattern_id.clone(),
                (canonical.pattern_id.clone(), confidence, pitch_offset),
            );
        }

        let mut kept = canonical.clone();
        kept.stats.instance_count = total_instances;
        kept_patterns.push(kept);
    }

    // Re-parent instances
    let mut song_sets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let kept_instances: Vec<PatternInstance> = instances
        .into_iter()
        .map(|mut inst| {
            if let Some((canonical_id, confidence, offset)) = remap.get(&inst.pattern_id) {
                if *canonical_id != inst.pattern_id {
                    inst.pattern_id = canonical_id.clone();
                    inst.confidence = *confidence;
                    inst.transform.pitch_offset += offset;
                }
            }
            let songs = song_sets.entry(inst.pattern_id.clone()).or_default();
            if !songs.contains(&inst.song_id) {
                songs.push(inst.song_id.clone());
            }
            inst
        })
        .collect();

    for pattern in &mut kept_patterns {
        pattern.stats.song_count = song_sets
            .get(&pattern.pattern_id)
            .map(|s| s.len() as u32)
            .unwrap_or(0);
    }
    kept_patterns.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));

    debug!(patterns = kept_patterns.len(), "cross-corpus clustering complete");
    (kept_patterns, kept_instances)
}

/// Blended similarity, or `None` when the rhythm prefilter rejects the
/// pair.
fn similarity(a: &Pattern, b: &Pattern) -> Option<f64> {
    if a.stats.total_bits != b.stats.total_bits || a.stats.total_bits == 0 {
        return None;
    }

    let bits_a = hex::decode(&a.stats.rhythm_bits).ok()?;
    let bits_b = hex::decode(&b.stats.rhythm_bits).ok()?;
    if bits_a.len() != bits_b.len() {
        return None;
    }

    let differing: u32 = bits_a
        .iter()
        .zip(&bits_b)
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    let hamming_ratio = differing as f64 / a.stats.total_bits as f64;
    if hamming_ratio > HAMMING_PREFILTER {
        return None;
    }

    let rhythm_sim = 1.0 - hamming_ratio;
    let pitch_sim = 1.0
        - normalized_edit_distance(&a.stats.pitch_intervals, &b.stats.pitch_intervals);

    Some(RHYTHM_WEIGHT * rhythm_sim + PITCH_WEIGHT * pitch_sim)
}

/// Levenshtein distance over interval sequences, scaled to [0, 1].
fn normalized_edit_distance(a: &[i8], b: &[i8]) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()] as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::StepOnset;
    use music_analysis::Role;

    fn make_chunk(
        song: &str,
        track: u8,
        start_bar: u32,
        length_bars: u8,
        onsets: Vec<(u16, u8, u8)>,
    ) -> Chunk {
        Chunk {
            song_id: song.to_string(),
            track_id: format!("{song}:{track}"),
            role: Role::Bass,
            start_bar,
            length_bars,
            steps_per_bar: 16,
            meter: (4, 4),
            onsets: onsets
                .into_iter()
                .map(|(step, pitch, velocity)| StepOnset {
                    step,
                    pitch,
                    velocity,
                    start_beat: start_bar as f64 * 4.0 + step as f64 * 0.25,
                    duration_beats: 0.2,
                })
                .collect(),
        }
    }

    fn bass_line(song: &str, start_bar: u32, root: u8) -> Chunk {
        make_chunk(
            song,
            0,
            start_bar,
            2,
            vec![
                (0, root, 100),
                (4, root, 100),
                (8, root + 7, 100),
                (12, root, 100),
                (16, root, 100),
                (20, root + 5, 100),
                (24, root + 7, 100),
                (28, root, 100),
            ],
        )
    }

    #[test]
    fn identical_chunks_collapse_to_one_pattern() {
        let chunks = vec![bass_line("songa", 0, 36), bass_line("songa", 2, 36)];
        let (patterns, instances) = dedup_song(&chunks, RhythmMode::Binary);

        assert_eq!(patterns.len(), 1);
        assert_eq!(instances.len(), 2);
        assert_eq!(patterns[0].stats.instance_count, 2);
        assert!(instances.iter().all(|i| i.confidence == 1.0));
        assert!(instances.iter().all(|i| i.pattern_id == patterns[0].pattern_id));
    }

    #[test]
    fn transposed_repeat_records_pitch_offset() {
        let chunks = vec![bass_line("songa", 0, 36), bass_line("songa", 2, 41)];
        let (patterns, instances) = dedup_song(&chunks, RhythmMode::Binary);

        // Same rhythm, same intervals: one pattern, two instances
        assert_eq!(patterns.len(), 1);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].transform.pitch_offset, 0);
        assert_eq!(instances[1].transform.pitch_offset, 5);
    }

    #[test]
    fn different_material_stays_distinct() {
        let a = bass_line("songa", 0, 36);
        let b = make_chunk(
            "songa",
            0,
            2,
            2,
            vec![(0, 60, 100), (6, 64, 100), (11, 67, 100), (17, 72, 100)],
        );
        let (patterns, instances) = dedup_song(&[a, b], RhythmMode::Binary);
        assert_eq!(patterns.len(), 2);
        assert_eq!(instances.len(), 2);
    }

    #[test]
    fn duplicate_bass_line_across_songs_merges() {
        let (mut patterns_a, mut instances_a) =
            dedup_song(&[bass_line("songa", 0, 36)], RhythmMode::Binary);
        let (patterns_b, instances_b) =
            dedup_song(&[bass_line("songb", 4, 36)], RhythmMode::Binary);
        patterns_a.extend(patterns_b);
        instances_a.extend(instances_b);

        let (patterns, instances) = cluster_corpus(patterns_a, instances_a);

        assert_eq!(patterns.len(), 1);
        assert_eq!(instances.len(), 2);
        assert_eq!(patterns[0].stats.instance_count, 2);
        assert_eq!(patterns[0].stats.song_count, 2);
        assert!(instances.iter().all(|i| i.pattern_id == patterns[0].pattern_id));
    }

    #[test]
    fn near_duplicate_merges_with_similarity_confidence() {
        // One differing grid bit out of 32, same pitch count
        let a = bass_line("songa", 0, 36);
        let mut b = bass_line("songb", 0, 36);
        b.onsets[5].step = 21; // shift one onset by a 16th
        b.onsets[5].start_beat += 0.25;

        let (mut pa, mut ia) = dedup_song(&[a], RhythmMode::Binary);
        let (pb, ib) = dedup_song(&[b], RhythmMode::Binary);
        pa.extend(pb);
        ia.extend(ib);

        let (patterns, instances) = cluster_corpus(pa, ia);
        assert_eq!(patterns.len(), 1);

        let non_canonical: Vec<&PatternInstance> =
            instances.iter().filter(|i| i.confidence < 1.0).collect();
        assert_eq!(non_canonical.len(), 1);
        assert!(non_canonical[0].confidence >= CLUSTER_THRESHOLD);
    }

    #[test]
    fn distant_rhythms_never_pair() {
        let a = bass_line("songa", 0, 36);
        // Completely different rhythm: offbeat 8ths
        let b = make_chunk(
            "songb",
            0,
            0,
            2,
            vec![(2, 36, 100), (6, 36, 100), (10, 43, 100), (14, 36, 100), (18, 36, 100), (22, 41, 100), (26, 43, 100), (30, 36, 100)],
        );

        let (mut pa, mut ia) = dedup_song(&[a], RhythmMode::Binary);
        let (pb, ib) = dedup_song(&[b], RhythmMode::Binary);
        pa.extend(pb);
        ia.extend(ib);

        let (patterns, _) = cluster_corpus(pa, ia);
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn canonical_selection_prefers_higher_instance_count() {
        // Song A has the line twice, song B once with a tiny variation
        let (mut pa, mut ia) = dedup_song(
            &[bass_line("songa", 0, 36), bass_line("songa", 2, 36)],
            RhythmMode::Binary,
        );
        let mut varied = bass_line("songb", 0, 36);
        varied.onsets[5].step = 21;
        varied.onsets[5].start_beat += 0.25;
        let (pb, ib) = dedup_song(&[varied], RhythmMode::Binary);

        let a_id = pa[0].pattern_id.clone();
        pa.extend(pb);
        ia.extend(ib);

        let (patterns, _) = cluster_corpus(pa, ia);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_id, a_id);
    }

    #[test]
    fn rerun_produces_identical_output() {
        let chunks = vec![
            bass_line("songa", 0, 36),
            bass_line("songa", 2, 36),
            bass_line("songb", 0, 41),
        ];
        let run = || {
            let (p, i) = dedup_song(&chunks, RhythmMode::Binary);
            cluster_corpus(p, i)
        };
        let (p1, i1) = run();
        let (p2, i2) = run();
        assert_eq!(p1, p2);
        assert_eq!(i1, i2);
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(normalized_edit_distance(&[], &[]), 0.0);
        assert_eq!(normalized_edit_distance(&[0, 4, 7], &[0, 4, 7]), 0.0);
        assert_eq!(normalized_edit_distance(&[0, 4, 7], &[0, 3, 7]), 1.0 / 3.0);
        assert_eq!(normalized_edit_distance(&[0], &[0, 4]), 0.5);
    }
}
