use midi_normalize::Song;
use tracing::debug;

use crate::types::{ChordEvent, Role, RoleProbs, Section, SectionType};

/// Half-width of the novelty comparison window, in bars.
const NOVELTY_WINDOW: usize = 4;

/// Minimum bars between two section boundaries.
const MIN_SEPARATION: u32 = 4;

/// Complete-linkage clustering stops above this cosine distance.
const CLUSTER_THRESHOLD: f64 = 0.4;

/// Segment a song into lettered sections.
///
/// Builds a per-bar feature vector (active tracks, onset density per role,
/// harmonic rhythm), finds novelty peaks between sliding window means, and
/// clusters the resulting spans so repeated material shares a letter.
pub fn segment_sections(
    song: &Song,
    role_probs: &[RoleProbs],
    chords: &[ChordEvent],
) -> Vec<Section> {
    let bar_count = song.bar_count() as usize;
    if bar_count == 0 {
        return Vec::new();
    }

    let vectors = bar_vectors(song, role_probs, chords, bar_count);
    let boundaries = find_boundaries(&vectors, bar_count);

    let spans: Vec<(u32, u32)> = boundaries
        .windows(2)
        .map(|w| (w[0], w[1]))
        .collect();

    let cluster_ids = cluster_spans(&vectors, &spans);
    let labels = letter_labels(&cluster_ids);

    let sections: Vec<Section> = spans
        .iter()
        .zip(labels.iter())
        .map(|(&(start_bar, end_bar), label)| Section {
            start_bar,
            end_bar,
            form_label: label.clone(),
            type_hint: None,
            type_confidence: None,
        })
        .collect();

    let sections = apply_type_hints(sections, &cluster_ids, &vectors);
    debug!(sections = sections.len(), "section segmentation complete");
    sections
}

/// Per-bar feature vector: [active_track_count, role density x7,
/// harmonic_rhythm], each dimension standardized across the song.
fn bar_vectors(
    song: &Song,
    role_probs: &[RoleProbs],
    chords: &[ChordEvent],
    bar_count: usize,
) -> Vec<Vec<f64>> {
    const DIMS: usize = 9;
    let mut vectors = vec![vec![0.0_f64; DIMS]; bar_count];

    for (t, track) in song.tracks.iter().enumerate() {
        let probs = role_probs.get(t).copied().unwrap_or(RoleProbs::other_only());
        let mut bar_onsets = vec![0usize; bar_count];
        for note in &track.note_events {
            let bar = song.bar_of_beat(note.start_beat) as usize;
            if bar < bar_count {
                bar_onsets[bar] += 1;
            }
        }

        for (bar, &count) in bar_onsets.iter().enumerate() {
            if count == 0 {
                continue;
            }
            vectors[bar][0] += 1.0; // active track
            for (r, role) in Role::ALL.iter().enumerate() {
                vectors[bar][1 + r] += count as f64 * probs.get(*role);
            }
        }
    }

    // Harmonic rhythm: chord changes per bar
    for chord in chords {
        let bar = song.bar_of_beat(chord.start_beat) as usize;
        if bar < bar_count {
            vectors[bar][DIMS - 1] += 1.0;
        }
    }

    // Standardize each dimension to zero mean, unit variance. Constant
    // dimensions collapse to zero so they can't mask real contrast.
    for dim in 0..DIMS {
        let mean = vectors.iter().map(|v| v[dim]).sum::<f64>() / bar_count as f64;
        let var = vectors
            .iter()
            .map(|v| (v[dim] - mean) * (v[dim] - mean))
            .sum::<f64>()
            / bar_count as f64;
        let std = var.sqrt();
        for v in &mut vectors {
            v[dim] -= mean;
            if std > 1e-9 {
                v[dim] /= std;
            }
        }
    }

    vectors
}

/// Section boundaries: novelty peaks plus the implicit first and last bar.
fn find_boundaries(vectors: &[Vec<f64>], bar_count: usize) -> Vec<u32> {
    let w = NOVELTY_WINDOW;
    let mut novelty = vec![0.0_f64; bar_count];

    if bar_count > 2 * w {
        for b in w..=(bar_count - w) {
            let before = mean_vector(&vectors[b - w..b]);
            let after = mean_vector(&vectors[b..(b + w).min(bar_count)]);
            novelty[b] = cosine_distance(&before, &after);
        }
    }

    let mean = novelty.iter().sum::<f64>() / bar_count as f64;
    let var = novelty.iter().map(|n| (n - mean) * (n - mean)).sum::<f64>() / bar_count as f64;
    let threshold = mean + var.sqrt();

    // Local maxima above threshold, strongest first, minimum separation
    let mut candidates: Vec<(usize, f64)> = (1..bar_count.saturating_sub(1))
        .filter(|&b| {
            novelty[b] > threshold
                && novelty[b] >= novelty[b - 1]
                && novelty[b] >= novelty[b + 1]
        })
        .map(|b| (b, novelty[b]))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut peaks: Vec<u32> = Vec::new();
    for (bar, _) in candidates {
        let bar = bar as u32;
        if peaks
            .iter()
            .all(|&p| p.abs_diff(bar) >= MIN_SEPARATION)
        {
            peaks.push(bar);
        }
    }

    let mut boundaries: Vec<u32> = vec![0, bar_count as u32];
    boundaries.extend(peaks);
    boundaries.sort_unstable();
    boundaries.dedup();
    boundaries
}

fn mean_vector(rows: &[Vec<f64>]) -> Vec<f64> {
    let dims = rows.first().map(|r| r.len()).unwrap_or(0);
    let mut out = vec![0.0; dims];
    for row in rows {
        for (i, v) in row.iter().enumerate() {
            out[i] += v;
        }
    }
    for v in &mut out {
        *v /= rows.len().max(1) as f64;
    }
    out
}

fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na < 1e-12 || nb < 1e-12 {
        return 0.0;
    }
    1.0 - dot / (na * nb)
}

/// Complete-linkage agglomeration of section mean vectors.
/// Returns a cluster id per span.
fn cluster_spans(vectors: &[Vec<f64>], spans: &[(u32, u32)]) -> Vec<usize> {
    let means: Vec<Vec<f64>> = spans
        .iter()
        .map(|&(start, end)| mean_vector(&vectors[start as usize..end as usize]))
        .collect();

    // Each span starts as its own cluster (membership lists)
    let mut clusters: Vec<Vec<usize>> = (0..spans.len()).map(|i| vec![i]).collect();

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                // Complete linkage: the farthest pair across the two clusters
                let mut max_dist = 0.0_f64;
                for &a in &clusters[i] {
                    for &b in &clusters[j] {
                        max_dist = max_dist.max(cosine_distance(&means[a], &means[b]));
                    }
                }
                if max_dist <= CLUSTER_THRESHOLD
                    && best.map(|(_, _, d)| max_dist < d).unwrap_or(true)
                {
                    best = Some((i, j, max_dist));
                }
            }
        }

        match best {
            Some((i, j, _)) => {
                let merged = clusters.remove(j);
                clusters[i].extend(merged);
            }
            None => break,
        }
    }

    let mut ids = vec![0usize; spans.len()];
    for (cluster_id, members) in clusters.iter().enumerate() {
        for &m in members {
            ids[m] = cluster_id;
        }
    }
    ids
}

/// Map cluster ids to letters by order of first appearance.
fn letter_labels(cluster_ids: &[usize]) -> Vec<String> {
    let mut order: Vec<usize> = Vec::new();
    for &id in cluster_ids {
        if !order.contains(&id) {
            order.push(id);
        }
    }

    cluster_ids
        .iter()
        .map(|id| {
            let idx = order.iter().position(|o| o == id).unwrap_or(0);
            if idx < 26 {
                char::from(b'A' + idx as u8).to_string()
            } else {
                format!("S{idx}")
            }
        })
        .collect()
}

/// Rule-based type hints from cluster size, position, and density.
fn apply_type_hints(
    mut sections: Vec<Section>,
    cluster_ids: &[usize],
    vectors: &[Vec<f64>],
) -> Vec<Section> {
    if sections.is_empty() {
        return sections;
    }

    let density_of = |s: &Section| -> f64 {
        let span = &vectors[s.start_bar as usize..s.end_bar as usize];
        let mean = mean_vector(span);
        mean.iter().sum()
    };

    let song_density = {
        let total: f64 = sections.iter().map(density_of).sum();
        total / sections.len() as f64
    };

    let mut cluster_sizes = vec![0usize; cluster_ids.iter().max().map(|m| m + 1).unwrap_or(0)];
    for &id in cluster_ids {
        cluster_sizes[id] += 1;
    }
    let largest_cluster = cluster_sizes
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        .map(|(id, _)| id);

    let last = sections.len() - 1;
    for (i, section) in sections.iter_mut().enumerate() {
        let id = cluster_ids[i];
        let density = density_of(section);

        let (hint, confidence) = if last > 0 && i == 0 && density < song_density {
            (SectionType::Intro, 0.5)
        } else if last > 0 && i == last && density < song_density {
            (SectionType::Outro, 0.5)
        } else if Some(id) == largest_cluster && cluster_sizes[id] > 1 {
            (SectionType::Verse, 0.4)
        } else if cluster_sizes[id] > 1 && density > song_density {
            (SectionType::Chorus, 0.4)
        } else if cluster_sizes[id] == 1 && i != 0 && i != last {
            (SectionType::Bridge, 0.3)
        } else {
            (SectionType::Unknown, 0.1)
        };

        section.type_hint = Some(hint);
        section.type_confidence = Some(confidence);
    }

    sections
}
