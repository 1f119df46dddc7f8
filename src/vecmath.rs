/*
 * Chaffee Ingest - Podcast Catalog Ingestion Pipeline
 * Copyright (c) 2024 Meeting Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! Small vector-math helpers shared by the diarizer, speaker identifier and
//! segment store's similarity-ranked reads. Grounded in the cosine-similarity
//! helper used throughout `rust_native_diarization.rs`'s speaker-matching code.

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

pub fn mean_vector(vectors: &[Vec<f32>]) -> Vec<f32> {
    assert!(!vectors.is_empty());
    let dim = vectors[0].len();
    let mut acc = vec![0.0f32; dim];
    for v in vectors {
        for (a, b) in acc.iter_mut().zip(v.iter()) {
            *a += b;
        }
    }
    let n = vectors.len() as f32;
    for a in acc.iter_mut() {
        *a /= n;
    }
    acc
}

/// Sample variance of per-vector cosine distance from the mean, used by the
/// Speaker Identifier to detect a diarizer-merged cluster.
pub fn cosine_distance_variance(vectors: &[Vec<f32>], centroid: &[f32]) -> f32 {
    if vectors.len() < 2 {
        return 0.0;
    }
    let distances: Vec<f32> = vectors
        .iter()
        .map(|v| 1.0 - cosine_similarity(v, centroid))
        .collect();
    let mean: f32 = distances.iter().sum::<f32>() / distances.len() as f32;
    distances.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / distances.len() as f32
}
