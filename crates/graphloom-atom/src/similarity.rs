//! Vector similarity helpers

/// Cosine similarity of two vectors; 0.0 for mismatched or zero-norm input.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Entity match score: name similarity mixed with label agreement.
///
/// Labels contribute as exact agreement (1.0 or 0.0); names contribute their
/// embedding similarity. Weights are normalized so the score stays in
/// `[-1, 1]` whatever the configuration says.
pub fn entity_score(name_sim: f32, labels_match: bool, name_weight: f32, label_weight: f32) -> f32 {
    let total = name_weight + label_weight;
    if total <= 0.0 {
        return name_sim;
    }
    let label_sim = if labels_match { 1.0 } else { 0.0 };
    (name_weight * name_sim + label_weight * label_sim) / total
}
